/* src/engine/cpu.rs */
//! # Reference CPU engine
//!
//! Felsenstein pruning over flat buffers, generic over `f32` and `f64`.
//!
//! Partials buffers are laid out `[category][site][state]`; transition matrices
//! `[category][parent state][child state]`. Compact tips store one state per
//! site, and any state outside `0..N` is a gap (likelihood one for every state).
//!
//! Two resources are exposed:
//!
//! | # | name           | kernel                          | scaling                 |
//! |---|----------------|---------------------------------|-------------------------|
//! | 0 | `CPU`          | serial                          | manual, auto, dynamic   |
//! | 1 | `CPU-threaded` | rayon, parallel over site blocks | manual, dynamic         |
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use std::fmt;
use std::mem;
use std::ops::{Add, Mul};

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, info};

use super::{
    ContextSpec, EdgeLikelihood, EngineFlags, InstanceDetails, LikelihoodContext,
    LikelihoodEngine, ResourceDescriptor,
};
use crate::error::{PhyloBenchError, Result};
use crate::model::EigenDecomposition;
use crate::schedule::Operation;

const SERIAL_RESOURCE: usize = 0;
#[cfg(feature = "parallel")]
const THREADED_RESOURCE: usize = 1;

// =====================================================================================
// ENGINE
// =====================================================================================

/// Engine exposing the serial reference resource and, with the `parallel`
/// feature, a rayon-threaded resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuEngine;

impl CpuEngine {
    /// Creates the engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn vector_flags() -> EngineFlags {
        // SSE2 is part of the x86_64 baseline, so every kernel is compiled with it.
        if cfg!(target_arch = "x86_64") {
            EngineFlags::VECTOR_NONE | EngineFlags::VECTOR_SSE
        } else {
            EngineFlags::VECTOR_NONE
        }
    }

    fn resolve_flags(spec: &ContextSpec, support: EngineFlags) -> Result<EngineFlags> {
        let unavailable = |reason: String| PhyloBenchError::ResourceUnavailable {
            resource: spec.resource,
            reason,
        };

        let missing = spec.requirement_flags.difference(support);
        if !missing.is_empty() {
            return Err(unavailable(format!("unsupported capabilities: {missing}")));
        }
        let precision = EngineFlags::PRECISION_SINGLE | EngineFlags::PRECISION_DOUBLE;
        if spec.requirement_flags.contains(precision) {
            return Err(unavailable("conflicting precision requirements".to_string()));
        }

        let wants = |flag: EngineFlags| {
            spec.requirement_flags.contains(flag)
                || (spec.preference_flags.contains(flag) && support.contains(flag))
        };

        let mut flags = EngineFlags::SCALING_MANUAL;
        flags |= if spec.requirement_flags.contains(EngineFlags::PRECISION_DOUBLE)
            || (!spec.requirement_flags.contains(EngineFlags::PRECISION_SINGLE)
                && spec.preference_flags.contains(EngineFlags::PRECISION_DOUBLE))
        {
            EngineFlags::PRECISION_DOUBLE
        } else {
            EngineFlags::PRECISION_SINGLE
        };
        flags |= if wants(EngineFlags::VECTOR_SSE) {
            EngineFlags::VECTOR_SSE
        } else {
            EngineFlags::VECTOR_NONE
        };
        for scaling in [EngineFlags::SCALING_AUTO, EngineFlags::SCALING_DYNAMIC] {
            if wants(scaling) {
                flags |= scaling;
            }
        }
        Ok(flags)
    }

    fn implementation_name(spec: &ContextSpec, flags: EngineFlags) -> String {
        let mut name = String::from("CPU");
        if spec.resource != SERIAL_RESOURCE {
            name.push_str("-Threaded");
        }
        if flags.contains(EngineFlags::VECTOR_SSE) {
            name.push_str("-SSE");
        }
        let precision = if flags.contains(EngineFlags::PRECISION_DOUBLE) {
            "Double"
        } else {
            "Single"
        };
        format!("{name}-{}State-{precision}", spec.state_count)
    }
}

impl LikelihoodEngine for CpuEngine {
    fn resources(&self) -> Vec<ResourceDescriptor> {
        let precision = EngineFlags::PRECISION_SINGLE | EngineFlags::PRECISION_DOUBLE;
        #[allow(unused_mut)]
        let mut resources = vec![ResourceDescriptor {
            number: SERIAL_RESOURCE,
            name: "CPU".to_string(),
            description: "Serial reference kernels".to_string(),
            support_flags: precision
                | Self::vector_flags()
                | EngineFlags::SCALING_MANUAL
                | EngineFlags::SCALING_AUTO
                | EngineFlags::SCALING_DYNAMIC,
        }];
        #[cfg(feature = "parallel")]
        resources.push(ResourceDescriptor {
            number: THREADED_RESOURCE,
            name: "CPU-threaded".to_string(),
            description: format!(
                "Site-parallel kernels on {} rayon threads",
                rayon::current_num_threads()
            ),
            support_flags: precision
                | EngineFlags::VECTOR_NONE
                | EngineFlags::SCALING_MANUAL
                | EngineFlags::SCALING_DYNAMIC,
        });
        resources
    }

    fn create_context(&self, spec: &ContextSpec) -> Result<Box<dyn LikelihoodContext>> {
        let resource = self
            .resources()
            .into_iter()
            .find(|r| r.number == spec.resource)
            .ok_or_else(|| PhyloBenchError::ResourceUnavailable {
                resource: spec.resource,
                reason: "no such resource".to_string(),
            })?;

        let flags = Self::resolve_flags(spec, resource.support_flags)?;
        let details = InstanceDetails {
            resource_number: resource.number,
            resource_name: resource.name,
            implementation_name: Self::implementation_name(spec, flags),
            flags,
        };
        let parallel = spec.resource != SERIAL_RESOURCE;

        info!(
            resource = details.resource_number,
            implementation = %details.implementation_name,
            flags = %details.flags,
            "Created CPU likelihood context"
        );

        if flags.contains(EngineFlags::PRECISION_DOUBLE) {
            Ok(Box::new(CpuContext::<f64>::new(spec, details, parallel)?))
        } else {
            Ok(Box::new(CpuContext::<f32>::new(spec, details, parallel)?))
        }
    }
}

// =====================================================================================
// KERNEL
// =====================================================================================

/// Floating-point element type of partials and matrices.
trait Real:
    Copy + Send + Sync + PartialOrd + fmt::Debug + Add<Output = Self> + Mul<Output = Self> + 'static
{
    const ZERO: Self;
    const ONE: Self;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Real for f32 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Real for f64 {
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }
}

#[derive(Debug, Clone)]
enum Buffer<R> {
    Empty,
    States(Vec<usize>),
    Partials(Vec<R>),
}

/// Borrowed child of a combination step.
#[derive(Clone, Copy)]
enum Child<'a, R> {
    States(&'a [usize]),
    Partials(&'a [R]),
}

impl<R: Real> Child<'_, R> {
    /// `Σ_j row[j] · L(j)` for the block at `offset`, site `site`.
    #[inline]
    fn contribution(&self, row: &[R], offset: usize, site: usize) -> R {
        match self {
            Child::States(states) => row.get(states[site]).copied().unwrap_or(R::ONE),
            Child::Partials(partials) => {
                let n = row.len();
                row.iter()
                    .zip(&partials[offset..offset + n])
                    .fold(R::ZERO, |acc, (&p, &l)| acc + p * l)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct EigenBuffers {
    values: Vec<f64>,
    vectors: Vec<f64>,
    inverse: Vec<f64>,
}

impl EigenBuffers {
    /// Writes `E · diag(g(λ)) · E⁻¹` into `out`, where `g` depends on the derivative order.
    fn fill<R: Real>(&self, out: &mut [R], rate: f64, length: f64, order: u8) {
        let n = self.values.len();
        let factors: Vec<f64> = self
            .values
            .iter()
            .map(|&lambda| {
                let decay = (lambda * rate * length).exp();
                match order {
                    0 => decay,
                    1 => lambda * rate * decay,
                    _ => (lambda * rate).powi(2) * decay,
                }
            })
            .collect();

        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for (m, factor) in factors.iter().enumerate() {
                    sum += self.vectors[i * n + m] * factor * self.inverse[m * n + j];
                }
                if order == 0 {
                    sum = sum.max(0.0);
                }
                out[i * n + j] = R::from_f64(sum);
            }
        }
    }
}

/// Runs `kernel(block, data)` on every `width`-sized block, in parallel when requested.
fn for_each_block<R, F>(data: &mut [R], width: usize, parallel: bool, kernel: F)
where
    R: Real,
    F: Fn(usize, &mut [R]) + Send + Sync,
{
    #[cfg(feature = "parallel")]
    if parallel {
        data.par_chunks_mut(width)
            .enumerate()
            .for_each(|(k, block)| kernel(k, block));
        return;
    }
    #[cfg(not(feature = "parallel"))]
    let _ = parallel;

    data.chunks_mut(width)
        .enumerate()
        .for_each(|(k, block)| kernel(k, block));
}

/// Evaluates `f` for every site, preserving site order.
fn map_sites<T, F>(sites: usize, parallel: bool, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Send + Sync,
{
    #[cfg(feature = "parallel")]
    if parallel {
        return (0..sites).into_par_iter().map(f).collect();
    }
    #[cfg(not(feature = "parallel"))]
    let _ = parallel;

    (0..sites).map(f).collect()
}

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(PhyloBenchError::Engine(message()))
    }
}

// =====================================================================================
// CONTEXT
// =====================================================================================

struct CpuContext<R: Real> {
    details: InstanceDetails,
    parallel: bool,
    auto_scaling: bool,
    tip_count: usize,
    state_count: usize,
    pattern_count: usize,
    category_count: usize,
    compact_capacity: usize,
    buffers: Vec<Buffer<R>>,
    matrices: Vec<Vec<R>>,
    eigen: Vec<Option<EigenBuffers>>,
    category_rates: Vec<f64>,
    category_weights: Vec<Option<Vec<f64>>>,
    frequencies: Vec<Option<Vec<f64>>>,
    pattern_weights: Vec<f64>,
    scale: Vec<Vec<f64>>,
    auto_scale: Vec<Option<Vec<f64>>>,
    auto_cumulative: Vec<f64>,
}

impl<R: Real> CpuContext<R> {
    fn new(spec: &ContextSpec, details: InstanceDetails, parallel: bool) -> Result<Self> {
        let buffer_count = spec.partials_buffer_count + spec.compact_buffer_count;
        ensure(spec.state_count >= 2, || {
            format!("state count {} is below 2", spec.state_count)
        })?;
        ensure(
            spec.pattern_count > 0 && spec.category_count > 0 && spec.eigen_buffer_count > 0,
            || "pattern, category and eigen buffer counts must be positive".to_string(),
        )?;
        ensure(buffer_count >= spec.tip_count, || {
            format!(
                "{buffer_count} partials and compact buffers cannot hold {} tips",
                spec.tip_count
            )
        })?;

        let block = spec.category_count * spec.state_count * spec.state_count;
        let auto_scaling = details.flags.contains(EngineFlags::SCALING_AUTO);
        debug!(
            buffers = buffer_count,
            matrices = spec.matrix_buffer_count,
            scale_buffers = spec.scale_buffer_count,
            auto_scaling,
            "Allocating CPU context"
        );

        Ok(Self {
            details,
            parallel,
            auto_scaling,
            tip_count: spec.tip_count,
            state_count: spec.state_count,
            pattern_count: spec.pattern_count,
            category_count: spec.category_count,
            compact_capacity: spec.compact_buffer_count,
            buffers: (0..buffer_count).map(|_| Buffer::Empty).collect(),
            matrices: vec![vec![R::ZERO; block]; spec.matrix_buffer_count],
            eigen: vec![None; spec.eigen_buffer_count],
            category_rates: vec![1.0; spec.category_count],
            category_weights: vec![None; spec.eigen_buffer_count],
            frequencies: vec![None; spec.eigen_buffer_count],
            pattern_weights: vec![1.0; spec.pattern_count],
            scale: vec![vec![0.0; spec.pattern_count]; spec.scale_buffer_count],
            auto_scale: if auto_scaling {
                vec![None; buffer_count]
            } else {
                Vec::new()
            },
            auto_cumulative: vec![0.0; spec.pattern_count],
        })
    }

    fn partials_len(&self) -> usize {
        self.category_count * self.pattern_count * self.state_count
    }

    fn check_tip(&self, tip: usize) -> Result<()> {
        ensure(tip < self.tip_count, || {
            format!("tip {tip} out of range (tip count {})", self.tip_count)
        })
    }

    fn check_matrix(&self, index: usize) -> Result<()> {
        ensure(index < self.matrices.len(), || {
            format!(
                "matrix buffer {index} out of range ({} allocated)",
                self.matrices.len()
            )
        })
    }

    fn check_scale(&self, index: usize) -> Result<()> {
        ensure(index < self.scale.len(), || {
            format!(
                "scaling buffer {index} out of range ({} allocated)",
                self.scale.len()
            )
        })
    }

    fn child(&self, index: usize) -> Result<Child<'_, R>> {
        match self.buffers.get(index) {
            Some(Buffer::States(states)) => Ok(Child::States(states)),
            Some(Buffer::Partials(partials)) => Ok(Child::Partials(partials)),
            Some(Buffer::Empty) => Err(PhyloBenchError::Engine(format!(
                "buffer {index} is read before being written"
            ))),
            None => Err(PhyloBenchError::Engine(format!(
                "buffer {index} out of range ({} allocated)",
                self.buffers.len()
            ))),
        }
    }

    fn partials(&self, index: usize) -> Result<&[R]> {
        match self.child(index)? {
            Child::Partials(partials) => Ok(partials),
            Child::States(_) => Err(PhyloBenchError::Engine(format!(
                "buffer {index} holds compact states, not partials"
            ))),
        }
    }

    fn weights_and_frequencies(&self, weights: usize, frequencies: usize) -> Result<(&[f64], &[f64])> {
        let w = self
            .category_weights
            .get(weights)
            .and_then(Option::as_deref)
            .ok_or_else(|| PhyloBenchError::Engine(format!("category weights {weights} not set")))?;
        let f = self
            .frequencies
            .get(frequencies)
            .and_then(Option::as_deref)
            .ok_or_else(|| {
                PhyloBenchError::Engine(format!("state frequencies {frequencies} not set"))
            })?;
        Ok((w, f))
    }

    /// Log scale factor of each site for a likelihood evaluation.
    fn site_scale(&self, cumulative: Option<usize>) -> Result<Option<&[f64]>> {
        match cumulative {
            Some(index) => {
                self.check_scale(index)?;
                Ok(Some(&self.scale[index]))
            }
            None if self.auto_scaling => Ok(Some(&self.auto_cumulative)),
            None => Ok(None),
        }
    }

    /// Every index `op` touches, checked before any buffer is modified.
    fn check_operation(&self, op: &Operation) -> Result<()> {
        ensure(op.destination >= self.tip_count && op.destination < self.buffers.len(), || {
            format!("destination {} is not an internal partials buffer", op.destination)
        })?;
        ensure(op.child1 != op.destination && op.child2 != op.destination, || {
            format!("operation writes buffer {} into itself", op.destination)
        })?;
        self.check_matrix(op.matrix1)?;
        self.check_matrix(op.matrix2)?;
        self.child(op.child1)?;
        self.child(op.child2)?;
        if !self.auto_scaling {
            if let Some(index) = op.write_scaling.or(op.read_scaling) {
                self.check_scale(index)?;
            }
        }
        Ok(())
    }

    /// Combines the children of `op` into `out`.
    fn combine(&self, op: &Operation, out: &mut [R]) -> Result<()> {
        self.check_matrix(op.matrix1)?;
        self.check_matrix(op.matrix2)?;
        let left = self.child(op.child1)?;
        let right = self.child(op.child2)?;
        let m1 = &self.matrices[op.matrix1];
        let m2 = &self.matrices[op.matrix2];
        let n = self.state_count;
        let sites = self.pattern_count;

        for_each_block(out, n, self.parallel, |block, site_out| {
            let category = block / sites;
            let site = block % sites;
            let offset = block * n;
            let matrix = category * n * n;
            for (i, value) in site_out.iter_mut().enumerate() {
                let row1 = &m1[matrix + i * n..matrix + (i + 1) * n];
                let row2 = &m2[matrix + i * n..matrix + (i + 1) * n];
                *value = left.contribution(row1, offset, site) * right.contribution(row2, offset, site);
            }
        });
        Ok(())
    }

    /// Divides each site by its largest entry and returns the log factors.
    fn rescale(&self, partials: &mut [R]) -> Vec<f64> {
        let n = self.state_count;
        let sites = self.pattern_count;
        let mut factors = vec![0.0; sites];
        for (site, factor) in factors.iter_mut().enumerate() {
            let mut max = R::ZERO;
            for category in 0..self.category_count {
                let offset = (category * sites + site) * n;
                for &value in &partials[offset..offset + n] {
                    if value > max {
                        max = value;
                    }
                }
            }
            if max > R::ZERO {
                let inverse = R::from_f64(1.0 / max.to_f64());
                for category in 0..self.category_count {
                    let offset = (category * sites + site) * n;
                    for value in &mut partials[offset..offset + n] {
                        *value = *value * inverse;
                    }
                }
                *factor = max.to_f64().ln();
            }
        }
        factors
    }

    /// Divides each site by previously stored factors.
    fn apply_factors(&self, partials: &mut [R], factors: &[f64]) {
        let n = self.state_count;
        let sites = self.pattern_count;
        for (site, &factor) in factors.iter().enumerate() {
            if factor == 0.0 {
                continue;
            }
            let inverse = R::from_f64((-factor).exp());
            for category in 0..self.category_count {
                let offset = (category * sites + site) * n;
                for value in &mut partials[offset..offset + n] {
                    *value = *value * inverse;
                }
            }
        }
    }

    fn site_likelihood(&self, site: usize, root: &[R], weights: &[f64], frequencies: &[f64]) -> f64 {
        let n = self.state_count;
        let mut likelihood = 0.0;
        for (category, &weight) in weights.iter().enumerate() {
            let offset = (category * self.pattern_count + site) * n;
            let sum: f64 = root[offset..offset + n]
                .iter()
                .zip(frequencies)
                .map(|(&l, &pi)| pi * l.to_f64())
                .sum();
            likelihood += weight * sum;
        }
        likelihood
    }
}

impl<R: Real> LikelihoodContext for CpuContext<R> {
    fn details(&self) -> &InstanceDetails {
        &self.details
    }

    fn set_tip_states(&mut self, tip: usize, states: &[i32]) -> Result<()> {
        self.check_tip(tip)?;
        ensure(states.len() == self.pattern_count, || {
            format!("{} states supplied for {} patterns", states.len(), self.pattern_count)
        })?;
        let in_use = self
            .buffers
            .iter()
            .enumerate()
            .filter(|(i, b)| *i != tip && matches!(b, Buffer::States(_)))
            .count();
        ensure(in_use < self.compact_capacity, || {
            format!("no compact buffer left for tip {tip}")
        })?;

        let n = self.state_count;
        let states = states
            .iter()
            .map(|&s| usize::try_from(s).ok().filter(|&v| v < n).unwrap_or(n))
            .collect();
        self.buffers[tip] = Buffer::States(states);
        Ok(())
    }

    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<()> {
        self.check_tip(tip)?;
        let site_len = self.pattern_count * self.state_count;
        ensure(partials.len() == site_len, || {
            format!("{} partials supplied, expected {site_len}", partials.len())
        })?;

        let mut buffer = Vec::with_capacity(self.partials_len());
        for _ in 0..self.category_count {
            buffer.extend(partials.iter().map(|&p| R::from_f64(p)));
        }
        self.buffers[tip] = Buffer::Partials(buffer);
        Ok(())
    }

    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()> {
        ensure(rates.len() == self.category_count, || {
            format!("{} rates supplied for {} categories", rates.len(), self.category_count)
        })?;
        self.category_rates = rates.to_vec();
        Ok(())
    }

    fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<()> {
        ensure(index < self.category_weights.len(), || {
            format!("category weights buffer {index} out of range")
        })?;
        ensure(weights.len() == self.category_count, || {
            format!("{} weights supplied for {} categories", weights.len(), self.category_count)
        })?;
        self.category_weights[index] = Some(weights.to_vec());
        Ok(())
    }

    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()> {
        ensure(weights.len() == self.pattern_count, || {
            format!("{} weights supplied for {} patterns", weights.len(), self.pattern_count)
        })?;
        self.pattern_weights = weights.to_vec();
        Ok(())
    }

    fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) -> Result<()> {
        ensure(index < self.frequencies.len(), || {
            format!("state frequencies buffer {index} out of range")
        })?;
        ensure(frequencies.len() == self.state_count, || {
            format!("{} frequencies supplied for {} states", frequencies.len(), self.state_count)
        })?;
        self.frequencies[index] = Some(frequencies.to_vec());
        Ok(())
    }

    fn set_eigen_decomposition(&mut self, index: usize, eigen: &EigenDecomposition) -> Result<()> {
        ensure(index < self.eigen.len(), || {
            format!("eigen buffer {index} out of range")
        })?;
        ensure(eigen.state_count == self.state_count, || {
            format!(
                "{}-state decomposition for a {}-state context",
                eigen.state_count, self.state_count
            )
        })?;
        self.eigen[index] = Some(EigenBuffers {
            values: eigen.eigenvalues.iter().copied().collect(),
            vectors: eigen.eigenvectors.iter().copied().collect(),
            inverse: eigen.inverse_eigenvectors.iter().copied().collect(),
        });
        Ok(())
    }

    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        probability_indices: &[usize],
        first_derivative_indices: Option<&[usize]>,
        second_derivative_indices: Option<&[usize]>,
        edge_lengths: &[f64],
    ) -> Result<()> {
        let eigen = self
            .eigen
            .get(eigen_index)
            .cloned()
            .flatten()
            .ok_or_else(|| PhyloBenchError::Engine(format!("eigen buffer {eigen_index} not set")))?;

        let mut targets = vec![(probability_indices, 0_u8)];
        targets.extend(first_derivative_indices.map(|d| (d, 1)));
        targets.extend(second_derivative_indices.map(|d| (d, 2)));

        let block = self.state_count * self.state_count;
        for (indices, order) in targets {
            ensure(indices.len() == edge_lengths.len(), || {
                format!(
                    "{} matrix indices for {} edge lengths",
                    indices.len(),
                    edge_lengths.len()
                )
            })?;
            for (&index, &length) in indices.iter().zip(edge_lengths) {
                self.check_matrix(index)?;
                let rates = &self.category_rates;
                let matrix = &mut self.matrices[index];
                for (category, &rate) in rates.iter().enumerate() {
                    let out = &mut matrix[category * block..(category + 1) * block];
                    eigen.fill(out, rate, length, order);
                }
            }
        }
        Ok(())
    }

    fn update_partials(&mut self, operations: &[Operation], cumulative: Option<usize>) -> Result<()> {
        if let Some(index) = cumulative {
            self.check_scale(index)?;
        }

        for op in operations {
            self.check_operation(op)?;

            // destination is taken only after every index has been validated
            let mut out = match mem::replace(&mut self.buffers[op.destination], Buffer::Empty) {
                Buffer::Partials(existing) => existing,
                _ => vec![R::ZERO; self.partials_len()],
            };
            self.combine(op, &mut out)?;

            if self.auto_scaling {
                let factors = self.rescale(&mut out);
                self.auto_scale[op.destination] = Some(factors);
            } else if let Some(write) = op.write_scaling {
                let factors = self.rescale(&mut out);
                if let Some(cum) = cumulative {
                    for (site, &factor) in factors.iter().enumerate() {
                        let previous = self.scale[write][site];
                        self.scale[cum][site] += factor - previous;
                    }
                }
                self.scale[write] = factors;
            } else if let Some(read) = op.read_scaling {
                self.apply_factors(&mut out, &self.scale[read]);
            }

            self.buffers[op.destination] = Buffer::Partials(out);
        }
        Ok(())
    }

    fn reset_scale_factors(&mut self, cumulative: usize) -> Result<()> {
        self.check_scale(cumulative)?;
        self.scale[cumulative].fill(0.0);
        Ok(())
    }

    fn accumulate_scale_factors(&mut self, indices: &[usize], cumulative: Option<usize>) -> Result<()> {
        match cumulative {
            Some(cum) => {
                self.check_scale(cum)?;
                for &index in indices {
                    self.check_scale(index)?;
                    ensure(index != cum, || {
                        format!("scaling buffer {cum} accumulated into itself")
                    })?;
                    for site in 0..self.pattern_count {
                        let factor = self.scale[index][site];
                        self.scale[cum][site] += factor;
                    }
                }
            }
            None => {
                ensure(self.auto_scaling, || {
                    "engine-managed accumulation requires automatic scaling".to_string()
                })?;
                self.auto_cumulative.fill(0.0);
                for &index in indices {
                    let factors = self
                        .auto_scale
                        .get(index)
                        .and_then(Option::as_ref)
                        .ok_or_else(|| {
                            PhyloBenchError::Engine(format!(
                                "no automatic scale factors for buffer {index}"
                            ))
                        })?;
                    for (total, factor) in self.auto_cumulative.iter_mut().zip(factors) {
                        *total += factor;
                    }
                }
            }
        }
        Ok(())
    }

    fn root_log_likelihood(
        &mut self,
        root: usize,
        category_weights_index: usize,
        frequencies_index: usize,
        cumulative: Option<usize>,
    ) -> Result<f64> {
        let partials = self.partials(root)?;
        let (weights, frequencies) =
            self.weights_and_frequencies(category_weights_index, frequencies_index)?;
        let scale = self.site_scale(cumulative)?;

        let per_site = map_sites(self.pattern_count, self.parallel, |site| {
            let likelihood = self.site_likelihood(site, partials, weights, frequencies);
            likelihood.ln() + scale.map_or(0.0, |s| s[site])
        });

        Ok(per_site
            .iter()
            .zip(&self.pattern_weights)
            .map(|(ll, w)| w * ll)
            .sum())
    }

    fn edge_log_likelihood(
        &mut self,
        parent: usize,
        child: usize,
        matrix: usize,
        first_derivative: Option<usize>,
        second_derivative: Option<usize>,
        category_weights_index: usize,
        frequencies_index: usize,
        cumulative: Option<usize>,
    ) -> Result<EdgeLikelihood> {
        self.check_matrix(matrix)?;
        for index in first_derivative.iter().chain(second_derivative.iter()) {
            self.check_matrix(*index)?;
        }
        let parent_partials = self.partials(parent)?;
        let child_view = self.child(child)?;
        let (weights, frequencies) =
            self.weights_and_frequencies(category_weights_index, frequencies_index)?;
        let scale = self.site_scale(cumulative)?;

        let n = self.state_count;
        let sites = self.pattern_count;
        let p = &self.matrices[matrix];
        let d1 = first_derivative.map(|i| &self.matrices[i][..]);
        let d2 = second_derivative.map(|i| &self.matrices[i][..]);

        // (log-likelihood, first, second) per site
        let per_site = map_sites(sites, self.parallel, |site| {
            let mut likelihood = 0.0;
            let mut num1 = 0.0;
            let mut num2 = 0.0;
            for (category, &weight) in weights.iter().enumerate() {
                let offset = (category * sites + site) * n;
                let base = category * n * n;
                for i in 0..n {
                    let row = base + i * n..base + (i + 1) * n;
                    let upper = weight * frequencies[i] * parent_partials[offset + i].to_f64();
                    likelihood += upper * child_view.contribution(&p[row.clone()], offset, site).to_f64();
                    if let Some(d1) = d1 {
                        num1 += upper * child_view.contribution(&d1[row.clone()], offset, site).to_f64();
                    }
                    if let Some(d2) = d2 {
                        num2 += upper * child_view.contribution(&d2[row], offset, site).to_f64();
                    }
                }
            }
            let ll = likelihood.ln() + scale.map_or(0.0, |s| s[site]);
            let first = num1 / likelihood;
            let second = num2 / likelihood - first * first;
            (ll, first, second)
        });

        let mut result = EdgeLikelihood {
            log_likelihood: 0.0,
            first_derivative: d1.map(|_| 0.0),
            second_derivative: d2.map(|_| 0.0),
        };
        for ((ll, first, second), &w) in per_site.iter().zip(&self.pattern_weights) {
            result.log_likelihood += w * ll;
            if let Some(total) = result.first_derivative.as_mut() {
                *total += w * first;
            }
            if let Some(total) = result.second_derivative.as_mut() {
                *total += w * second;
            }
        }
        Ok(result)
    }
}

impl<R: Real> Drop for CpuContext<R> {
    fn drop(&mut self) {
        debug!(
            resource = self.details.resource_number,
            implementation = %self.details.implementation_name,
            "Released CPU likelihood context"
        );
    }
}
