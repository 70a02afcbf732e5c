/* src/engine/mod.rs */
//! # Likelihood evaluation engine boundary
//!
//! The harness never computes likelihoods itself. It sizes a context through a
//! [`ContextSpec`], loads the workload through the [`LikelihoodContext`] setters,
//! and drives the timed phases through the update and likelihood calls. Any
//! implementation of [`LikelihoodEngine`] can be benchmarked; [`cpu::CpuEngine`]
//! is the reference implementation shipped with the crate.
//!
//! Capability negotiation uses [`EngineFlags`]: a resource advertises what it
//! supports, a context is created with *required* flags (all must be granted)
//! and *preferred* flags (granted when supported), and the resolved set is
//! reported back in [`InstanceDetails`].
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

pub mod cpu;

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::EigenDecomposition;
use crate::schedule::Operation;

pub use cpu::CpuEngine;

// =====================================================================================
// CAPABILITY FLAGS
// =====================================================================================

/// Bitset of implementation characteristics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineFlags(u32);

impl EngineFlags {
    /// 32-bit arithmetic
    pub const PRECISION_SINGLE: Self = Self(1 << 0);
    /// 64-bit arithmetic
    pub const PRECISION_DOUBLE: Self = Self(1 << 1);
    /// Scalar kernels
    pub const VECTOR_NONE: Self = Self(1 << 2);
    /// SSE-vectorized kernels
    pub const VECTOR_SSE: Self = Self(1 << 3);
    /// Caller-managed scaling buffers
    pub const SCALING_MANUAL: Self = Self(1 << 4);
    /// Engine-managed scaling buffers
    pub const SCALING_AUTO: Self = Self(1 << 5);
    /// Cumulative scale factors maintained during the partials pass
    pub const SCALING_DYNAMIC: Self = Self(1 << 6);

    const NAMES: [(Self, &'static str); 7] = [
        (Self::PRECISION_SINGLE, "PRECISION_SINGLE"),
        (Self::PRECISION_DOUBLE, "PRECISION_DOUBLE"),
        (Self::VECTOR_NONE, "VECTOR_NONE"),
        (Self::VECTOR_SSE, "VECTOR_SSE"),
        (Self::SCALING_MANUAL, "SCALING_MANUAL"),
        (Self::SCALING_AUTO, "SCALING_AUTO"),
        (Self::SCALING_DYNAMIC, "SCALING_DYNAMIC"),
    ];

    /// No flags set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether every flag of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Flags of `self` missing from `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Names of the set flags, lowest bit first.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for EngineFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EngineFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EngineFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for EngineFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EngineFlags({})", self.names().join(" | "))
    }
}

impl fmt::Display for EngineFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(" "))
    }
}

// =====================================================================================
// RESOURCES AND CONTEXTS
// =====================================================================================

/// A hardware or software target able to host evaluation contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource number used to request contexts
    pub number: usize,
    /// Short resource name
    pub name: String,
    /// Longer human-readable description
    pub description: String,
    /// Every capability the resource can grant
    pub support_flags: EngineFlags,
}

/// Buffer sizing and capability request for a new context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSpec {
    /// Number of tips
    pub tip_count: usize,
    /// Number of dense partials buffers
    pub partials_buffer_count: usize,
    /// Number of compact tip-state buffers
    pub compact_buffer_count: usize,
    /// Number of states
    pub state_count: usize,
    /// Number of site patterns
    pub pattern_count: usize,
    /// Number of eigendecomposition buffers
    pub eigen_buffer_count: usize,
    /// Number of transition matrix buffers
    pub matrix_buffer_count: usize,
    /// Number of rate categories
    pub category_count: usize,
    /// Number of caller-managed scaling buffers
    pub scale_buffer_count: usize,
    /// Resource to create the context on
    pub resource: usize,
    /// Capabilities granted when the resource supports them
    pub preference_flags: EngineFlags,
    /// Capabilities the resource must grant
    pub requirement_flags: EngineFlags,
}

/// What a created context actually is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDetails {
    /// Resource the context lives on
    pub resource_number: usize,
    /// Name of that resource
    pub resource_name: String,
    /// Name of the kernel implementation
    pub implementation_name: String,
    /// Capabilities in effect for this context
    pub flags: EngineFlags,
}

/// Log-likelihood across one edge, optionally with branch-length derivatives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeLikelihood {
    /// Log-likelihood
    pub log_likelihood: f64,
    /// First derivative with respect to the edge length
    pub first_derivative: Option<f64>,
    /// Second derivative with respect to the edge length
    pub second_derivative: Option<f64>,
}

/// Factory of evaluation contexts.
pub trait LikelihoodEngine {
    /// Every resource the engine can create contexts on.
    fn resources(&self) -> Vec<ResourceDescriptor>;

    /// Resource whose timings serve as the speed-up baseline.
    fn reference_resource(&self) -> usize {
        0
    }

    /// Creates a context sized and flagged by `spec`.
    fn create_context(&self, spec: &ContextSpec) -> Result<Box<dyn LikelihoodContext>>;
}

/// One sized evaluation instance. Released when dropped.
pub trait LikelihoodContext {
    /// Resolved identity and capabilities.
    fn details(&self) -> &InstanceDetails;

    /// Loads compact states for a tip.
    fn set_tip_states(&mut self, tip: usize, states: &[i32]) -> Result<()>;

    /// Loads dense partials for a tip.
    fn set_tip_partials(&mut self, tip: usize, partials: &[f64]) -> Result<()>;

    /// Relative rate per category.
    fn set_category_rates(&mut self, rates: &[f64]) -> Result<()>;

    /// Category weights into buffer `index`.
    fn set_category_weights(&mut self, index: usize, weights: &[f64]) -> Result<()>;

    /// Weight per site pattern.
    fn set_pattern_weights(&mut self, weights: &[f64]) -> Result<()>;

    /// State frequencies into buffer `index`.
    fn set_state_frequencies(&mut self, index: usize, frequencies: &[f64]) -> Result<()>;

    /// Eigendecomposition into buffer `index`.
    fn set_eigen_decomposition(&mut self, index: usize, eigen: &EigenDecomposition) -> Result<()>;

    /// Computes the transition matrix (and optionally derivative matrices) of
    /// each edge length into the matching buffer.
    fn update_transition_matrices(
        &mut self,
        eigen_index: usize,
        probability_indices: &[usize],
        first_derivative_indices: Option<&[usize]>,
        second_derivative_indices: Option<&[usize]>,
        edge_lengths: &[f64],
    ) -> Result<()>;

    /// Executes the operations in order. A cumulative index keeps that
    /// buffer up to date with every scaling buffer the operations write.
    fn update_partials(&mut self, operations: &[Operation], cumulative: Option<usize>)
        -> Result<()>;

    /// Zeroes a scaling buffer.
    fn reset_scale_factors(&mut self, cumulative: usize) -> Result<()>;

    /// Adds the log factors of `indices` into `cumulative`, or into the
    /// engine-managed total when `cumulative` is `None`.
    fn accumulate_scale_factors(&mut self, indices: &[usize], cumulative: Option<usize>)
        -> Result<()>;

    /// Log-likelihood integrated at a root buffer.
    fn root_log_likelihood(
        &mut self,
        root: usize,
        category_weights_index: usize,
        frequencies_index: usize,
        cumulative: Option<usize>,
    ) -> Result<f64>;

    /// Log-likelihood across the edge `parent`–`child` with transition matrix
    /// `matrix`, plus derivatives when their matrices are given.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<EdgeLikelihood>;
}
