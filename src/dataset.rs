/* src/dataset.rs */
//! # Synthetic dataset
//!
//! Random tip observations and model parameters for the benchmark workload.
//! Everything is drawn from one [`SeededStream`], in a fixed order, so a seed
//! reproduces the same dataset on every resource and every invocation.
//!
//! The values are synthetic load, not a calibrated model: rates, weights and
//! edge lengths are independent uniform draws and are deliberately left
//! unnormalized.
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use rand::{distr::Open01, rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// The single source of randomness of a run.
#[derive(Debug, Clone)]
pub struct SeededStream {
    rng: StdRng,
}

impl SeededStream {
    /// Creates a stream positioned at the start of `seed`'s sequence.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform draw in the open interval (0, 1).
    pub fn unit(&mut self) -> f64 {
        self.rng.sample(Open01)
    }

    /// Uniform state in `[0, state_count)`.
    pub fn state(&mut self, state_count: usize) -> usize {
        self.rng.random_range(0..state_count)
    }

    /// `count` independent unit draws.
    pub fn units(&mut self, count: usize) -> Vec<f64> {
        (0..count).map(|_| self.unit()).collect()
    }
}

/// Observation attached to one tip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TipData {
    /// One state symbol per site
    States(Vec<i32>),
    /// `state_count` probabilities per site, site-major
    Partials(Vec<f64>),
}

/// Random compact tip data: one uniform state per site.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn random_tip_states(stream: &mut SeededStream, sites: usize, state_count: usize) -> Vec<i32> {
    (0..sites)
        .map(|_| stream.state(state_count) as i32)
        .collect()
}

/// Random dense tip data: a one-hot vector per site.
#[must_use]
pub fn random_tip_partials(stream: &mut SeededStream, sites: usize, state_count: usize) -> Vec<f64> {
    let mut partials = vec![0.0; sites * state_count];
    for site in partials.chunks_exact_mut(state_count) {
        site[stream.state(state_count)] = 1.0;
    }
    partials
}

/// Branch lengths, one per edge.
#[must_use]
pub fn draw_edge_lengths(stream: &mut SeededStream, edges: usize) -> Vec<f64> {
    stream.units(edges)
}

/// Dimensions of the generated dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetShape {
    /// Number of tips
    pub taxa: usize,
    /// Number of site patterns
    pub sites: usize,
    /// Number of states
    pub state_count: usize,
    /// Number of rate categories
    pub rate_categories: usize,
    /// Leading tips stored as compact states
    pub compact_tips: usize,
}

/// Tip observations plus per-category and per-site parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticDataset {
    /// One entry per taxon, indexed by tip number
    pub tips: Vec<TipData>,
    /// Relative rate per category
    pub category_rates: Vec<f64>,
    /// Weight per site pattern
    pub pattern_weights: Vec<f64>,
    /// Weight per category
    pub category_weights: Vec<f64>,
}

impl SyntheticDataset {
    /// Draws tips, category rates, pattern weights and category weights, in that order.
    #[must_use]
    pub fn generate(stream: &mut SeededStream, shape: DatasetShape) -> Self {
        let tips = (0..shape.taxa)
            .map(|taxon| {
                if taxon < shape.compact_tips {
                    TipData::States(random_tip_states(stream, shape.sites, shape.state_count))
                } else {
                    TipData::Partials(random_tip_partials(stream, shape.sites, shape.state_count))
                }
            })
            .collect();
        let category_rates = stream.units(shape.rate_categories);
        let pattern_weights = stream.units(shape.sites);
        let category_weights = stream.units(shape.rate_categories);

        Self {
            tips,
            category_rates,
            pattern_weights,
            category_weights,
        }
    }
}
