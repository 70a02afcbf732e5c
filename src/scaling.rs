/* src/scaling.rs */
//! # Scaling policy
//!
//! Partial likelihoods shrink geometrically as they are combined towards the
//! root, so large trees underflow unless every internal node is rescaled. The
//! [`ScalingPolicy`] decides, trial by trial, whether each operation writes a
//! fresh scaling buffer, reuses the previously written one, or neither, and when
//! the cumulative scale factors are reset and re-accumulated.
//!
//! The mode is fixed for a run. Only the per-trial [`ScalingDirective`] changes,
//! and only under [`ScalingMode::Manual`].
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::{EngineFlags, InstanceDetails};
use crate::schedule::Operation;

/// Rescaling strategy of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// No scaling buffers at all
    Off,
    /// Periodic rescaling every `rescale_frequency` trials
    Manual,
    /// Engine-managed scaling, accumulated explicitly every trial
    Auto,
    /// Every operation rescales; the engine keeps the cumulative factors
    Dynamic,
}

impl fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalingMode::Off => "off",
            ScalingMode::Manual => "manual",
            ScalingMode::Auto => "auto",
            ScalingMode::Dynamic => "dynamic",
        };
        f.write_str(name)
    }
}

/// How the cumulative scale factors are brought up to date after the partials pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulation {
    /// Nothing to accumulate this trial
    Skip,
    /// Sum the per-operation buffers into this cumulative buffer
    Into(usize),
    /// Let the engine accumulate into its own automatic-scaling target
    EngineManaged,
}

/// Scaling instructions for one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingDirective {
    /// Operations compute and write their scaling buffer
    pub write: bool,
    /// Operations rescale with their previously written buffer
    pub read: bool,
    /// Reset the cumulative buffer before accumulating
    pub reset_cumulative: bool,
    /// Accumulation step after the partials pass
    pub accumulation: Accumulation,
}

impl ScalingDirective {
    const NONE: Self = Self {
        write: false,
        read: false,
        reset_cumulative: false,
        accumulation: Accumulation::Skip,
    };

    /// Whether this trial has any scale-factor bookkeeping phase.
    #[must_use]
    pub fn touches_cumulative(&self) -> bool {
        self.reset_cumulative || self.accumulation != Accumulation::Skip
    }
}

/// Per-run scaling state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPolicy {
    mode: ScalingMode,
    ntaxa: usize,
    rescale_frequency: usize,
}

impl ScalingPolicy {
    /// Creates the policy for a tree with `ntaxa` tips.
    ///
    /// A zero `rescale_frequency` is treated as one; [`crate::config::BenchConfig::validate`]
    /// rejects it before a policy is ever built.
    #[must_use]
    pub fn new(mode: ScalingMode, ntaxa: usize, rescale_frequency: usize) -> Self {
        Self {
            mode,
            ntaxa,
            rescale_frequency: rescale_frequency.max(1),
        }
    }

    /// Effective mode after negotiation.
    #[must_use]
    pub fn mode(&self) -> ScalingMode {
        self.mode
    }

    /// Applies the capabilities the engine actually granted.
    ///
    /// Automatic scaling is only a preference: when the context does not
    /// advertise it the policy degrades to [`ScalingMode::Off`].
    pub fn negotiate(&mut self, details: &InstanceDetails) {
        if self.mode == ScalingMode::Auto && !details.flags.contains(EngineFlags::SCALING_AUTO) {
            warn!(
                resource = details.resource_number,
                "Resource does not support automatic scaling, continuing without scaling"
            );
            self.mode = ScalingMode::Off;
        }
    }

    /// Flags the context must have.
    #[must_use]
    pub fn required_flags(&self) -> EngineFlags {
        match self.mode {
            ScalingMode::Dynamic => EngineFlags::SCALING_DYNAMIC,
            _ => EngineFlags::empty(),
        }
    }

    /// Flags the context should have if the resource allows it.
    #[must_use]
    pub fn preferred_flags(&self) -> EngineFlags {
        match self.mode {
            ScalingMode::Auto => EngineFlags::SCALING_AUTO,
            _ => EngineFlags::empty(),
        }
    }

    /// Scaling buffers to allocate: one per internal node plus the cumulative one.
    #[must_use]
    pub fn scale_buffer_count(&self) -> usize {
        match self.mode {
            ScalingMode::Manual | ScalingMode::Dynamic => self.ntaxa,
            ScalingMode::Off | ScalingMode::Auto => 0,
        }
    }

    /// Cumulative buffer consulted by the likelihood calculation.
    #[must_use]
    pub fn cumulative_index(&self) -> Option<usize> {
        match self.mode {
            ScalingMode::Manual | ScalingMode::Dynamic => Some(self.ntaxa - 1),
            ScalingMode::Off | ScalingMode::Auto => None,
        }
    }

    /// Cumulative buffer handed to the partials pass itself (dynamic scaling).
    #[must_use]
    pub fn partials_cumulative_index(&self) -> Option<usize> {
        match self.mode {
            ScalingMode::Dynamic => self.cumulative_index(),
            _ => None,
        }
    }

    /// Cumulative buffer reset once before the first trial.
    #[must_use]
    pub fn initial_reset(&self) -> Option<usize> {
        self.partials_cumulative_index()
    }

    /// Buffers summed by the accumulation step.
    ///
    /// Automatic scaling keys its buffers by destination partials buffer,
    /// so the indices are shifted past the tips.
    #[must_use]
    pub fn accumulation_indices(&self) -> Vec<usize> {
        let offset = if self.mode == ScalingMode::Auto {
            self.ntaxa
        } else {
            0
        };
        (0..self.ntaxa - 1).map(|i| i + offset).collect()
    }

    /// Directive for trial `trial`.
    #[must_use]
    pub fn directive(&self, trial: usize) -> ScalingDirective {
        match self.mode {
            ScalingMode::Off => ScalingDirective::NONE,
            ScalingMode::Dynamic => ScalingDirective {
                write: true,
                read: true,
                ..ScalingDirective::NONE
            },
            ScalingMode::Auto => ScalingDirective {
                accumulation: Accumulation::EngineManaged,
                ..ScalingDirective::NONE
            },
            ScalingMode::Manual => {
                let rescale = trial % self.rescale_frequency == 0;
                ScalingDirective {
                    write: rescale,
                    read: !rescale,
                    reset_cumulative: rescale,
                    accumulation: if rescale {
                        Accumulation::Into(self.ntaxa - 1)
                    } else {
                        Accumulation::Skip
                    },
                }
            }
        }
    }

    /// Writes the directive's scaling indices into the operation list.
    pub fn annotate(directive: &ScalingDirective, operations: &mut [Operation]) {
        for (j, op) in operations.iter_mut().enumerate() {
            op.write_scaling = directive.write.then_some(j);
            op.read_scaling = directive.read.then_some(j);
        }
    }
}
