/* src/schedule.rs */
//! # Operation schedule
//!
//! Builds the post-order plan the evaluation engine executes: a list of
//! "combine two children through their transition matrices" operations over a
//! fixed balanced pairing of the tips, together with the buffer indices for
//! transition matrices (and their derivatives) and the final likelihood target.
//!
//! Buffer layout for `n` taxa:
//!
//! ```text
//! tips            0 ..= n-1
//! internal nodes  n ..= 2n-2      (2n-2 is the root)
//! matrices        0 .. 2n-2       [+ first derivatives, + second derivatives]
//! ```
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use serde::{Deserialize, Serialize};

use crate::error::{PhyloBenchError, Result};

/// One partials-combination step.
///
/// Scaling indices use `None` as the "no buffer" sentinel so that no valid
/// buffer number doubles as a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Partials buffer receiving the combined likelihoods
    pub destination: usize,
    /// Scaling buffer computed and written by this operation
    pub write_scaling: Option<usize>,
    /// Scaling buffer reused (not recomputed) by this operation
    pub read_scaling: Option<usize>,
    /// First child buffer
    pub child1: usize,
    /// Transition matrix applied to the first child
    pub matrix1: usize,
    /// Second child buffer
    pub child2: usize,
    /// Transition matrix applied to the second child
    pub matrix2: usize,
}

/// Where the final log-likelihood is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LikelihoodTarget {
    /// Marginal likelihood at the root buffer
    Root {
        /// Root partials buffer
        root: usize,
    },
    /// Likelihood across the edge between the root and a designated tip
    Edge {
        /// Partials buffer on the parent side (the root)
        parent: usize,
        /// Tip buffer on the child side
        child: usize,
        /// Transition matrix of the edge
        matrix: usize,
        /// First-derivative matrix of the edge, if derivatives are requested
        first_derivative: Option<usize>,
        /// Second-derivative matrix of the edge, if derivatives are requested
        second_derivative: Option<usize>,
    },
}

/// The complete evaluation plan for a tree of `ntaxa` tips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSchedule {
    /// Number of tips
    pub ntaxa: usize,
    /// Post-order combination steps, `ntaxa - 1` of them
    pub operations: Vec<Operation>,
    /// Transition matrix buffer per edge
    pub matrix_indices: Vec<usize>,
    /// First-derivative matrix buffer per edge
    pub first_derivative_indices: Option<Vec<usize>>,
    /// Second-derivative matrix buffer per edge
    pub second_derivative_indices: Option<Vec<usize>>,
    /// Final likelihood evaluation point
    pub target: LikelihoodTarget,
}

impl OperationSchedule {
    /// Builds the schedule, enforcing that derivatives are only requested on an unrooted tree.
    pub fn build(ntaxa: usize, calc_derivatives: bool, unrooted: bool) -> Result<Self> {
        if ntaxa < 2 {
            return Err(PhyloBenchError::Configuration(format!(
                "a tree needs at least 2 taxa, got {ntaxa}"
            )));
        }
        if calc_derivatives && !unrooted {
            return Err(PhyloBenchError::Configuration(
                "derivatives are only available for unrooted trees".to_string(),
            ));
        }

        let edges = 2 * ntaxa - 2;
        let operations = (0..ntaxa - 1)
            .map(|i| Operation {
                destination: ntaxa + i,
                write_scaling: None,
                read_scaling: None,
                child1: 2 * i,
                matrix1: 2 * i,
                child2: 2 * i + 1,
                matrix2: 2 * i + 1,
            })
            .collect();

        let block = |k: usize| (k * edges..(k + 1) * edges).collect::<Vec<_>>();
        let (first_derivative_indices, second_derivative_indices) = if calc_derivatives {
            (Some(block(1)), Some(block(2)))
        } else {
            (None, None)
        };

        let root = 2 * ntaxa - 2;
        let target = if unrooted {
            let last_tip = ntaxa - 1;
            LikelihoodTarget::Edge {
                parent: root,
                child: last_tip,
                matrix: last_tip,
                first_derivative: first_derivative_indices.as_ref().map(|d| d[last_tip]),
                second_derivative: second_derivative_indices.as_ref().map(|d| d[last_tip]),
            }
        } else {
            LikelihoodTarget::Root { root }
        };

        Ok(Self {
            ntaxa,
            operations,
            matrix_indices: block(0),
            first_derivative_indices,
            second_derivative_indices,
            target,
        })
    }

    /// Number of edges, and of primary transition matrices.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        2 * self.ntaxa - 2
    }

    /// Root partials buffer.
    #[must_use]
    pub fn root(&self) -> usize {
        2 * self.ntaxa - 2
    }

    /// Transition matrix buffers to allocate, including derivative blocks.
    #[must_use]
    pub fn matrix_buffer_count(&self) -> usize {
        if self.first_derivative_indices.is_some() {
            3 * self.edge_count()
        } else {
            self.edge_count()
        }
    }

    /// Partials buffers to allocate when `compact_tips` tips are stored as states.
    #[must_use]
    pub fn partials_buffer_count(&self, compact_tips: usize) -> usize {
        (2 * self.ntaxa - 1).saturating_sub(compact_tips)
    }

    /// Whether the final likelihood also yields derivatives.
    #[must_use]
    pub fn computes_derivatives(&self) -> bool {
        self.first_derivative_indices.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_four_taxa_schedule() {
        let schedule = OperationSchedule::build(4, false, false).unwrap();
        assert_eq!(schedule.operations.len(), 3);
        let pairs: Vec<(usize, usize, usize)> = schedule
            .operations
            .iter()
            .map(|op| (op.destination, op.child1, op.child2))
            .collect();
        assert_eq!(pairs, vec![(4, 0, 1), (5, 2, 3), (6, 4, 5)]);
        assert_eq!(schedule.root(), 6);
        assert_eq!(schedule.target, LikelihoodTarget::Root { root: 6 });
        assert_eq!(schedule.matrix_indices, (0..6).collect::<Vec<_>>());
        assert_eq!(schedule.matrix_buffer_count(), 6);
        assert_eq!(schedule.partials_buffer_count(0), 7);
        assert_eq!(schedule.partials_buffer_count(2), 5);
    }

    #[test]
    fn test_derivative_blocks_follow_primary_matrices() {
        let schedule = OperationSchedule::build(5, true, true).unwrap();
        assert_eq!(schedule.matrix_buffer_count(), 24);
        assert_eq!(
            schedule.first_derivative_indices.as_deref(),
            Some(&(8..16).collect::<Vec<_>>()[..])
        );
        assert_eq!(
            schedule.second_derivative_indices.as_deref(),
            Some(&(16..24).collect::<Vec<_>>()[..])
        );
        assert_eq!(
            schedule.target,
            LikelihoodTarget::Edge {
                parent: 8,
                child: 4,
                matrix: 4,
                first_derivative: Some(12),
                second_derivative: Some(20),
            }
        );
    }

    #[test]
    fn test_unrooted_without_derivatives() {
        let schedule = OperationSchedule::build(3, false, true).unwrap();
        assert!(!schedule.computes_derivatives());
        assert!(matches!(
            schedule.target,
            LikelihoodTarget::Edge {
                first_derivative: None,
                second_derivative: None,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_rooted_derivatives_and_tiny_trees() {
        assert!(matches!(
            OperationSchedule::build(4, true, false),
            Err(PhyloBenchError::Configuration(_))
        ));
        assert!(OperationSchedule::build(1, false, false).is_err());
    }

    proptest! {
        #[test]
        fn prop_schedule_is_post_order(ntaxa in 2usize..300) {
            let schedule = OperationSchedule::build(ntaxa, false, false).unwrap();
            prop_assert_eq!(schedule.operations.len(), ntaxa - 1);

            let destinations: Vec<usize> =
                schedule.operations.iter().map(|op| op.destination).collect();
            let expected: Vec<usize> = (ntaxa..=2 * ntaxa - 2).collect();
            prop_assert_eq!(&destinations, &expected);

            let mut produced = HashSet::new();
            for op in &schedule.operations {
                for child in [op.child1, op.child2] {
                    prop_assert!(child < ntaxa || produced.contains(&child));
                }
                prop_assert!(produced.insert(op.destination));
            }
            prop_assert_eq!(schedule.operations.last().map(|op| op.destination), Some(schedule.root()));
        }
    }
}
