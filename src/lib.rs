/* src/lib.rs */
#![warn(missing_docs)]
//! # phylobench
//!
//! Synthetic-workload benchmark harness for phylogenetic likelihood engines.
//!
//! A run draws a random dataset and substitution model from one seed, builds a
//! post-order operation schedule over a fixed binary tree, and drives it
//! through an evaluation context repeatedly, keeping the best time of every
//! phase. Speed-ups are reported against the engine's reference resource.
//!
//! ```no_run
//! use phylobench::{BenchConfig, BenchmarkSession, CpuEngine};
//!
//! let config = BenchConfig::default();
//! let selection = config.resource_selection();
//! let mut session = BenchmarkSession::new(CpuEngine::new(), config)?;
//! for result in session.run(selection)? {
//!     println!("{}: logL = {:.5}", result.resource_name, result.log_likelihood);
//! }
//! # Ok::<(), phylobench::PhyloBenchError>(())
//! ```
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod harness;
pub mod model;
pub mod report;
pub mod scaling;
pub mod schedule;

pub use config::{BenchConfig, Precision, ResourceSelection};
pub use dataset::{SeededStream, SyntheticDataset, TipData};
pub use engine::{CpuEngine, EngineFlags, LikelihoodContext, LikelihoodEngine};
pub use error::{PhyloBenchError, Result};
pub use harness::{BenchmarkResult, BenchmarkSession, TrialTiming};
pub use model::{EigenDecomposition, SubstitutionModel};
pub use report::{BenchReport, OutputFormat};
pub use scaling::{ScalingMode, ScalingPolicy};
pub use schedule::{Operation, OperationSchedule};
