/* src/config.rs */
//! # Run configuration
//!
//! [`BenchConfig`] replaces the loose collection of command-line booleans with a
//! single structured value. [`BenchConfig::validate`] is the only precondition
//! check: it runs before any model, schedule or context is built, and rejects
//! incompatible combinations such as derivatives on a rooted tree.
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PhyloBenchError, Result};
use crate::scaling::ScalingMode;

/// Floating-point precision required from the evaluation resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit partials and matrices
    Single,
    /// 64-bit partials and matrices
    Double,
}

/// Which resources a run benchmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceSelection {
    /// Every resource the engine exposes, skipping those that fail
    All,
    /// Exactly one resource; failing to acquire it ends the run
    Only(usize),
}

/// Complete parameter set of a benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Number of states in the Markov chain
    pub state_count: usize,
    /// Number of taxa (tips of the tree)
    pub taxa: usize,
    /// Number of site patterns
    pub sites: usize,
    /// Number of rate categories
    pub rate_categories: usize,
    /// Number of timed trials per resource
    pub reps: usize,
    /// Seed of the single random stream
    pub seed: u64,
    /// Partials rescaling strategy
    pub scaling: ScalingMode,
    /// Trials between manual rescaling passes
    pub rescale_frequency: usize,
    /// Explicit resource number, or `None` to scan every resource
    pub resource: Option<usize>,
    /// Require double precision from the resource
    pub double_precision: bool,
    /// Require SSE vectorization from the resource
    pub require_sse: bool,
    /// Number of tips loaded as compact states instead of partials
    pub compact_tips: usize,
    /// Evaluate an edge likelihood instead of the root marginal
    pub unrooted: bool,
    /// Also compute first and second derivatives (unrooted only)
    pub calc_derivatives: bool,
    /// Report per-phase timings
    pub full_timing: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            state_count: 4,
            taxa: 16,
            sites: 10_000,
            rate_categories: 4,
            reps: 5,
            seed: 42,
            scaling: ScalingMode::Off,
            rescale_frequency: 1,
            resource: None,
            double_precision: false,
            require_sse: false,
            compact_tips: 0,
            unrooted: false,
            calc_derivatives: false,
            full_timing: false,
        }
    }
}

impl BenchConfig {
    /// Checks every range and combination constraint of the run.
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str| {
            Err(PhyloBenchError::Configuration(format!(
                "invalid number of {what} supplied"
            )))
        };
        if self.state_count < 2 {
            return invalid("states");
        }
        if self.taxa < 2 {
            return invalid("taxa");
        }
        if self.sites < 1 {
            return invalid("sites");
        }
        if self.rate_categories < 1 {
            return invalid("rates");
        }
        if self.reps < 1 {
            return invalid("reps");
        }
        if self.rescale_frequency < 1 {
            return invalid("rescale-frequency");
        }
        if self.compact_tips > self.taxa {
            return Err(PhyloBenchError::Configuration(format!(
                "compact-tips ({}) cannot exceed taxa ({})",
                self.compact_tips, self.taxa
            )));
        }
        if self.calc_derivatives && !self.unrooted {
            return Err(PhyloBenchError::Configuration(
                "calc-derivs option requires unrooted tree option".to_string(),
            ));
        }
        Ok(())
    }

    /// Precision the resource must provide.
    #[must_use]
    pub fn precision(&self) -> Precision {
        if self.double_precision {
            Precision::Double
        } else {
            Precision::Single
        }
    }

    /// Resources this run benchmarks.
    #[must_use]
    pub fn resource_selection(&self) -> ResourceSelection {
        self.resource
            .map_or(ResourceSelection::All, ResourceSelection::Only)
    }

    /// Loads a configuration file; `.yaml`/`.yml` is parsed as YAML, anything else as JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml" | "yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = BenchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.precision(), Precision::Single);
        assert_eq!(config.resource_selection(), ResourceSelection::All);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let cases: Vec<fn(&mut BenchConfig)> = vec![
            |c| c.state_count = 1,
            |c| c.taxa = 1,
            |c| c.sites = 0,
            |c| c.rate_categories = 0,
            |c| c.reps = 0,
            |c| c.rescale_frequency = 0,
            |c| c.compact_tips = c.taxa + 1,
        ];
        for mutate in cases {
            let mut config = BenchConfig::default();
            mutate(&mut config);
            assert!(matches!(
                config.validate(),
                Err(PhyloBenchError::Configuration(_))
            ));
        }
    }

    #[test]
    fn test_derivatives_require_unrooted() {
        let mut config = BenchConfig {
            calc_derivatives: true,
            ..BenchConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("requires unrooted"));

        config.unrooted = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_compact_tips_may_cover_every_taxon() {
        let config = BenchConfig {
            compact_tips: 16,
            ..BenchConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("bench.yaml");
        let mut file = fs::File::create(&yaml_path).unwrap();
        writeln!(file, "taxa: 32\nscaling: manual\nrescale_frequency: 3").unwrap();
        let config = BenchConfig::from_file(&yaml_path).unwrap();
        assert_eq!(config.taxa, 32);
        assert_eq!(config.scaling, ScalingMode::Manual);
        assert_eq!(config.rescale_frequency, 3);
        assert_eq!(config.sites, 10_000);

        let json_path = dir.path().join("bench.json");
        fs::write(&json_path, r#"{"state_count": 20, "resource": 1}"#).unwrap();
        let config = BenchConfig::from_file(&json_path).unwrap();
        assert_eq!(config.state_count, 20);
        assert_eq!(config.resource_selection(), ResourceSelection::Only(1));
    }

    #[test]
    fn test_malformed_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ taxa: ").unwrap();
        assert!(matches!(
            BenchConfig::from_file(&path),
            Err(PhyloBenchError::Serialization { .. })
        ));
    }
}
