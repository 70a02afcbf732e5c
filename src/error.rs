/* src/error.rs */
//! # Error taxonomy
//!
//! Every fallible operation in the harness reports a [`PhyloBenchError`]. The
//! variants follow the three failure classes of a benchmark run: bad
//! configuration (fail fast, before anything is built), a resource that cannot
//! host an evaluation context (skip or terminate), and a numerical failure
//! while constructing the substitution model.
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use thiserror::Error;

/// Unified error type for the benchmark harness and the reference engine.
#[derive(Error, Debug)]
pub enum PhyloBenchError {
    /// Invalid or incompatible run parameters.
    #[error("Configuration Error: {0}")]
    Configuration(String),

    /// The requested evaluation resource could not host a context.
    #[error("Resource {resource} unavailable: {reason}")]
    ResourceUnavailable {
        /// Resource number that was requested
        resource: usize,
        /// Why the context could not be created
        reason: String,
    },

    /// The substitution model could not be decomposed.
    #[error("Numerical construction failed during {stage}: {detail}")]
    NumericalConstruction {
        /// Construction stage that failed (frequencies, eigensolver, inversion, ...)
        stage: &'static str,
        /// Human-readable description of the failure
        detail: String,
    },

    /// An evaluation context was driven with inconsistent buffers or indices.
    #[error("Engine Error: {0}")]
    Engine(String),

    /// Filesystem failure while reading configuration or writing reports.
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration or report (de)serialization failure.
    #[error("Serialization Error: {message}")]
    Serialization {
        /// Description of the serialization failure
        message: String,
    },
}

impl PhyloBenchError {
    /// Shorthand for a [`PhyloBenchError::NumericalConstruction`].
    pub(crate) fn numerical(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::NumericalConstruction {
            stage,
            detail: detail.into(),
        }
    }

    /// Whether the failure is confined to one resource, so a scan over all
    /// resources may continue with the next one.
    #[must_use]
    pub fn is_resource_scoped(&self) -> bool {
        matches!(
            self,
            Self::ResourceUnavailable { .. } | Self::Engine(_) | Self::NumericalConstruction { .. }
        )
    }
}

impl From<serde_json::Error> for PhyloBenchError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            message: error.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for PhyloBenchError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: error.to_string(),
        }
    }
}

/// A specialized `Result` type for harness operations.
pub type Result<T> = std::result::Result<T, PhyloBenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PhyloBenchError::ResourceUnavailable {
            resource: 3,
            reason: "no such resource".to_string(),
        };
        assert_eq!(err.to_string(), "Resource 3 unavailable: no such resource");

        let err = PhyloBenchError::numerical("inversion", "singular pivot");
        assert_eq!(
            err.to_string(),
            "Numerical construction failed during inversion: singular pivot"
        );
    }

    #[test]
    fn test_resource_scope() {
        assert!(PhyloBenchError::Engine("bad index".into()).is_resource_scoped());
        assert!(!PhyloBenchError::Configuration("taxa".into()).is_resource_scoped());
    }
}
