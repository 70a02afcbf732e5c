/* src/report.rs */
//! # Report formatting
//!
//! Renders benchmark results as the classic console report (header, per
//! resource `logL` and `best run` lines, optional per-phase rows), or as a
//! structured [`BenchReport`] in JSON or YAML for downstream tooling.
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use std::fmt::Write as _;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::config::BenchConfig;
use crate::engine::ResourceDescriptor;
use crate::error::Result;
use crate::harness::{BenchmarkResult, ReferenceTiming, TrialTiming};
use crate::model::SubstitutionModel;
use crate::scaling::ScalingMode;

/// Output encoding of every subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable console report
    #[default]
    Text,
    /// Pretty-printed JSON
    Json,
    /// YAML
    Yaml,
}

fn encode<T: Serialize>(value: &T, format: OutputFormat, text: impl FnOnce() -> String) -> Result<String> {
    match format {
        OutputFormat::Text => Ok(text()),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(value)?),
    }
}

// =====================================================================================
// HOST & HEADER
// =====================================================================================

/// Machine the benchmark ran on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    /// CPU brand string
    pub cpu: String,
    /// Logical CPU count
    pub cores: usize,
    /// Installed memory in GiB
    pub total_memory_gb: f64,
    /// Operating system description
    pub os: String,
}

impl HostInfo {
    /// Queries the running system.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn collect() -> Self {
        let system = sysinfo::System::new_all();
        let cpu = system
            .cpus()
            .first()
            .map_or_else(|| "Unknown".to_string(), |cpu| cpu.brand().trim().to_string());

        Self {
            cpu,
            cores: system.cpus().len(),
            total_memory_gb: system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            os: sysinfo::System::long_os_version().unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

/// Workload description printed before any resource runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHeader {
    /// Number of states
    pub state_count: usize,
    /// Number of taxa
    pub taxa: usize,
    /// Number of site patterns
    pub sites: usize,
    /// Number of rate categories
    pub rate_categories: usize,
    /// Trials per resource
    pub reps: usize,
    /// Requested scaling mode
    pub scaling: ScalingMode,
    /// Random seed
    pub seed: u64,
}

impl RunHeader {
    /// Header of the run described by `config`.
    #[must_use]
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            state_count: config.state_count,
            taxa: config.taxa,
            sites: config.sites,
            rate_categories: config.rate_categories,
            reps: config.reps,
            scaling: config.scaling,
            seed: config.seed,
        }
    }

    /// `Simulating genomic DNA with 16 taxa and 10000 site patterns (5 reps)`.
    #[must_use]
    pub fn describe(&self) -> String {
        let data = if self.state_count == 4 {
            "DNA".to_string()
        } else {
            format!("{}-state data", self.state_count)
        };
        let plural = if self.reps > 1 { "s" } else { "" };
        let scaling = match self.scaling {
            ScalingMode::Off => "",
            ScalingMode::Manual => ", manual scaling",
            ScalingMode::Auto => ", auto scaling",
            ScalingMode::Dynamic => ", dynamic scaling",
        };
        format!(
            "Simulating genomic {data} with {} taxa and {} site patterns ({} rep{plural}{scaling})",
            self.taxa, self.sites, self.reps
        )
    }
}

// =====================================================================================
// BENCHMARK REPORT
// =====================================================================================

/// Reference time divided by resource time, per phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpeedup {
    /// Transition matrix update
    pub transition_matrices: f64,
    /// Partials propagation
    pub partials: f64,
    /// Scale-factor bookkeeping
    pub scale_accumulation: f64,
    /// Root or edge log-likelihood
    pub likelihood: f64,
    /// Whole trial
    pub total: f64,
}

impl PhaseSpeedup {
    /// Speed-up of `timing` against `reference`.
    #[must_use]
    pub fn between(reference: &TrialTiming, timing: &TrialTiming) -> Self {
        // phases can round to zero on coarse clocks; floor at one nanosecond
        let ratio = |r: Duration, t: Duration| r.as_secs_f64() / t.as_secs_f64().max(1e-9);
        Self {
            transition_matrices: ratio(reference.transition_matrices, timing.transition_matrices),
            partials: ratio(reference.partials, timing.partials),
            scale_accumulation: ratio(reference.scale_accumulation, timing.scale_accumulation),
            likelihood: ratio(reference.likelihood, timing.likelihood),
            total: ratio(reference.total, timing.total),
        }
    }
}

/// One resource's result with its speed-up against the reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    /// Raw benchmark result
    pub result: BenchmarkResult,
    /// Present when a reference exists and this is not the reference resource
    pub speedup: Option<PhaseSpeedup>,
}

/// Complete report of a benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchReport {
    /// Workload description
    pub header: RunHeader,
    /// Whether per-phase rows are rendered
    pub full_timing: bool,
    /// One entry per completed resource, in run order
    pub results: Vec<ResourceReport>,
    /// Host the run executed on
    pub host: HostInfo,
    /// RFC 3339 completion time
    pub timestamp: String,
}

impl BenchReport {
    /// Assembles the report; speed-ups are taken against `reference`.
    #[must_use]
    pub fn new(
        config: &BenchConfig,
        results: Vec<BenchmarkResult>,
        reference: Option<&ReferenceTiming>,
    ) -> Self {
        let results = results
            .into_iter()
            .map(|result| {
                let speedup = reference
                    .filter(|r| r.resource != result.resource_number)
                    .map(|r| PhaseSpeedup::between(&r.best, &result.best));
                ResourceReport { result, speedup }
            })
            .collect();

        Self {
            header: RunHeader::from_config(config),
            full_timing: config.full_timing,
            results,
            host: HostInfo::collect(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Renders in the requested format.
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        encode(self, format, || self.to_text_format())
    }

    /// The console report.
    #[must_use]
    pub fn to_text_format(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "\n{}\n\n", self.header.describe());
        for report in &self.results {
            self.write_resource(&mut out, report);
        }
        let _ = writeln!(
            out,
            "Host: {} ({} cores), {:.1} GB, {}",
            self.host.cpu, self.host.cores, self.host.total_memory_gb, self.host.os
        );
        let _ = writeln!(out, "Timestamp: {}", self.timestamp);
        out
    }

    fn write_resource(&self, out: &mut String, report: &ResourceReport) {
        let result = &report.result;
        let _ = writeln!(out, "Using resource {}:", result.resource_number);
        let _ = writeln!(out, "\tRsrc Name : {}", result.resource_name);
        let _ = writeln!(out, "\tImpl Name : {}", result.implementation_name);

        match (result.first_derivative, result.second_derivative) {
            (Some(d1), Some(d2)) => {
                let _ = writeln!(
                    out,
                    "logL = {:.5} d1 = {:.5} d2 = {:.5}",
                    result.log_likelihood, d1, d2
                );
            }
            _ => {
                let _ = writeln!(out, "logL = {:.5} ", result.log_likelihood);
            }
        }

        let best = &result.best;
        let speedup = report.speedup.as_ref();
        out.push_str("best run: ");
        timing_line(out, best.total, speedup.map(|s| s.total), None);
        out.push_str("avg run:  ");
        timing_line(out, result.mean_total, None, None);

        if self.full_timing {
            let total = best.total;
            out.push_str(" transMats:  ");
            timing_line(
                out,
                best.transition_matrices,
                speedup.map(|s| s.transition_matrices),
                Some(total),
            );
            out.push_str(" partials:   ");
            timing_line(out, best.partials, speedup.map(|s| s.partials), Some(total));
            if matches!(result.scaling, ScalingMode::Manual | ScalingMode::Auto) {
                out.push_str(" accScalers: ");
                timing_line(
                    out,
                    best.scale_accumulation,
                    speedup.map(|s| s.scale_accumulation),
                    Some(total),
                );
            }
            out.push_str(" rootLnL:    ");
            timing_line(out, best.likelihood, speedup.map(|s| s.likelihood), Some(total));
        }
        out.push('\n');
    }
}

/// `0.001234s (2.10x CPU) (04.50%)`
fn timing_line(out: &mut String, value: Duration, speedup: Option<f64>, total: Option<Duration>) {
    let _ = write!(out, "{:.6}s", value.as_secs_f64());
    if let Some(speedup) = speedup {
        let _ = write!(out, " ({speedup:.2}x CPU)");
    }
    if let Some(total) = total {
        let percent = value.as_secs_f64() / total.as_secs_f64() * 100.0;
        let _ = write!(out, " ({percent:05.2}%)");
    }
    out.push('\n');
}

// =====================================================================================
// RESOURCE & MODEL LISTINGS
// =====================================================================================

/// Renders the engine's resource list.
pub fn render_resources(resources: &[ResourceDescriptor], format: OutputFormat) -> Result<String> {
    encode(&resources, format, || {
        let mut out = String::from("Available resources:\n");
        for resource in resources {
            let _ = writeln!(out, "\tResource {}:", resource.number);
            let _ = writeln!(out, "\t\tName : {}", resource.name);
            let _ = writeln!(out, "\t\tDesc : {}", resource.description);
            let _ = writeln!(out, "\t\tFlags: {}", resource.support_flags);
        }
        out
    })
}

/// A built substitution model, for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Seed the model was drawn from
    pub seed: u64,
    /// `hadamard` or `general`
    pub construction: String,
    /// The model itself
    pub model: SubstitutionModel,
}

impl ModelSummary {
    /// Wraps a built model.
    #[must_use]
    pub fn new(seed: u64, model: SubstitutionModel) -> Self {
        let construction = if model.eigen.state_count.is_power_of_two() {
            "hadamard"
        } else {
            "general"
        };
        Self {
            seed,
            construction: construction.to_string(),
            model,
        }
    }

    /// Renders in the requested format.
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        encode(self, format, || self.to_text_format())
    }

    fn to_text_format(&self) -> String {
        let eigen = &self.model.eigen;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}-state model ({} construction, seed {})",
            eigen.state_count, self.construction, self.seed
        );
        let _ = writeln!(out, "\nFrequencies:\n{}", format_row(self.model.frequencies.iter()));
        let _ = writeln!(out, "\nEigenvalues:\n{}", format_row(eigen.eigenvalues.iter()));
        out.push_str("\nEigenvectors:\n");
        for r in eigen.eigenvectors.rows() {
            let _ = writeln!(out, "{}", format_row(r.iter()));
        }
        out.push_str("\nInverse eigenvectors:\n");
        for r in eigen.inverse_eigenvectors.rows() {
            let _ = writeln!(out, "{}", format_row(r.iter()));
        }
        out
    }
}

fn format_row<'a>(values: impl Iterator<Item = &'a f64>) -> String {
    values
        .map(|v| format!("{v:>12.6}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineFlags;

    fn timing(total_ms: u64) -> TrialTiming {
        TrialTiming {
            transition_matrices: Duration::from_millis(total_ms / 4),
            partials: Duration::from_millis(total_ms / 2),
            scale_accumulation: Duration::ZERO,
            likelihood: Duration::from_millis(total_ms / 4),
            total: Duration::from_millis(total_ms),
        }
    }

    fn result(resource: usize, total_ms: u64) -> BenchmarkResult {
        BenchmarkResult {
            resource_number: resource,
            resource_name: format!("R{resource}"),
            implementation_name: "CPU-4State-Single".to_string(),
            flags: EngineFlags::PRECISION_SINGLE,
            scaling: ScalingMode::Off,
            best: timing(total_ms),
            mean_total: Duration::from_millis(total_ms + 1),
            trials: 5,
            log_likelihood: -1234.567_891,
            first_derivative: None,
            second_derivative: None,
        }
    }

    #[test]
    fn test_header_variants() {
        let mut header = RunHeader::from_config(&BenchConfig::default());
        assert_eq!(
            header.describe(),
            "Simulating genomic DNA with 16 taxa and 10000 site patterns (5 reps)"
        );
        header.state_count = 20;
        header.reps = 1;
        header.scaling = ScalingMode::Dynamic;
        assert_eq!(
            header.describe(),
            "Simulating genomic 20-state data with 16 taxa and 10000 site patterns (1 rep, dynamic scaling)"
        );
    }

    #[test]
    fn test_speedup_only_for_non_reference() {
        let reference = ReferenceTiming {
            resource: 0,
            best: timing(400),
        };
        let report = BenchReport::new(
            &BenchConfig::default(),
            vec![result(0, 400), result(1, 100)],
            Some(&reference),
        );
        assert!(report.results[0].speedup.is_none());
        let speedup = report.results[1].speedup.unwrap();
        assert!((speedup.total - 4.0).abs() < 1e-12);

        let text = report.to_text_format();
        assert!(text.contains("logL = -1234.56789 \n"));
        assert!(text.contains("best run: 0.400000s\n"));
        assert!(text.contains("best run: 0.100000s (4.00x CPU)\n"));
        assert!(text.contains("Using resource 1:\n\tRsrc Name : R1\n\tImpl Name : CPU-4State-Single\n"));
        assert!(!text.contains("transMats"));
    }

    #[test]
    fn test_full_timing_rows() {
        let config = BenchConfig {
            full_timing: true,
            scaling: ScalingMode::Manual,
            ..BenchConfig::default()
        };
        let mut manual = result(0, 400);
        manual.scaling = ScalingMode::Manual;
        manual.first_derivative = Some(1.5);
        manual.second_derivative = Some(-2.25);
        let report = BenchReport::new(&config, vec![manual], None);
        let text = report.to_text_format();
        assert!(text.contains("logL = -1234.56789 d1 = 1.50000 d2 = -2.25000\n"));
        assert!(text.contains(" transMats:  0.100000s (25.00%)\n"));
        assert!(text.contains(" partials:   0.200000s (50.00%)\n"));
        assert!(text.contains(" accScalers: 0.000000s (00.00%)\n"));
        assert!(text.contains(" rootLnL:    0.100000s (25.00%)\n"));

        let mut off = result(0, 400);
        off.scaling = ScalingMode::Dynamic;
        let report = BenchReport::new(&config, vec![off], None);
        assert!(!report.to_text_format().contains("accScalers"));
    }

    #[test]
    fn test_structured_formats() {
        let report = BenchReport::new(&BenchConfig::default(), vec![result(0, 10)], None);
        let json = report.render(OutputFormat::Json).unwrap();
        let parsed: BenchReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.results.len(), 1);
        let back = &parsed.results[0].result;
        assert_eq!(back.implementation_name, "CPU-4State-Single");
        assert_eq!(back.best, report.results[0].result.best);
        assert!((back.log_likelihood + 1234.567_891).abs() < 1e-9);

        let yaml = report.render(OutputFormat::Yaml).unwrap();
        assert!(yaml.contains("implementation_name: CPU-4State-Single"));
    }

    #[test]
    fn test_model_summary_text() {
        let summary = ModelSummary::new(42, SubstitutionModel::equal_rates(4));
        let text = summary.render(OutputFormat::Text).unwrap();
        assert!(text.starts_with("4-state model (hadamard construction, seed 42)"));
        assert!(text.contains("Inverse eigenvectors:"));
    }
}
