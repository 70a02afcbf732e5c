/* src/main.rs */
#![warn(missing_docs)]
//! # phylobench CLI
//!
//! Command-line front-end of the likelihood benchmark harness: runs the
//! benchmark over the CPU engine's resources, lists resources, and prints the
//! substitution model a seed produces. Reports go to stdout, logs to stderr.
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use phylobench::{
    dataset::SeededStream,
    engine::{CpuEngine, LikelihoodEngine},
    report::{render_resources, ModelSummary},
    BenchConfig, BenchReport, BenchmarkSession, OutputFormat, ScalingMode, SubstitutionModel,
};

// =====================================================================================
// CLI CONFIGURATION & ARGUMENTS
// =====================================================================================

/// phylobench - phylogenetic likelihood benchmark harness
#[derive(Parser, Debug)]
#[command(
    name = "phylobench",
    version = env!("CARGO_PKG_VERSION"),
    author = "Lord Xyn <lord.xyn@proton.me>",
    about = "Times repeated likelihood evaluations of a synthetic phylogenetic workload"
)]
struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Configuration file path (.yaml/.yml or .json)
    #[arg(short, long, global = true, env = "PHYLOBENCH_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, default_value = "text", global = true)]
    output_format: OutputFormat,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Benchmark likelihood evaluation on one or every resource
    Run(RunArgs),

    /// List the resources of the CPU engine
    Resources,

    /// Build a substitution model from a fresh stream and print its eigensystem
    Model {
        /// Number of states
        #[arg(long, default_value_t = 4)]
        states: usize,

        /// Random seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

/// Benchmark parameters; anything given here overrides the configuration file.
#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Number of states
    #[arg(long)]
    states: Option<usize>,

    /// Number of taxa
    #[arg(long)]
    taxa: Option<usize>,

    /// Number of site patterns
    #[arg(long)]
    sites: Option<usize>,

    /// Number of rate categories
    #[arg(long)]
    rates: Option<usize>,

    /// Timed trials per resource
    #[arg(long)]
    reps: Option<usize>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Partials rescaling strategy
    #[arg(long, value_enum)]
    scaling: Option<ScalingMode>,

    /// Trials between manual rescaling passes
    #[arg(long)]
    rescale_frequency: Option<usize>,

    /// Benchmark only this resource
    #[arg(long)]
    rsrc: Option<usize>,

    /// Require double precision
    #[arg(long)]
    double_precision: bool,

    /// Require SSE vectorization
    #[arg(long)]
    sse: bool,

    /// Number of tips loaded as compact states
    #[arg(long)]
    compact_tips: Option<usize>,

    /// Evaluate the edge likelihood of an unrooted tree
    #[arg(long)]
    unrooted: bool,

    /// Also compute branch-length derivatives (requires --unrooted)
    #[arg(long = "calc-derivs")]
    calc_derivs: bool,

    /// Report per-phase timings
    #[arg(long)]
    full_timing: bool,

    /// Also write the structured report to this file (.yaml/.yml or .json)
    #[arg(long)]
    report: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, config: &mut BenchConfig) {
        let overrides = [
            (self.states, &mut config.state_count),
            (self.taxa, &mut config.taxa),
            (self.sites, &mut config.sites),
            (self.rates, &mut config.rate_categories),
            (self.reps, &mut config.reps),
            (self.rescale_frequency, &mut config.rescale_frequency),
            (self.compact_tips, &mut config.compact_tips),
        ];
        for (value, field) in overrides {
            if let Some(value) = value {
                *field = value;
            }
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(scaling) = self.scaling {
            config.scaling = scaling;
        }
        if self.rsrc.is_some() {
            config.resource = self.rsrc;
        }
        config.double_precision |= self.double_precision;
        config.require_sse |= self.sse;
        config.unrooted |= self.unrooted;
        config.calc_derivatives |= self.calc_derivs;
        config.full_timing |= self.full_timing;
    }
}

/// Log level configuration
#[derive(ValueEnum, Clone, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

// =====================================================================================
// COMMANDS
// =====================================================================================

/// Execute the benchmark
fn cmd_run(args: &RunArgs, config_path: Option<&Path>, format: OutputFormat) -> Result<()> {
    let mut config = load_config(config_path)?;
    args.apply(&mut config);
    config
        .validate()
        .context("Invalid benchmark configuration")?;

    let selection = config.resource_selection();
    let mut session = BenchmarkSession::new(CpuEngine::new(), config)?;
    let results = session.run(selection).context("Benchmark run failed")?;
    info!(resources = results.len(), "Benchmark complete");

    let report = BenchReport::new(session.config(), results, session.reference());
    emit(&report.render(format)?)?;

    if let Some(path) = &args.report {
        let structured = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml" | "yml") => report.render(OutputFormat::Yaml)?,
            _ => report.render(OutputFormat::Json)?,
        };
        fs::write(path, structured)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }
    Ok(())
}

/// List engine resources
fn cmd_resources(format: OutputFormat) -> Result<()> {
    let resources = CpuEngine::new().resources();
    emit(&render_resources(&resources, format)?)
}

/// Build and print a model
fn cmd_model(states: usize, seed: u64, format: OutputFormat) -> Result<()> {
    let model = SubstitutionModel::build(states, &mut SeededStream::new(seed))
        .with_context(|| format!("Failed to build a {states}-state model"))?;
    emit(&ModelSummary::new(seed, model).render(format)?)
}

fn emit(rendered: &str) -> Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(rendered.as_bytes())?;
    if !rendered.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

// =====================================================================================
// MAIN APPLICATION ENTRY POINT
// =====================================================================================

/// Setup logging configuration
fn setup_logging(args: &Args) -> Result<()> {
    let level = Level::from(args.log_level.clone());
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let registry = tracing_subscriber::registry().with(filter);

    if args.log_json {
        registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .try_init()?;
    }
    Ok(())
}

/// Load benchmark configuration
fn load_config(config_path: Option<&Path>) -> Result<BenchConfig> {
    match config_path {
        Some(path) => BenchConfig::from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display())),
        None => Ok(BenchConfig::default()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args)?;

    match &args.command {
        Commands::Run(run) => cmd_run(run, args.config.as_deref(), args.output_format),
        Commands::Resources => cmd_resources(args.output_format),
        Commands::Model { states, seed } => cmd_model(*states, *seed, args.output_format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_flags() {
        let args = Args::try_parse_from([
            "phylobench",
            "run",
            "--states",
            "20",
            "--taxa",
            "32",
            "--scaling",
            "manual",
            "--rescale-frequency",
            "4",
            "--rsrc",
            "1",
            "--unrooted",
            "--calc-derivs",
            "--full-timing",
        ])
        .unwrap();
        let Commands::Run(run) = args.command else {
            panic!("expected run subcommand");
        };

        let mut config = BenchConfig::default();
        run.apply(&mut config);
        assert_eq!(config.state_count, 20);
        assert_eq!(config.taxa, 32);
        assert_eq!(config.scaling, ScalingMode::Manual);
        assert_eq!(config.rescale_frequency, 4);
        assert_eq!(config.resource, Some(1));
        assert!(config.unrooted && config.calc_derivatives && config.full_timing);
        assert_eq!(config.sites, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_override_file_values() {
        let mut config = BenchConfig {
            taxa: 64,
            sites: 100,
            ..BenchConfig::default()
        };
        let run = RunArgs {
            sites: Some(250),
            double_precision: true,
            ..RunArgs::default()
        };
        run.apply(&mut config);
        assert_eq!(config.taxa, 64);
        assert_eq!(config.sites, 250);
        assert!(config.double_precision);
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let args = Args::try_parse_from(["phylobench", "model", "--states", "5", "-o", "json"]).unwrap();
        assert_eq!(args.output_format, OutputFormat::Json);
        assert!(matches!(args.command, Commands::Model { states: 5, seed: 42 }));
    }
}
