/* src/harness.rs */
//! # Benchmark orchestrator
//!
//! Drives one workload through an evaluation context per resource:
//!
//! 1. size and create the context, then negotiate the scaling policy against
//!    what the context actually granted;
//! 2. materialize the workload from a fresh [`SeededStream`], so every resource
//!    sees the identical dataset and model;
//! 3. run `reps` trials of four individually timed phases (transition
//!    matrices, partials, scale-factor bookkeeping, likelihood);
//! 4. keep the best-of-N timings and the last trial's likelihood.
//!
//! The reference resource's best timings are kept in the session, never in a
//! global, and later resources are compared against them.
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{BenchConfig, Precision, ResourceSelection};
use crate::dataset::{draw_edge_lengths, DatasetShape, SeededStream, SyntheticDataset, TipData};
use crate::engine::{
    ContextSpec, EdgeLikelihood, EngineFlags, LikelihoodContext, LikelihoodEngine,
};
use crate::error::{PhyloBenchError, Result};
use crate::model::SubstitutionModel;
use crate::scaling::{Accumulation, ScalingDirective, ScalingMode, ScalingPolicy};
use crate::schedule::{LikelihoodTarget, Operation, OperationSchedule};

/// Eigendecomposition, category-weight and frequency buffer used by every call.
const MODEL_BUFFER: usize = 0;

// =====================================================================================
// TIMING
// =====================================================================================

/// Wall-clock durations of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrialTiming {
    /// Transition matrix update
    pub transition_matrices: Duration,
    /// Partials propagation
    pub partials: Duration,
    /// Scale-factor reset and accumulation
    pub scale_accumulation: Duration,
    /// Root or edge log-likelihood
    pub likelihood: Duration,
    /// Whole trial
    pub total: Duration,
}

impl TrialTiming {
    /// Elementwise minimum: each phase keeps its own best.
    #[must_use]
    pub fn min(&self, other: &Self) -> Self {
        Self {
            transition_matrices: self.transition_matrices.min(other.transition_matrices),
            partials: self.partials.min(other.partials),
            scale_accumulation: self.scale_accumulation.min(other.scale_accumulation),
            likelihood: self.likelihood.min(other.likelihood),
            total: self.total.min(other.total),
        }
    }
}

/// Best-of-N accumulator.
#[derive(Debug, Clone, Default)]
pub struct BestOfN {
    best: Option<TrialTiming>,
    total: Duration,
    trials: u32,
}

impl BestOfN {
    /// Folds one trial in.
    pub fn record(&mut self, timing: TrialTiming) {
        self.best = Some(match self.best {
            Some(best) => best.min(&timing),
            None => timing,
        });
        self.total += timing.total;
        self.trials += 1;
    }

    /// Per-phase minimum over every recorded trial.
    #[must_use]
    pub fn best(&self) -> Option<TrialTiming> {
        self.best
    }

    /// Mean total trial time.
    #[must_use]
    pub fn mean_total(&self) -> Option<Duration> {
        (self.trials > 0).then(|| self.total / self.trials)
    }

    /// Number of recorded trials.
    #[must_use]
    pub fn trials(&self) -> u32 {
        self.trials
    }
}

// =====================================================================================
// RESULTS
// =====================================================================================

/// Outcome of benchmarking one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Resource number
    pub resource_number: usize,
    /// Resource name
    pub resource_name: String,
    /// Kernel implementation name
    pub implementation_name: String,
    /// Capabilities of the context
    pub flags: EngineFlags,
    /// Scaling mode after negotiation
    pub scaling: ScalingMode,
    /// Best-of-N timings
    pub best: TrialTiming,
    /// Mean total trial time
    pub mean_total: Duration,
    /// Number of timed trials
    pub trials: u32,
    /// Log-likelihood of the last trial
    pub log_likelihood: f64,
    /// First derivative of the last trial, if computed
    pub first_derivative: Option<f64>,
    /// Second derivative of the last trial, if computed
    pub second_derivative: Option<f64>,
}

/// Best timings of the reference resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTiming {
    /// Reference resource number
    pub resource: usize,
    /// Its best-of-N timings
    pub best: TrialTiming,
}

// =====================================================================================
// WORKLOAD
// =====================================================================================

/// Everything drawn from the seed for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    /// Tips and per-category/per-site parameters
    pub dataset: SyntheticDataset,
    /// Stationary frequencies and eigensystem
    pub model: SubstitutionModel,
    /// Branch length per edge
    pub edge_lengths: Vec<f64>,
}

impl Workload {
    /// Draws dataset, model and edge lengths, in that order, from a fresh stream.
    pub fn materialize(config: &BenchConfig, edges: usize) -> Result<Self> {
        let mut stream = SeededStream::new(config.seed);
        let dataset = SyntheticDataset::generate(
            &mut stream,
            DatasetShape {
                taxa: config.taxa,
                sites: config.sites,
                state_count: config.state_count,
                rate_categories: config.rate_categories,
                compact_tips: config.compact_tips,
            },
        );
        let model = SubstitutionModel::build(config.state_count, &mut stream)?;
        let edge_lengths = draw_edge_lengths(&mut stream, edges);
        Ok(Self {
            dataset,
            model,
            edge_lengths,
        })
    }

    /// Loads tips, weights, rates, frequencies and the eigensystem into a context.
    pub fn load(&self, context: &mut dyn LikelihoodContext) -> Result<()> {
        for (tip, data) in self.dataset.tips.iter().enumerate() {
            match data {
                TipData::States(states) => context.set_tip_states(tip, states)?,
                TipData::Partials(partials) => context.set_tip_partials(tip, partials)?,
            }
        }
        context.set_category_rates(&self.dataset.category_rates)?;
        context.set_pattern_weights(&self.dataset.pattern_weights)?;
        context.set_category_weights(MODEL_BUFFER, &self.dataset.category_weights)?;
        context.set_state_frequencies(MODEL_BUFFER, &self.model.frequencies.to_vec())?;
        context.set_eigen_decomposition(MODEL_BUFFER, &self.model.eigen)?;
        Ok(())
    }
}

// =====================================================================================
// SESSION
// =====================================================================================

/// A benchmark run over one or more resources of an engine.
pub struct BenchmarkSession<E: LikelihoodEngine> {
    engine: E,
    config: BenchConfig,
    reference: Option<ReferenceTiming>,
}

impl<E: LikelihoodEngine> BenchmarkSession<E> {
    /// Validates `config` and prepares a session.
    pub fn new(engine: E, config: BenchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            config,
            reference: None,
        })
    }

    /// The run configuration.
    #[must_use]
    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Reference timings, once the reference resource has completed.
    #[must_use]
    pub fn reference(&self) -> Option<&ReferenceTiming> {
        self.reference.as_ref()
    }

    /// Benchmarks the selected resources in order.
    ///
    /// With [`ResourceSelection::All`] a resource-scoped failure is logged and
    /// skipped; the run fails only if no resource completes.
    pub fn run(&mut self, selection: ResourceSelection) -> Result<Vec<BenchmarkResult>> {
        match selection {
            ResourceSelection::Only(resource) => Ok(vec![self.run_resource(resource)?]),
            ResourceSelection::All => {
                let mut results = Vec::new();
                for resource in self.engine.resources() {
                    match self.run_resource(resource.number) {
                        Ok(result) => results.push(result),
                        Err(e) if e.is_resource_scoped() => {
                            warn!(resource = resource.number, error = %e, "Skipping resource");
                        }
                        Err(e) => return Err(e),
                    }
                }
                if results.is_empty() {
                    return Err(PhyloBenchError::Engine(
                        "no resource completed the benchmark".to_string(),
                    ));
                }
                Ok(results)
            }
        }
    }

    /// Benchmarks a single resource.
    pub fn run_resource(&mut self, resource: usize) -> Result<BenchmarkResult> {
        let config = &self.config;
        let schedule =
            OperationSchedule::build(config.taxa, config.calc_derivatives, config.unrooted)?;
        let mut policy = ScalingPolicy::new(config.scaling, config.taxa, config.rescale_frequency);

        let spec = context_spec(config, &schedule, &policy, resource);
        let mut context = self.engine.create_context(&spec)?;
        let details = context.details().clone();
        policy.negotiate(&details);
        info!(
            resource = details.resource_number,
            name = %details.resource_name,
            implementation = %details.implementation_name,
            scaling = %policy.mode(),
            derivatives = schedule.computes_derivatives(),
            "Benchmarking resource"
        );

        let workload = Workload::materialize(config, schedule.edge_count())?;
        workload.load(context.as_mut())?;

        if let Some(cumulative) = policy.initial_reset() {
            context.reset_scale_factors(cumulative)?;
        }

        let mut operations = schedule.operations.clone();
        let accumulation_indices = policy.accumulation_indices();
        let mut timings = BestOfN::default();
        let mut outcome = None;

        for trial in 0..config.reps {
            let directive = policy.directive(trial);
            ScalingPolicy::annotate(&directive, &mut operations);
            let plan = TrialPlan {
                schedule: &schedule,
                policy: &policy,
                directive: &directive,
                operations: &operations,
                accumulation_indices: &accumulation_indices,
                edge_lengths: &workload.edge_lengths,
            };
            let (timing, likelihood) = plan.execute(context.as_mut())?;
            debug!(
                trial,
                total_us = timing.total.as_micros(),
                log_likelihood = likelihood.log_likelihood,
                "Trial complete"
            );
            timings.record(timing);
            outcome = Some(likelihood);
        }

        let (Some(best), Some(mean_total), Some(likelihood)) =
            (timings.best(), timings.mean_total(), outcome)
        else {
            return Err(PhyloBenchError::Configuration(
                "invalid number of reps supplied".to_string(),
            ));
        };

        if details.resource_number == self.engine.reference_resource() {
            self.reference = Some(ReferenceTiming {
                resource: details.resource_number,
                best,
            });
        }

        Ok(BenchmarkResult {
            resource_number: details.resource_number,
            resource_name: details.resource_name,
            implementation_name: details.implementation_name,
            flags: details.flags,
            scaling: policy.mode(),
            best,
            mean_total,
            trials: timings.trials(),
            log_likelihood: likelihood.log_likelihood,
            first_derivative: likelihood.first_derivative,
            second_derivative: likelihood.second_derivative,
        })
    }
}

/// Context request for `resource` sized to the schedule and scaling policy.
fn context_spec(
    config: &BenchConfig,
    schedule: &OperationSchedule,
    policy: &ScalingPolicy,
    resource: usize,
) -> ContextSpec {
    let mut requirement_flags = policy.required_flags();
    requirement_flags |= match config.precision() {
        Precision::Single => EngineFlags::PRECISION_SINGLE,
        Precision::Double => EngineFlags::PRECISION_DOUBLE,
    };
    requirement_flags |= if config.require_sse {
        EngineFlags::VECTOR_SSE
    } else {
        EngineFlags::VECTOR_NONE
    };

    ContextSpec {
        tip_count: config.taxa,
        partials_buffer_count: schedule.partials_buffer_count(config.compact_tips),
        compact_buffer_count: config.compact_tips,
        state_count: config.state_count,
        pattern_count: config.sites,
        eigen_buffer_count: 1,
        matrix_buffer_count: schedule.matrix_buffer_count(),
        category_count: config.rate_categories,
        scale_buffer_count: policy.scale_buffer_count(),
        resource,
        preference_flags: policy.preferred_flags(),
        requirement_flags,
    }
}

/// The inputs of one timed trial.
struct TrialPlan<'a> {
    schedule: &'a OperationSchedule,
    policy: &'a ScalingPolicy,
    directive: &'a ScalingDirective,
    operations: &'a [Operation],
    accumulation_indices: &'a [usize],
    edge_lengths: &'a [f64],
}

impl TrialPlan<'_> {
    fn execute(&self, context: &mut dyn LikelihoodContext) -> Result<(TrialTiming, EdgeLikelihood)> {
        let cumulative = self.policy.cumulative_index();

        let start = Instant::now();
        context.update_transition_matrices(
            MODEL_BUFFER,
            &self.schedule.matrix_indices,
            self.schedule.first_derivative_indices.as_deref(),
            self.schedule.second_derivative_indices.as_deref(),
            self.edge_lengths,
        )?;
        let matrices_done = Instant::now();

        context.update_partials(self.operations, self.policy.partials_cumulative_index())?;
        let partials_done = Instant::now();

        if self.directive.touches_cumulative() {
            if self.directive.reset_cumulative {
                if let Some(index) = cumulative {
                    context.reset_scale_factors(index)?;
                }
            }
            match self.directive.accumulation {
                Accumulation::Skip => {}
                Accumulation::Into(index) => {
                    context.accumulate_scale_factors(self.accumulation_indices, Some(index))?;
                }
                Accumulation::EngineManaged => {
                    context.accumulate_scale_factors(self.accumulation_indices, None)?;
                }
            }
        }
        let scaling_done = Instant::now();

        let likelihood = match self.schedule.target {
            LikelihoodTarget::Root { root } => EdgeLikelihood {
                log_likelihood: context.root_log_likelihood(
                    root,
                    MODEL_BUFFER,
                    MODEL_BUFFER,
                    cumulative,
                )?,
                first_derivative: None,
                second_derivative: None,
            },
            LikelihoodTarget::Edge {
                parent,
                child,
                matrix,
                first_derivative,
                second_derivative,
            } => context.edge_log_likelihood(
                parent,
                child,
                matrix,
                first_derivative,
                second_derivative,
                MODEL_BUFFER,
                MODEL_BUFFER,
                cumulative,
            )?,
        };
        let end = Instant::now();

        let timing = TrialTiming {
            transition_matrices: matrices_done - start,
            partials: partials_done - matrices_done,
            scale_accumulation: scaling_done - partials_done,
            likelihood: end - scaling_done,
            total: end - start,
        };
        Ok((timing, likelihood))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CpuEngine, InstanceDetails, ResourceDescriptor};
    use crate::model::EigenDecomposition;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn small_config() -> BenchConfig {
        BenchConfig {
            taxa: 8,
            sites: 64,
            reps: 3,
            double_precision: true,
            resource: Some(0),
            ..BenchConfig::default()
        }
    }

    fn run_once(config: BenchConfig) -> BenchmarkResult {
        let selection = config.resource_selection();
        let mut session = BenchmarkSession::new(CpuEngine::new(), config).unwrap();
        session.run(selection).unwrap().remove(0)
    }

    fn relative(a: f64, b: f64) -> f64 {
        (a - b).abs() / b.abs()
    }

    #[test]
    fn test_default_workload_is_finite_and_deterministic() {
        let config = BenchConfig {
            sites: 500,
            reps: 2,
            resource: Some(0),
            ..BenchConfig::default()
        };
        let a = run_once(config.clone());
        let b = run_once(config);
        assert!(a.log_likelihood.is_finite());
        assert!(a.log_likelihood < 0.0);
        assert_eq!(a.log_likelihood.to_bits(), b.log_likelihood.to_bits());
        assert_eq!(a.trials, 2);
        assert_eq!(a.scaling, ScalingMode::Off);
        assert!(a.best.total <= a.mean_total);
    }

    #[test]
    fn test_four_taxa_dna_scenario() {
        let config = BenchConfig {
            taxa: 4,
            sites: 100,
            rate_categories: 1,
            reps: 1,
            resource: Some(0),
            ..BenchConfig::default()
        };
        let schedule = OperationSchedule::build(config.taxa, false, false).unwrap();
        assert_eq!(schedule.operations.len(), 3);
        assert_eq!(schedule.target, LikelihoodTarget::Root { root: 6 });

        let workload = Workload::materialize(&config, schedule.edge_count()).unwrap();
        assert_eq!(workload.model.frequencies.to_vec(), vec![0.25; 4]);
        let eigenvalues = &workload.model.eigen.eigenvalues;
        assert_eq!(eigenvalues[0], 0.0);
        assert!(eigenvalues.iter().skip(1).all(|&v| (v + 4.0 / 3.0).abs() < 1e-12));
        assert_eq!(workload.edge_lengths.len(), 6);

        let a = run_once(config.clone());
        let b = run_once(config);
        assert!(a.log_likelihood.is_finite());
        assert_eq!(a.log_likelihood.to_bits(), b.log_likelihood.to_bits());
    }

    #[test]
    fn test_scaling_modes_agree_with_unscaled() {
        let unscaled = run_once(small_config()).log_likelihood;
        for (scaling, rescale_frequency) in [
            (ScalingMode::Manual, 1),
            (ScalingMode::Manual, 2),
            (ScalingMode::Dynamic, 1),
            (ScalingMode::Auto, 1),
        ] {
            let result = run_once(BenchConfig {
                scaling,
                rescale_frequency,
                ..small_config()
            });
            assert_eq!(result.scaling, scaling);
            assert!(
                relative(result.log_likelihood, unscaled) < 1e-6,
                "{scaling}: {} vs {unscaled}",
                result.log_likelihood
            );
        }
    }

    #[test]
    fn test_general_state_count_runs() {
        let result = run_once(BenchConfig {
            state_count: 5,
            compact_tips: 3,
            ..small_config()
        });
        assert!(result.log_likelihood.is_finite());
        assert!(result.implementation_name.contains("5State"));
    }

    #[test]
    fn test_unrooted_derivatives_are_finite_and_deterministic() {
        let config = BenchConfig {
            unrooted: true,
            calc_derivatives: true,
            ..small_config()
        };
        let a = run_once(config.clone());
        let b = run_once(config);
        assert!(a.log_likelihood.is_finite());
        assert!(a.first_derivative.is_some_and(f64::is_finite));
        assert!(a.second_derivative.is_some_and(f64::is_finite));
        assert_eq!(a.first_derivative, b.first_derivative);
        assert_eq!(a.log_likelihood.to_bits(), b.log_likelihood.to_bits());
    }

    #[test]
    fn test_reported_derivatives_follow_final_edge() {
        let config = BenchConfig {
            unrooted: true,
            calc_derivatives: true,
            ..small_config()
        };
        let schedule =
            OperationSchedule::build(config.taxa, config.calc_derivatives, config.unrooted).unwrap();
        let mut policy = ScalingPolicy::new(config.scaling, config.taxa, config.rescale_frequency);
        let spec = context_spec(&config, &schedule, &policy, 0);
        let mut context = CpuEngine::new().create_context(&spec).unwrap();
        policy.negotiate(context.details());
        let workload = Workload::materialize(&config, schedule.edge_count()).unwrap();
        workload.load(context.as_mut()).unwrap();

        let directive = policy.directive(0);
        let mut operations = schedule.operations.clone();
        ScalingPolicy::annotate(&directive, &mut operations);
        let accumulation_indices = policy.accumulation_indices();
        let plan = TrialPlan {
            schedule: &schedule,
            policy: &policy,
            directive: &directive,
            operations: &operations,
            accumulation_indices: &accumulation_indices,
            edge_lengths: &workload.edge_lengths,
        };
        let (_, centre) = plan.execute(context.as_mut()).unwrap();

        // Re-evaluate the final edge with only its own matrix moved.
        let LikelihoodTarget::Edge { parent, child, matrix, .. } = schedule.target else {
            panic!("unrooted schedule must end on an edge");
        };
        assert_eq!(matrix, config.taxa - 1);
        let length = workload.edge_lengths[matrix];
        let mut at = |t: f64| {
            context
                .update_transition_matrices(MODEL_BUFFER, &[matrix], None, None, &[t])
                .unwrap();
            context
                .edge_log_likelihood(parent, child, matrix, None, None, MODEL_BUFFER, MODEL_BUFFER, None)
                .unwrap()
                .log_likelihood
        };

        let h = 1e-6 * length;
        let d1 = (at(length + h) - at(length - h)) / (2.0 * h);
        let reported_d1 = centre.first_derivative.unwrap();
        assert!(
            (reported_d1 - d1).abs() <= 1e-5 * d1.abs().max(1.0),
            "d1 {reported_d1} vs finite difference {d1}"
        );

        let h = 1e-4 * length;
        let d2 = (at(length + h) - 2.0 * centre.log_likelihood + at(length - h)) / (h * h);
        let reported_d2 = centre.second_derivative.unwrap();
        assert!(
            (reported_d2 - d2).abs() <= 1e-3 * d2.abs().max(1.0),
            "d2 {reported_d2} vs finite difference {d2}"
        );
    }

    #[test]
    fn test_unknown_resource_terminates_explicit_run() {
        let mut session = BenchmarkSession::new(CpuEngine::new(), small_config()).unwrap();
        assert!(matches!(
            session.run(ResourceSelection::Only(42)),
            Err(PhyloBenchError::ResourceUnavailable { resource: 42, .. })
        ));
        assert!(session.reference().is_none());
    }

    #[test]
    fn test_invalid_config_fails_before_running() {
        let config = BenchConfig {
            calc_derivatives: true,
            ..small_config()
        };
        assert!(matches!(
            BenchmarkSession::new(CpuEngine::new(), config),
            Err(PhyloBenchError::Configuration(_))
        ));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_all_resources_agree_and_reference_is_recorded() {
        let config = BenchConfig {
            resource: None,
            scaling: ScalingMode::Auto,
            ..small_config()
        };
        let mut session = BenchmarkSession::new(CpuEngine::new(), config).unwrap();
        let results = session.run(ResourceSelection::All).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(session.reference().map(|r| r.resource), Some(0));
        assert_eq!(results[0].scaling, ScalingMode::Auto);
        assert_eq!(results[1].scaling, ScalingMode::Off);
        assert!(relative(results[1].log_likelihood, results[0].log_likelihood) < 1e-9);
    }

    // -------------------------------------------------------------------------------
    // Protocol checks against a recording engine
    // -------------------------------------------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Reset(usize),
        Accumulate(Vec<usize>, Option<usize>),
        Partials(Vec<(Option<usize>, Option<usize>)>, Option<usize>),
        Root(Option<usize>),
    }

    struct RecordingEngine {
        calls: Rc<RefCell<Vec<Call>>>,
        auto: bool,
        failing: Vec<usize>,
    }

    struct RecordingContext {
        details: InstanceDetails,
        calls: Rc<RefCell<Vec<Call>>>,
    }

    impl LikelihoodEngine for RecordingEngine {
        fn resources(&self) -> Vec<ResourceDescriptor> {
            (0..3)
                .map(|number| ResourceDescriptor {
                    number,
                    name: format!("recorder-{number}"),
                    description: String::new(),
                    support_flags: EngineFlags::empty(),
                })
                .collect()
        }

        fn create_context(&self, spec: &ContextSpec) -> Result<Box<dyn LikelihoodContext>> {
            if self.failing.contains(&spec.resource) {
                return Err(PhyloBenchError::ResourceUnavailable {
                    resource: spec.resource,
                    reason: "refused".to_string(),
                });
            }
            let mut flags = spec.requirement_flags;
            if self.auto {
                flags |= spec.preference_flags;
            }
            Ok(Box::new(RecordingContext {
                details: InstanceDetails {
                    resource_number: spec.resource,
                    resource_name: format!("recorder-{}", spec.resource),
                    implementation_name: "recorder".to_string(),
                    flags,
                },
                calls: Rc::clone(&self.calls),
            }))
        }
    }

    impl LikelihoodContext for RecordingContext {
        fn details(&self) -> &InstanceDetails {
            &self.details
        }
        fn set_tip_states(&mut self, _: usize, _: &[i32]) -> Result<()> {
            Ok(())
        }
        fn set_tip_partials(&mut self, _: usize, _: &[f64]) -> Result<()> {
            Ok(())
        }
        fn set_category_rates(&mut self, _: &[f64]) -> Result<()> {
            Ok(())
        }
        fn set_category_weights(&mut self, _: usize, _: &[f64]) -> Result<()> {
            Ok(())
        }
        fn set_pattern_weights(&mut self, _: &[f64]) -> Result<()> {
            Ok(())
        }
        fn set_state_frequencies(&mut self, _: usize, _: &[f64]) -> Result<()> {
            Ok(())
        }
        fn set_eigen_decomposition(&mut self, _: usize, _: &EigenDecomposition) -> Result<()> {
            Ok(())
        }
        fn update_transition_matrices(
            &mut self,
            _: usize,
            _: &[usize],
            _: Option<&[usize]>,
            _: Option<&[usize]>,
            _: &[f64],
        ) -> Result<()> {
            Ok(())
        }
        fn update_partials(&mut self, operations: &[Operation], cumulative: Option<usize>) -> Result<()> {
            let scaling = operations
                .iter()
                .map(|op| (op.write_scaling, op.read_scaling))
                .collect();
            self.calls.borrow_mut().push(Call::Partials(scaling, cumulative));
            Ok(())
        }
        fn reset_scale_factors(&mut self, cumulative: usize) -> Result<()> {
            self.calls.borrow_mut().push(Call::Reset(cumulative));
            Ok(())
        }
        fn accumulate_scale_factors(&mut self, indices: &[usize], cumulative: Option<usize>) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(Call::Accumulate(indices.to_vec(), cumulative));
            Ok(())
        }
        fn root_log_likelihood(&mut self, _: usize, _: usize, _: usize, cumulative: Option<usize>) -> Result<f64> {
            self.calls.borrow_mut().push(Call::Root(cumulative));
            Ok(-1.0)
        }
        fn edge_log_likelihood(
            &mut self,
            _: usize,
            _: usize,
            _: usize,
            first: Option<usize>,
            second: Option<usize>,
            _: usize,
            _: usize,
            _: Option<usize>,
        ) -> Result<EdgeLikelihood> {
            Ok(EdgeLikelihood {
                log_likelihood: -1.0,
                first_derivative: first.map(|_| 0.5),
                second_derivative: second.map(|_| -0.5),
            })
        }
    }

    fn recorder(auto: bool, failing: Vec<usize>) -> (RecordingEngine, Rc<RefCell<Vec<Call>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let engine = RecordingEngine {
            calls: Rc::clone(&calls),
            auto,
            failing,
        };
        (engine, calls)
    }

    fn config_with(scaling: ScalingMode, reps: usize, rescale_frequency: usize) -> BenchConfig {
        BenchConfig {
            taxa: 4,
            sites: 10,
            reps,
            scaling,
            rescale_frequency,
            ..BenchConfig::default()
        }
    }

    #[test]
    fn test_manual_protocol_rescales_periodically() {
        let (engine, calls) = recorder(false, vec![]);
        let mut session = BenchmarkSession::new(engine, config_with(ScalingMode::Manual, 4, 2)).unwrap();
        session.run_resource(0).unwrap();

        let write = vec![(Some(0), None), (Some(1), None), (Some(2), None)];
        let read = vec![(None, Some(0)), (None, Some(1)), (None, Some(2))];
        let rescale = [
            Call::Partials(write.clone(), None),
            Call::Reset(3),
            Call::Accumulate(vec![0, 1, 2], Some(3)),
            Call::Root(Some(3)),
        ];
        let reuse = [Call::Partials(read.clone(), None), Call::Root(Some(3))];

        let expected: Vec<Call> = [&rescale[..], &reuse[..], &rescale[..], &reuse[..]].concat();
        assert_eq!(*calls.borrow(), expected);
    }

    #[test]
    fn test_dynamic_protocol_resets_once() {
        let (engine, calls) = recorder(false, vec![]);
        let mut session = BenchmarkSession::new(engine, config_with(ScalingMode::Dynamic, 2, 1)).unwrap();
        session.run_resource(0).unwrap();

        let both = vec![(Some(0), Some(0)), (Some(1), Some(1)), (Some(2), Some(2))];
        let trial = [Call::Partials(both, Some(3)), Call::Root(Some(3))];
        let expected: Vec<Call> = [&[Call::Reset(3)][..], &trial[..], &trial[..]].concat();
        assert_eq!(*calls.borrow(), expected);
    }

    #[test]
    fn test_auto_protocol_and_fallback() {
        let (engine, calls) = recorder(true, vec![]);
        let mut session = BenchmarkSession::new(engine, config_with(ScalingMode::Auto, 1, 1)).unwrap();
        let result = session.run_resource(0).unwrap();
        assert_eq!(result.scaling, ScalingMode::Auto);
        let none = vec![(None, None); 3];
        assert_eq!(
            *calls.borrow(),
            vec![
                Call::Partials(none.clone(), None),
                Call::Accumulate(vec![4, 5, 6], None),
                Call::Root(None),
            ]
        );

        let (engine, calls) = recorder(false, vec![]);
        let mut session = BenchmarkSession::new(engine, config_with(ScalingMode::Auto, 1, 1)).unwrap();
        let result = session.run_resource(0).unwrap();
        assert_eq!(result.scaling, ScalingMode::Off);
        assert_eq!(
            *calls.borrow(),
            vec![Call::Partials(none, None), Call::Root(None)]
        );
    }

    #[test]
    fn test_scan_skips_failing_resources() {
        let (engine, _) = recorder(false, vec![0, 2]);
        let mut session = BenchmarkSession::new(engine, config_with(ScalingMode::Off, 1, 1)).unwrap();
        let results = session.run(ResourceSelection::All).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].resource_number, 1);
        assert!(session.reference().is_none());

        let (engine, _) = recorder(false, vec![0, 1, 2]);
        let mut session = BenchmarkSession::new(engine, config_with(ScalingMode::Off, 1, 1)).unwrap();
        assert!(session.run(ResourceSelection::All).is_err());
    }

    fn timing(micros: [u64; 5]) -> TrialTiming {
        let d = Duration::from_micros;
        TrialTiming {
            transition_matrices: d(micros[0]),
            partials: d(micros[1]),
            scale_accumulation: d(micros[2]),
            likelihood: d(micros[3]),
            total: d(micros[4]),
        }
    }

    proptest! {
        #[test]
        fn prop_best_of_n_is_elementwise_minimum(
            trials in prop::collection::vec(prop::array::uniform5(1u64..1_000_000), 1..20)
        ) {
            let mut best = BestOfN::default();
            for t in &trials {
                best.record(timing(*t));
            }
            let recorded = best.best().unwrap();
            for phase in 0..5 {
                let min = trials.iter().map(|t| t[phase]).min().unwrap();
                let got = [
                    recorded.transition_matrices,
                    recorded.partials,
                    recorded.scale_accumulation,
                    recorded.likelihood,
                    recorded.total,
                ][phase];
                prop_assert_eq!(got, Duration::from_micros(min));
                prop_assert!(got <= Duration::from_micros(trials[0][phase]));
            }
            prop_assert_eq!(best.trials() as usize, trials.len());
            prop_assert!(best.mean_total().unwrap() >= recorded.total);
        }
    }
}
