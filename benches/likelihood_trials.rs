/* benches/likelihood_trials.rs */
/*▫~•◦────────────────────────────────────────────────────────────────────────────────────‣
 * © 2025 ArcMoon Studios ◦ SPDX-License-Identifier MIT OR Apache-2.0 ◦ Author: Lord Xyn ✶
 *///◦────────────────────────────────────────────────────────────────────────────────────‣

use criterion::{
    black_box, criterion_group, criterion_main, AxisScale, BenchmarkId, Criterion,
    PlotConfiguration, Throughput,
};
use phylobench::{
    engine::LikelihoodEngine, BenchConfig, BenchmarkSession, CpuEngine, ScalingMode,
    SeededStream, SubstitutionModel,
};

/// Closed-form Hadamard path against the Jacobi path across state counts
fn bench_model_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("model_construction");
    group.plot_config(PlotConfiguration::default().summary_scale(AxisScale::Logarithmic));

    for &states in &[4usize, 5, 16, 20, 61, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(states), &states, |b, &n| {
            b.iter(|| {
                let mut stream = SeededStream::new(42);
                black_box(SubstitutionModel::build(black_box(n), &mut stream).unwrap())
            })
        });
    }

    group.finish();
}

/// One full resource run (context creation, load and trials) per iteration
fn bench_resource_runs(c: &mut Criterion) {
    let mut group = c.benchmark_group("resource_runs");
    group.sample_size(10);

    let engine = CpuEngine::new();
    for resource in engine.resources() {
        for &sites in &[1_000usize, 10_000] {
            let config = BenchConfig {
                sites,
                reps: 1,
                double_precision: true,
                ..BenchConfig::default()
            };
            group.throughput(Throughput::Elements(sites as u64));
            group.bench_with_input(
                BenchmarkId::new(resource.name.clone(), sites),
                &config,
                |b, config| {
                    b.iter(|| {
                        let mut session = BenchmarkSession::new(engine, config.clone()).unwrap();
                        black_box(session.run_resource(resource.number).unwrap())
                    })
                },
            );
        }
    }

    group.finish();
}

/// Cost of each scaling mode on the serial reference resource
fn bench_scaling_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("scaling_modes");
    group.sample_size(10);

    for scaling in [
        ScalingMode::Off,
        ScalingMode::Manual,
        ScalingMode::Auto,
        ScalingMode::Dynamic,
    ] {
        let config = BenchConfig {
            taxa: 64,
            sites: 2_000,
            reps: 2,
            scaling,
            ..BenchConfig::default()
        };
        group.bench_with_input(
            BenchmarkId::from_parameter(scaling),
            &config,
            |b, config| {
                b.iter(|| {
                    let mut session =
                        BenchmarkSession::new(CpuEngine::new(), config.clone()).unwrap();
                    black_box(session.run_resource(0).unwrap())
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_model_construction,
    bench_resource_runs,
    bench_scaling_modes
);

criterion_main!(benches);
