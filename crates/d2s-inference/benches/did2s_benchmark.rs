use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use d2s_core::{EstimatorConfig, FirstStageSpec, SolverKind, TreatSpec};
use d2s_inference::{EffectShape, SimulationConfig, TwoStageEstimator, simulate_panel};
use std::hint::black_box;

fn config(solver: SolverKind) -> EstimatorConfig {
    let mut cfg = EstimatorConfig::static_two_way("dep_var", "unit", "year", "treat")
        .with_treat_spec(TreatSpec::event_study("g"));
    cfg.first_stage = FirstStageSpec::two_way("unit", "year").with_covariates(["x"]);
    cfg.solver = solver;
    cfg
}

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("did2s_event_study");
    group.sample_size(10);

    for n_units in [300usize, 1500, 6000] {
        let frame = simulate_panel(&SimulationConfig {
            n_units,
            effect: EffectShape::Dynamic { base: 0.0, slope: 1.0 },
            ..Default::default()
        })
        .unwrap();
        let rows = frame.n_rows();

        for (name, solver) in [
            ("direct", SolverKind::Direct),
            ("iterative", SolverKind::Iterative { tol: 1e-10, max_iter: 10_000 }),
        ] {
            let est = TwoStageEstimator::new(config(solver)).unwrap();
            group.bench_with_input(BenchmarkId::new(name, rows), &frame, |b, f| {
                b.iter(|| black_box(est.fit(f).unwrap()))
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_fit);
criterion_main!(benches);
