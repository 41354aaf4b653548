//! Decay-tree fit throughput
//!
//! Fits synthetic trees made of a head decaying at the production point into `n` long-lived
//! two-body decays (V0 → π⁺π⁻). Every tree adds 6 measured tracks' worth of equations per V0, so
//! the size sweep shows how the dense global covariance scales with the number of generations
//! hanging off the head.
//!
//! ## Usage
//!
//! ```bash
//! cargo bench --bench fit_throughput
//! ```
//!
//! Groups:
//! - `single_fit`: one engine build + fit per iteration, for 1, 2 and 4 V0s
//! - `refit`: repeated fits of an already seeded engine
//! - `batch`: `fit_batch` over 64 independent events

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use decay_tree_fitter::{
    Candidate, CandidateTree, FitConfig, FitEngine, fit_batch, init_logger_with_level,
};
use nalgebra::{Matrix6, Vector3, Vector6};
use std::hint::black_box;

const PION_MASS: f64 = 0.13957;
const V0_MASS: f64 = 0.497611;

/// Deterministic pseudo-Gaussian noise (Box-Muller on a fixed sequence)
fn noise(index: usize) -> f64 {
    let u1 = ((index * 12345 + 67890) % 10000 + 1) as f64 / 10001.0;
    let u2 = ((index * 54321 + 98765) % 10000) as f64 / 10000.0;
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn smear(value: Vector3<f64>, sigma: f64, seed: usize) -> Vector3<f64> {
    value + Vector3::new(noise(seed), noise(seed + 1), noise(seed + 2)) * sigma
}

fn track_covariance() -> Matrix6<f64> {
    Matrix6::from_diagonal(&Vector6::new(1e-4, 1e-4, 1e-4, 1e-4, 1e-4, 1e-4))
}

/// Head → n × (V0 → π⁺π⁻), tracks smeared by one standard deviation
fn synthetic_tree(n_v0: usize, event: usize) -> CandidateTree {
    let mut tree = CandidateTree::new();
    let production = Vector3::new(0.0, 0.0, 0.0);
    let mut v0s = Vec::with_capacity(n_v0);

    for k in 0..n_v0 {
        let angle = k as f64 * 0.7 + event as f64 * 0.01;
        let plus = Vector3::new(0.3 * angle.cos(), 0.3 * angle.sin(), 1.5);
        let minus = Vector3::new(-0.1 * angle.cos(), 0.2 * angle.sin(), 1.2);
        let vertex = production + (plus + minus).normalize() * (2.0 + k as f64);

        let seed = 1000 * event + 12 * k;
        let pip = tree.add(Candidate::charged(
            "pi+",
            PION_MASS,
            smear(vertex, 0.01, seed),
            smear(plus, 0.01, seed + 3),
            track_covariance(),
        ));
        let pim = tree.add(Candidate::charged(
            "pi-",
            PION_MASS,
            smear(vertex, 0.01, seed + 6),
            smear(minus, 0.01, seed + 9),
            track_covariance(),
        ));
        match tree.add_decay(Candidate::composite("K0S", V0_MASS, vertex), &[pip, pim]) {
            Ok(id) => v0s.push(id),
            Err(err) => panic!("cannot build benchmark tree: {err}"),
        }
    }

    let mut head = Candidate::resonance("X", 5.0);
    head.position = production;
    if let Err(err) = tree.add_decay(head, &v0s) {
        panic!("cannot build benchmark tree: {err}");
    }
    tree
}

fn bench_single_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_fit");
    for n_v0 in [1usize, 2, 4] {
        let template = synthetic_tree(n_v0, 0);
        group.bench_with_input(BenchmarkId::from_parameter(n_v0), &n_v0, |b, _| {
            b.iter(|| {
                let mut tree = template.clone();
                if let Ok(mut engine) = FitEngine::new(&mut tree, FitConfig::default()) {
                    black_box(engine.fit());
                }
                black_box(tree)
            })
        });
    }
    group.finish();
}

fn bench_refit(c: &mut Criterion) {
    let mut tree = synthetic_tree(2, 1);
    let Ok(mut engine) = FitEngine::new(&mut tree, FitConfig::default()) else {
        return;
    };
    engine.fit();
    c.bench_function("refit_two_v0", |b| b.iter(|| black_box(engine.fit())));
}

fn bench_batch(c: &mut Criterion) {
    let template: Vec<CandidateTree> = (0..64).map(|event| synthetic_tree(2, event)).collect();
    let config = FitConfig::default();
    c.bench_function("batch_64_events", |b| {
        b.iter(|| {
            let mut trees = template.clone();
            black_box(fit_batch(&mut trees, &config))
        })
    });
}

fn criterion_benchmark(c: &mut Criterion) {
    init_logger_with_level(tracing::Level::WARN);
    bench_single_fit(c);
    bench_refit(c);
    bench_batch(c);
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
