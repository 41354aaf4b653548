use std::collections::BTreeMap;
use std::time::Instant;

use clap::Parser;
use decay_tree_fitter::{
    Candidate, CandidateTree, ConvergenceCriterion, FailureReason, FitConfig, FitSummary,
    fit_batch, init_logger,
};
use nalgebra::{Matrix6, Vector3, Vector6};
use tracing::{info, warn};

const PION_MASS: f64 = 0.13957;
const KAON_MASS: f64 = 0.493677;

#[derive(Parser)]
#[command(name = "fit_decay_tree")]
#[command(about = "Fit simulated B+ -> (K0S -> pi+ pi-) K+ decay trees")]
struct Args {
    /// Number of events to generate and fit
    #[arg(short, long, default_value = "1000")]
    events: usize,

    /// Track smearing in units of the track resolution
    #[arg(short, long, default_value = "1.0")]
    noise: f64,

    /// Maximum number of filter passes per fit
    #[arg(short, long, default_value = "10")]
    max_iterations: usize,

    /// Convergence threshold on the χ² change between passes
    #[arg(short, long, default_value = "0.01")]
    precision: f64,

    /// Scale the convergence threshold with the previous χ²
    #[arg(long)]
    relative: bool,

    /// Constrain the K0S candidate to its mass hypothesis
    #[arg(long)]
    mass_constraint: bool,

    /// Log every filter pass
    #[arg(short, long)]
    verbose: bool,
}

/// Deterministic pseudo-Gaussian noise (Box-Muller on a fixed sequence)
fn generate_normal(index: usize) -> f64 {
    let u1 = ((index * 12345 + 67890) % 10000 + 1) as f64 / 10001.0;
    let u2 = ((index * 54321 + 98765) % 10000) as f64 / 10000.0;
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn smear(value: Vector3<f64>, sigma: f64, seed: usize) -> Vector3<f64> {
    value
        + Vector3::new(
            generate_normal(seed),
            generate_normal(seed + 1),
            generate_normal(seed + 2),
        ) * sigma
}

fn energy(momentum: &Vector3<f64>, mass: f64) -> f64 {
    (momentum.norm_squared() + mass * mass).sqrt()
}

fn simulate_event(event: usize, noise: f64) -> Result<CandidateTree, Box<dyn std::error::Error>> {
    let resolution = 0.01;
    let covariance = Matrix6::from_diagonal(&Vector6::repeat(resolution * resolution));
    let sigma = resolution * noise;

    let phase = event as f64 * 0.37;
    let production = Vector3::new(0.01 * phase.sin(), 0.01 * phase.cos(), 0.0);
    let pip = Vector3::new(0.35 + 0.05 * phase.cos(), 0.12, 1.8);
    let pim = Vector3::new(-0.15, 0.05 + 0.05 * phase.sin(), 1.4);
    let kaon = Vector3::new(0.4, -0.3, 2.5 + 0.1 * phase.cos());
    let ks = pip + pim;
    let ks_vertex = production + ks.normalize() * (2.0 + (event % 7) as f64);

    let ks_energy = energy(&pip, PION_MASS) + energy(&pim, PION_MASS);
    let ks_mass = (ks_energy * ks_energy - ks.norm_squared()).sqrt();
    let b_energy = ks_energy + energy(&kaon, KAON_MASS);
    let b_mass = (b_energy * b_energy - (ks + kaon).norm_squared()).sqrt();

    let seed = 100 * event;
    let mut tree = CandidateTree::new();
    let pip = tree.add(Candidate::charged(
        "pi+",
        PION_MASS,
        smear(ks_vertex, sigma, seed),
        smear(pip, sigma, seed + 3),
        covariance,
    ));
    let pim = tree.add(Candidate::charged(
        "pi-",
        PION_MASS,
        smear(ks_vertex, sigma, seed + 6),
        smear(pim, sigma, seed + 9),
        covariance,
    ));
    let kaon = tree.add(Candidate::charged(
        "K+",
        KAON_MASS,
        smear(production, sigma, seed + 12),
        smear(kaon, sigma, seed + 15),
        covariance,
    ));
    let ks = tree.add_decay(Candidate::composite("K0S", ks_mass, ks_vertex), &[pip, pim])?;
    tree.add_decay(Candidate::composite("B+", b_mass, production), &[ks, kaon])?;
    Ok(tree)
}

fn print_report(summaries: &[FitSummary], elapsed_ms: f64) {
    let mut histogram: BTreeMap<i32, (FailureReason, usize)> = BTreeMap::new();
    for summary in summaries {
        histogram
            .entry(summary.failure.code())
            .or_insert((summary.failure, 0))
            .1 += 1;
    }

    println!("\n{}", "=".repeat(60));
    println!("=== FIT OUTCOME HISTOGRAM ===\n");
    println!("{:<6} | {:<28} | {:>8} | {:>7}", "Code", "Reason", "Events", "Share");
    println!("{}", "-".repeat(60));
    for (code, (reason, count)) in &histogram {
        println!(
            "{:<6} | {:<28} | {:>8} | {:>6.1}%",
            code,
            reason.to_string(),
            count,
            100.0 * *count as f64 / summaries.len().max(1) as f64
        );
    }
    println!("{}", "-".repeat(60));

    let reduced: Vec<f64> = summaries
        .iter()
        .filter(|s| s.is_success())
        .filter_map(FitSummary::reduced_chi_square)
        .collect();
    let successes = summaries.iter().filter(|s| s.is_success()).count();
    println!("\nSummary: {}/{} fits succeeded", successes, summaries.len());
    if !reduced.is_empty() {
        let mean = reduced.iter().sum::<f64>() / reduced.len() as f64;
        let mean_p = summaries
            .iter()
            .filter(|s| s.is_success())
            .map(|s| s.p_value)
            .sum::<f64>()
            / successes as f64;
        let mean_iterations = summaries
            .iter()
            .filter(|s| s.is_success())
            .map(|s| s.statistics.iterations as f64)
            .sum::<f64>()
            / successes as f64;
        println!("Mean chi2/ndof:     {:.3}", mean);
        println!("Mean p-value:       {:.3}", mean_p);
        println!("Mean iterations:    {:.2}", mean_iterations);
    }
    println!(
        "Total time:         {:.1}ms ({:.1}us per event)",
        elapsed_ms,
        1000.0 * elapsed_ms / summaries.len().max(1) as f64
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logger();

    println!("=== DECAY TREE FIT ===");

    let mut config = FitConfig::default()
        .with_max_iterations(args.max_iterations)
        .with_precision(args.precision)
        .with_verbose(args.verbose);
    if args.relative {
        config = config.with_convergence(ConvergenceCriterion::Relative);
    }
    if args.mass_constraint {
        config = config.with_mass_constraint("K0S");
    }
    info!("{}", config);

    let mut trees = (0..args.events)
        .map(|event| simulate_event(event, args.noise))
        .collect::<Result<Vec<_>, _>>()?;

    let start = Instant::now();
    let results = fit_batch(&mut trees, &config);
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    let mut summaries = Vec::with_capacity(results.len());
    for (event, result) in results.into_iter().enumerate() {
        match result {
            Ok(summary) => summaries.push(summary),
            Err(e) => warn!("Event {} could not be fitted: {}", event, e),
        }
    }

    print_report(&summaries, elapsed_ms);
    Ok(())
}
