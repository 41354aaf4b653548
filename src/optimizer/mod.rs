//! Iterative fit of a decay chain.
//!
//! This module holds the policy and result types shared by the fit drivers:
//! - [`FitEngine`]: the global Kalman-filter fit of one tree
//! - [`batch`]: independent trees fitted in parallel

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod batch;
pub mod fit_engine;

pub use batch::{fit_batch, fit_tree};
pub use fit_engine::FitEngine;

/// Lifecycle state of a fit
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitOutcome {
    /// `fit()` has not run yet
    #[default]
    Unfitted,
    /// Seeding or input validation failed; no iteration was run
    BadInput,
    /// Converged and passed the covariance check
    Success,
    /// Numerical failure, fast divergence or a negative covariance diagonal
    Failed,
    /// Iteration budget exhausted or χ² kept growing
    NonConverged,
}

impl fmt::Display for FitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitOutcome::Unfitted => write!(f, "Unfitted"),
            FitOutcome::BadInput => write!(f, "Bad input"),
            FitOutcome::Success => write!(f, "Success"),
            FitOutcome::Failed => write!(f, "Failed"),
            FitOutcome::NonConverged => write!(f, "Non-converged"),
        }
    }
}

/// Machine-readable cause attached to the head candidate after every fit
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    #[default]
    NoFailure,
    /// A constraint could not be applied, or χ² exploded within one pass
    LoopFailure,
    /// χ² grew for too many consecutive passes
    NonConverged,
    /// Negative variance on the covariance diagonal after the loop
    CovarianceFailure,
    /// The loop ran out of passes before converging
    IterationBudget,
    /// The hypothesis could not be seeded
    BadInput,
}

impl FailureReason {
    /// Stable integer code for histogramming
    pub fn code(&self) -> i32 {
        match self {
            FailureReason::NoFailure => 0,
            FailureReason::LoopFailure => 1,
            FailureReason::NonConverged => 2,
            FailureReason::CovarianceFailure => 3,
            FailureReason::IterationBudget => 4,
            FailureReason::BadInput => 5,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoFailure => write!(f, "No failure"),
            FailureReason::LoopFailure => write!(f, "Loop failure"),
            FailureReason::NonConverged => write!(f, "Non-converged"),
            FailureReason::CovarianceFailure => write!(f, "Covariance failure"),
            FailureReason::IterationBudget => write!(f, "Iteration budget exhausted"),
            FailureReason::BadInput => write!(f, "Bad input"),
        }
    }
}

/// How the χ² change between passes is compared with the precision
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceCriterion {
    /// |Δχ²| < precision
    #[default]
    Absolute,
    /// |Δχ²| < precision · max(χ²_previous, 1)
    Relative,
}

impl ConvergenceCriterion {
    pub fn is_converged(&self, delta_chi_square: f64, previous: f64, precision: f64) -> bool {
        let threshold = match self {
            ConvergenceCriterion::Absolute => precision,
            ConvergenceCriterion::Relative => precision * previous.max(1.0),
        };
        delta_chi_square.abs() < threshold
    }
}

impl fmt::Display for ConvergenceCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceCriterion::Absolute => write!(f, "absolute"),
            ConvergenceCriterion::Relative => write!(f, "relative"),
        }
    }
}

/// Fit policy, threaded through the engine and the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Maximum number of filter passes
    pub max_iterations: usize,
    /// Convergence threshold on Δχ²
    pub precision: f64,
    pub convergence: ConvergenceCriterion,
    /// Consecutive passes with growing χ² before giving up
    pub max_diverging_iterations: usize,
    /// Stop with `Failed` and roll back when χ² explodes within one pass
    pub fast_divergence_rollback: bool,
    /// Linearize each pass about a snapshot of the previous one
    pub use_reference_state: bool,
    /// Write fitted values into daughters as well as the head
    pub update_daughters: bool,
    pub seed_position_variance: f64,
    pub seed_momentum_variance: f64,
    pub seed_decay_length_variance: f64,
    /// Candidate names that receive a mass constraint when the chain is built
    pub mass_constraint_names: Vec<String>,
    /// Promote per-pass progress from debug to info level
    pub verbose: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            precision: 0.01,
            convergence: ConvergenceCriterion::Absolute,
            max_diverging_iterations: 3,
            fast_divergence_rollback: true,
            use_reference_state: true,
            update_daughters: true,
            seed_position_variance: 1e4,
            seed_momentum_variance: 1e4,
            seed_decay_length_variance: 1e4,
            mass_constraint_names: Vec::new(),
            verbose: false,
        }
    }
}

impl FitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_precision(mut self, precision: f64) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_convergence(mut self, convergence: ConvergenceCriterion) -> Self {
        self.convergence = convergence;
        self
    }

    pub fn with_max_diverging_iterations(mut self, count: usize) -> Self {
        self.max_diverging_iterations = count;
        self
    }

    pub fn with_fast_divergence_rollback(mut self, enabled: bool) -> Self {
        self.fast_divergence_rollback = enabled;
        self
    }

    pub fn with_reference_state(mut self, enabled: bool) -> Self {
        self.use_reference_state = enabled;
        self
    }

    pub fn with_update_daughters(mut self, enabled: bool) -> Self {
        self.update_daughters = enabled;
        self
    }

    /// Set the loose seed variances of positions, momenta and decay lengths
    pub fn with_seed_variances(mut self, position: f64, momentum: f64, decay_length: f64) -> Self {
        self.seed_position_variance = position;
        self.seed_momentum_variance = momentum;
        self.seed_decay_length_variance = decay_length;
        self
    }

    /// Mass-constrain every candidate called `name`
    pub fn with_mass_constraint(mut self, name: impl Into<String>) -> Self {
        self.mass_constraint_names.push(name.into());
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl fmt::Display for FitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FitConfig {{ max_iterations: {}, precision: {:.3e} ({}), max_diverging_iterations: {}, fast_divergence_rollback: {}, use_reference_state: {}, update_daughters: {}, seed variances: ({:.1e}, {:.1e}, {:.1e}), mass constraints: {:?}, verbose: {} }}",
            self.max_iterations,
            self.precision,
            self.convergence,
            self.max_diverging_iterations,
            self.fast_divergence_rollback,
            self.use_reference_state,
            self.update_daughters,
            self.seed_position_variance,
            self.seed_momentum_variance,
            self.seed_decay_length_variance,
            self.mass_constraint_names,
            self.verbose
        )
    }
}

/// Running statistics of a fit
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct FitStatistics {
    pub chi_square: f64,
    pub degrees_of_freedom: i64,
    /// Filter passes run by the last call to `fit()`
    pub iterations: usize,
    /// Current streak of passes with growing χ²
    pub diverging_iterations: usize,
}

impl fmt::Display for FitStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chi2 = {:.4}, ndof = {}, iterations = {}, diverging = {}",
            self.chi_square, self.degrees_of_freedom, self.iterations, self.diverging_iterations
        )
    }
}

/// Outcome of one fit, detached from the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitSummary {
    pub outcome: FitOutcome,
    pub failure: FailureReason,
    pub statistics: FitStatistics,
    pub p_value: f64,
}

impl FitSummary {
    pub fn is_success(&self) -> bool {
        self.outcome == FitOutcome::Success
    }

    /// χ² per degree of freedom, `None` when the fit has no degrees of freedom
    pub fn reduced_chi_square(&self) -> Option<f64> {
        (self.statistics.degrees_of_freedom > 0)
            .then(|| self.statistics.chi_square / self.statistics.degrees_of_freedom as f64)
    }
}

impl fmt::Display for FitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Decay Tree Fit Summary ===")?;
        writeln!(f, "Outcome:            {}", self.outcome)?;
        writeln!(
            f,
            "Failure reason:     {} (code {})",
            self.failure,
            self.failure.code()
        )?;
        writeln!(f, "Chi-square:         {:.6e}", self.statistics.chi_square)?;
        writeln!(f, "Degrees of freedom: {}", self.statistics.degrees_of_freedom)?;
        writeln!(f, "p-value:            {:.4}", self.p_value)?;
        writeln!(f, "Iterations:         {}", self.statistics.iterations)?;
        Ok(())
    }
}
