//! Global Kalman-filter fit of one decay tree.
//!
//! The engine seeds the state from the chain, then runs filter passes until the χ² settles:
//!
//! - pass 0 filters straight from the seed
//! - every later pass restores the loose seed covariance and filters again, linearized about a
//!   snapshot of the previous pass (or about the live state when reference states are disabled)
//! - |Δχ²| below the precision ends the loop with `Success`
//! - a χ² jump above max(2·ndof, 2·χ²_prev) rolls back one pass and ends with `Failed`
//! - χ² growing for `max_diverging_iterations` passes in a row ends with `NonConverged`
//! - running out of passes ends with `NonConverged`
//!
//! Whatever the loop decided, a negative variance on the covariance diagonal turns the outcome into
//! `Failed`. The failure reason is written to the head candidate after every fit.
//!
//! Calling [`FitEngine::fit`] again does not re-seed: the next call continues from the current
//! state with the previous χ² as its baseline, so an already converged fit finishes in one pass.

use crate::constraints::Constraint;
use crate::core::candidate::{CandidateId, CandidateTree, FitResult};
use crate::core::chain::DecayChain;
use crate::core::node::NodeId;
use crate::core::state::GlobalState;
use crate::error::{FitterError, FitterResult};
use crate::optimizer::{FailureReason, FitConfig, FitOutcome, FitStatistics, FitSummary};
use crate::projector::{ResultProjector, p_value};
use tracing::{debug, info, warn};

/// Fits one candidate tree, borrowed mutably for the engine's lifetime
pub struct FitEngine<'a> {
    tree: &'a mut CandidateTree,
    root: CandidateId,
    config: FitConfig,
    chain: DecayChain,
    state: GlobalState,
    outcome: FitOutcome,
    failure: FailureReason,
    statistics: FitStatistics,
    initialized: bool,
}

impl<'a> FitEngine<'a> {
    /// Engine for the whole tree; the tree must have exactly one head
    pub fn new(tree: &'a mut CandidateTree, config: FitConfig) -> FitterResult<Self> {
        let root = tree.root().ok_or_else(|| {
            FitterError::InvalidTree("the tree has no unique head candidate".to_string())
        })?;
        Self::for_candidate(tree, root, config)
    }

    /// Engine for the subtree headed by `root`
    pub fn for_candidate(
        tree: &'a mut CandidateTree,
        root: CandidateId,
        config: FitConfig,
    ) -> FitterResult<Self> {
        let chain = DecayChain::build(tree, root, &config)?;
        let state = GlobalState::new(chain.dimension());
        Ok(Self {
            tree,
            root,
            config,
            chain,
            state,
            outcome: FitOutcome::Unfitted,
            failure: FailureReason::NoFailure,
            statistics: FitStatistics::default(),
            initialized: false,
        })
    }

    /// Add a caller-supplied constraint to every filter pass
    pub fn with_constraint(mut self, constraint: Box<dyn Constraint>) -> Self {
        self.add_constraint(constraint);
        self
    }

    pub fn add_constraint(&mut self, constraint: Box<dyn Constraint>) {
        self.chain.add_constraint(constraint);
    }

    /// Constrain the invariant mass of `candidate` to its mass hypothesis
    pub fn with_mass_constraint(mut self, candidate: CandidateId) -> FitterResult<Self> {
        self.chain.mass_constraint(candidate)?;
        Ok(self)
    }

    /// Run the fit; true iff the outcome is `Success`
    pub fn fit(&mut self) -> bool {
        if self.outcome == FitOutcome::BadInput {
            return false;
        }

        let mut baseline = if self.initialized {
            Some(self.state.chi_square())
        } else {
            match self.chain.seeded_state() {
                Ok(state) => self.state = state,
                Err(err) => {
                    warn!("Cannot seed decay tree fit of {}: {}", self.root_name(), err);
                    self.finish(FitOutcome::BadInput, FailureReason::BadInput);
                    return false;
                }
            }
            self.initialized = true;
            None
        };

        if self.config.verbose {
            info!(
                "Fitting {} with {} parameters and {} constraint equations",
                self.root_name(),
                self.chain.dimension(),
                self.chain.n_constraint_equations()
            );
        }

        let mut decision = None;
        self.statistics.iterations = 0;
        self.statistics.diverging_iterations = 0;

        for iteration in 0..self.config.max_iterations {
            let snapshot = self.state.snapshot();
            if baseline.is_some() {
                self.state.reset_covariance();
            }
            let reference = (baseline.is_some() && self.config.use_reference_state)
                .then_some(&snapshot);

            let filtered = self.chain.apply_constraints(&mut self.state, reference);
            self.statistics.iterations += 1;
            if let Err(err) = filtered {
                warn!("Filter pass {} failed: {}", iteration, err);
                decision = Some((FitOutcome::Failed, FailureReason::LoopFailure));
                break;
            }

            let chi_square = self.state.chi_square();
            let degrees_of_freedom = self.state.degrees_of_freedom();
            if self.config.verbose {
                info!(
                    "Iteration {}: chi2 = {:.6}, ndof = {}",
                    iteration, chi_square, degrees_of_freedom
                );
            } else {
                debug!(
                    "Iteration {}: chi2 = {:.6}, ndof = {}",
                    iteration, chi_square, degrees_of_freedom
                );
            }

            if let Some(previous) = baseline
                && let Some(status) =
                    self.check_convergence(chi_square - previous, previous, degrees_of_freedom)
            {
                if status.1 == FailureReason::LoopFailure {
                    self.state.restore(snapshot);
                }
                decision = Some(status);
                break;
            }
            baseline = Some(chi_square);
        }

        let (mut outcome, mut failure) =
            decision.unwrap_or((FitOutcome::NonConverged, FailureReason::IterationBudget));

        if !self.state.test_covariance() {
            warn!(
                "Negative variance on the covariance diagonal after fitting {}",
                self.root_name()
            );
            outcome = FitOutcome::Failed;
            failure = FailureReason::CovarianceFailure;
        }
        if outcome == FitOutcome::Success {
            self.chain.enforce_momentum_conservation(&mut self.state);
        }

        self.finish(outcome, failure);
        outcome == FitOutcome::Success
    }

    /// Decide the fate of a pass from its χ² change
    fn check_convergence(
        &mut self,
        delta: f64,
        previous: f64,
        degrees_of_freedom: i64,
    ) -> Option<(FitOutcome, FailureReason)> {
        if self
            .config
            .convergence
            .is_converged(delta, previous, self.config.precision)
        {
            return Some((FitOutcome::Success, FailureReason::NoFailure));
        }

        let explosion = (2.0 * degrees_of_freedom as f64).max(2.0 * previous);
        if self.config.fast_divergence_rollback && delta > explosion {
            warn!(
                "chi2 jumped by {:.4} (limit {:.4}), rolling back one pass",
                delta, explosion
            );
            return Some((FitOutcome::Failed, FailureReason::LoopFailure));
        }

        if delta > 0.0 {
            self.statistics.diverging_iterations += 1;
            if self.statistics.diverging_iterations >= self.config.max_diverging_iterations {
                return Some((FitOutcome::NonConverged, FailureReason::NonConverged));
            }
        } else {
            self.statistics.diverging_iterations = 0;
        }
        None
    }

    fn finish(&mut self, outcome: FitOutcome, failure: FailureReason) {
        self.outcome = outcome;
        self.failure = failure;
        self.statistics.chi_square = self.state.chi_square();
        self.statistics.degrees_of_freedom = self.state.degrees_of_freedom();

        if let Some(root) = self.tree.get_mut(self.root) {
            root.fit_failure = Some(failure);
        }

        if self.config.verbose {
            info!("{}: {} ({})", self.root_name(), outcome, self.statistics);
        } else {
            debug!("{}: {} ({})", self.root_name(), outcome, self.statistics);
        }
    }

    fn root_name(&self) -> &str {
        self.tree
            .get(self.root)
            .map(|candidate| candidate.name.as_str())
            .unwrap_or("<unknown>")
    }

    pub fn status(&self) -> FitOutcome {
        self.outcome
    }

    pub fn failure_reason(&self) -> FailureReason {
        self.failure
    }

    pub fn chi_square(&self) -> f64 {
        self.state.chi_square()
    }

    pub fn degrees_of_freedom(&self) -> i64 {
        self.state.degrees_of_freedom()
    }

    /// Filter passes run by the last call to [`fit`](Self::fit)
    pub fn iterations(&self) -> usize {
        self.statistics.iterations
    }

    pub fn statistics(&self) -> &FitStatistics {
        &self.statistics
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    pub fn chain(&self) -> &DecayChain {
        &self.chain
    }

    pub fn tree(&self) -> &CandidateTree {
        &*self.tree
    }

    pub fn root(&self) -> CandidateId {
        self.root
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn summary(&self) -> FitSummary {
        FitSummary {
            outcome: self.outcome,
            failure: self.failure,
            statistics: self.statistics,
            p_value: p_value(self.statistics.chi_square, self.statistics.degrees_of_freedom),
        }
    }

    /// Results projected for `candidate`, without touching the tree
    pub fn result(&self, candidate: CandidateId) -> FitterResult<FitResult> {
        let node = self
            .chain
            .locate(candidate)
            .ok_or(FitterError::UnknownCandidate(candidate))?;
        ResultProjector::new(&self.chain, &self.state).project(node)
    }

    /// Write the fitted values into `candidate` and, per configuration, its daughters
    ///
    /// Recursion stops at externally corrected and invisible candidates. Returns `Ok(false)` and
    /// writes nothing unless the last fit succeeded.
    pub fn update_candidate(&mut self, candidate: CandidateId) -> FitterResult<bool> {
        let node = self
            .chain
            .locate(candidate)
            .ok_or(FitterError::UnknownCandidate(candidate))?;
        if self.outcome != FitOutcome::Success {
            return Ok(false);
        }
        self.write_results(node)?;
        Ok(true)
    }

    /// Write the fitted values into the head candidate and its descendants
    pub fn update_tree(&mut self) -> FitterResult<bool> {
        self.update_candidate(self.root)
    }

    fn write_results(&mut self, start: NodeId) -> FitterResult<()> {
        let projector = ResultProjector::new(&self.chain, &self.state);
        let mut pending = vec![start];

        while let Some(id) = pending.pop() {
            let result = projector.project(id)?;
            let node = self.chain.node(id).ok_or_else(|| {
                FitterError::InvalidTree(format!("node {id} is not part of the chain"))
            })?;
            let candidate = self
                .tree
                .get_mut(node.candidate())
                .ok_or(FitterError::MissingCandidate(node.candidate()))?;

            let recurse = self.config.update_daughters
                && !candidate.externally_corrected
                && !candidate.invisible;
            candidate.fit_result = Some(result);
            if recurse {
                pending.extend(node.daughters().iter().rev());
            }
        }
        Ok(())
    }
}
