//! Error types for the decay-tree-fitter library
//!
//! Fit outcomes (bad input, numerical failure, non-convergence) are reported through
//! [`FitOutcome`](crate::optimizer::FitOutcome) and never through this type. `FitterError` is
//! reserved for API contract violations such as asking for a candidate that is not part of the
//! fitted tree.

use crate::constraints::ConstraintError;
use crate::core::candidate::CandidateId;
use thiserror::Error;

/// Main result type used throughout the decay-tree-fitter library
pub type FitterResult<T> = Result<T, FitterError>;

/// Main error type for the decay-tree-fitter library
#[derive(Debug, Clone, Error)]
pub enum FitterError {
    /// The candidate is not part of the decay chain owned by the engine
    #[error("Candidate {0} is not part of the fitted decay chain")]
    UnknownCandidate(CandidateId),

    /// The candidate id does not exist in the candidate tree
    #[error("Candidate {0} does not exist in the candidate tree")]
    MissingCandidate(CandidateId),

    /// Malformed decay hypothesis (shared daughters, cycles, empty tree)
    #[error("Invalid decay tree: {0}")]
    InvalidTree(String),

    /// A constraint was requested that the node layout cannot support
    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),

    /// Constraint errors surfaced outside of the fit loop, e.g. by `DecayChain::seeded_state`
    #[error("Constraint error: {0}")]
    Constraint(String),
}

impl From<ConstraintError> for FitterError {
    fn from(err: ConstraintError) -> Self {
        FitterError::Constraint(err.to_string())
    }
}
