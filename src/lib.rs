//! Decay-tree vertex fitting.
//!
//! A decay hypothesis (which particle decays into which) is fitted as one coupled least-squares
//! problem: every vertex, momentum and flight distance of the tree is solved for at once with a
//! global Kalman filter, and the fitted values with their covariances are written back into the
//! caller's candidates.
//!
//! ```no_run
//! use decay_tree_fitter::{Candidate, CandidateTree, FitConfig, FitEngine};
//! use nalgebra::{Matrix6, Vector3};
//!
//! let mut tree = CandidateTree::new();
//! let cov = Matrix6::identity() * 1e-4;
//! let vertex = Vector3::new(0.0, 0.0, 2.0);
//! let pip = tree.add(Candidate::charged("pi+", 0.13957, vertex, Vector3::new(0.2, 0.0, 1.0), cov));
//! let pim = tree.add(Candidate::charged("pi-", 0.13957, vertex, Vector3::new(-0.2, 0.0, 1.0), cov));
//! tree.add_decay(Candidate::composite("K0S", 0.497611, vertex), &[pip, pim]).unwrap();
//!
//! let mut engine = FitEngine::new(&mut tree, FitConfig::default()).unwrap();
//! if engine.fit() {
//!     engine.update_tree().unwrap();
//! }
//! ```

pub mod constraints;
pub mod core;
pub mod error;
pub mod logger;
pub mod optimizer;
pub mod projector;

pub use constraints::{Constraint, ConstraintError, ConstraintKind, Projection};
pub use crate::core::candidate::{
    Candidate, CandidateId, CandidateTree, FitQuality, FitResult, FlightInfo, Matrix7,
    MeasuredState, SourceKind,
};
pub use crate::core::chain::DecayChain;
pub use crate::core::node::{NodeId, NodeKind, ParticleNode};
pub use crate::core::state::GlobalState;
pub use error::{FitterError, FitterResult};
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{
    ConvergenceCriterion, FailureReason, FitConfig, FitEngine, FitOutcome, FitStatistics,
    FitSummary, fit_batch, fit_tree,
};
pub use projector::{ResultProjector, SPEED_OF_LIGHT, p_value, proper_time};
