//! Constraint contract and the reference constraint set
//!
//! Every relation between fit parameters is expressed as a [`Constraint`]: a block of equations
//! `h(x) = 0` (optionally with a measurement covariance) that the fit linearizes and applies to
//! the [`GlobalState`] through a Kalman update.
//!
//! # Module Structure
//!
//! - `kalman`: gain, covariance update and χ² bookkeeping shared by all constraints
//! - `measurement`: direct measurement of a final-state vertex point and momentum
//! - `kinematic`: four-momentum conservation at a decay
//! - `geometric`: decay vertex = production vertex + decay length along the momentum
//! - `mass`: invariant-mass constraint on a node with an energy parameter
//!
//! Detector-specific projections (helices, calorimeter clusters) are implemented outside this
//! crate against the same trait.

use crate::core::state::GlobalState;
use nalgebra::{DMatrix, DVector};
use std::fmt;
use thiserror::Error;

pub mod geometric;
pub mod kalman;
pub mod kinematic;
pub mod mass;
pub mod measurement;

pub use geometric::GeometricConstraint;
pub use kinematic::{KinematicConstraint, MomentumSlot};
pub use mass::MassConstraint;
pub use measurement::MeasurementConstraint;

/// Errors raised while initializing or filtering a constraint
///
/// These never escape [`FitEngine::fit`](crate::FitEngine::fit): the engine turns them into
/// `BadInput` during seeding and `Failed` during iteration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConstraintError {
    /// The innovation covariance could not be inverted
    #[error("Singular projection in {0}")]
    Singular(String),

    /// A residual, derivative or seed value is NaN or infinite
    #[error("Non-finite value in {0}")]
    NonFinite(String),

    /// Required input (usually a measurement) is absent
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// Seed values are inconsistent with the decay hypothesis
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),
}

/// Application order of constraint families within a filter pass
///
/// Constraints are applied by kind first, then deepest node first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintKind {
    Measurement,
    Kinematic,
    Geometric,
    Mass,
    /// Caller-supplied constraints, applied after the built-in ones
    External,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::Measurement => write!(f, "measurement"),
            ConstraintKind::Kinematic => write!(f, "kinematic"),
            ConstraintKind::Geometric => write!(f, "geometric"),
            ConstraintKind::Mass => write!(f, "mass"),
            ConstraintKind::External => write!(f, "external"),
        }
    }
}

/// Linearized constraint block: residual, Jacobian over the touched parameters, and measurement
/// covariance
///
/// The Jacobian is stored column-compressed: column `c` holds the derivatives with respect to
/// global parameter `indices()[c]`. Adding a derivative twice for the same parameter accumulates.
#[derive(Debug, Clone)]
pub struct Projection {
    pub residual: DVector<f64>,
    pub covariance: DMatrix<f64>,
    indices: Vec<usize>,
    derivatives: Vec<(usize, usize, f64)>,
}

impl Projection {
    /// Empty projection with `n_equations` rows and zero measurement covariance
    pub fn new(n_equations: usize) -> Self {
        Self {
            residual: DVector::zeros(n_equations),
            covariance: DMatrix::zeros(n_equations, n_equations),
            indices: Vec::new(),
            derivatives: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.residual.len()
    }

    /// Global parameter indices, one per Jacobian column
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    fn column(&mut self, index: usize) -> usize {
        match self.indices.iter().position(|&i| i == index) {
            Some(column) => column,
            None => {
                self.indices.push(index);
                self.indices.len() - 1
            }
        }
    }

    /// Add `value` to ∂residual[row]/∂x[index]
    pub fn add_derivative(&mut self, row: usize, index: usize, value: f64) {
        let column = self.column(index);
        self.derivatives.push((row, column, value));
    }

    /// Dense Jacobian of shape `dimension() × indices().len()`
    pub fn jacobian(&self) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(self.dimension(), self.indices.len());
        for &(row, column, value) in &self.derivatives {
            jacobian[(row, column)] += value;
        }
        jacobian
    }

    /// Move the residual from the linearization point `reference` to `current`
    ///
    /// r(x) ≈ r(x_ref) + H·(x − x_ref), with H evaluated at x_ref.
    pub fn shift(&mut self, current: &DVector<f64>, reference: &DVector<f64>) {
        for &(row, column, value) in &self.derivatives {
            let index = self.indices[column];
            self.residual[row] += value * (current[index] - reference[index]);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.residual.iter().all(|v| v.is_finite())
            && self.covariance.iter().all(|v| v.is_finite())
            && self.derivatives.iter().all(|(_, _, v)| v.is_finite())
    }
}

/// A relation between fit parameters
///
/// Implementors provide the linearization ([`project`](Self::project)); the default
/// [`filter`](Self::filter) applies it to the state with a Kalman update. A constraint may
/// override `filter` when it needs to manage the state itself.
pub trait Constraint: fmt::Debug + Send + Sync {
    /// Human-readable label used in logs and errors
    fn name(&self) -> &str;

    fn kind(&self) -> ConstraintKind;

    /// Depth of the node the constraint belongs to; deeper nodes are filtered first
    fn depth(&self) -> usize {
        0
    }

    /// Number of equations contributed to the degrees of freedom
    fn dimension(&self) -> usize;

    /// Validate inputs after the state has been seeded
    fn initialize(&self, _state: &mut GlobalState) -> Result<(), ConstraintError> {
        Ok(())
    }

    /// Residual, Jacobian and measurement covariance at `parameters`
    fn project(&self, parameters: &DVector<f64>) -> Result<Projection, ConstraintError>;

    /// Apply the constraint to `state`
    ///
    /// With a `reference` snapshot the constraint is linearized about the snapshot instead of the
    /// live state; the snapshot itself is never modified.
    fn filter(
        &self,
        state: &mut GlobalState,
        reference: Option<&GlobalState>,
    ) -> Result<(), ConstraintError> {
        let projection = match reference {
            Some(reference) => {
                let mut projection = self.project(reference.parameters())?;
                projection.shift(state.parameters(), reference.parameters());
                projection
            }
            None => self.project(state.parameters())?,
        };
        kalman::update(state, &projection, self.name())
    }
}
