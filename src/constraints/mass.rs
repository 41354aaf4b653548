//! Invariant-mass constraint, E² − |p|² − m² = 0.
//!
//! Only meaningful on nodes that carry an energy parameter; nodes without one are already on
//! their mass shell by construction.

use super::{Constraint, ConstraintError, ConstraintKind, Projection};
use nalgebra::DVector;

#[derive(Debug, Clone)]
pub struct MassConstraint {
    name: String,
    depth: usize,
    mom_index: usize,
    energy_index: usize,
    mass: f64,
}

impl MassConstraint {
    pub fn new(
        name: impl Into<String>,
        depth: usize,
        mom_index: usize,
        energy_index: usize,
        mass: f64,
    ) -> Self {
        Self {
            name: name.into(),
            depth,
            mom_index,
            energy_index,
            mass,
        }
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }
}

impl Constraint for MassConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Mass
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn dimension(&self) -> usize {
        1
    }

    fn project(&self, parameters: &DVector<f64>) -> Result<Projection, ConstraintError> {
        let energy = parameters[self.energy_index];
        let mut projection = Projection::new(1);
        projection.residual[0] = energy * energy - self.mass * self.mass;
        projection.add_derivative(0, self.energy_index, 2.0 * energy);
        for i in 0..3 {
            let p = parameters[self.mom_index + i];
            projection.residual[0] -= p * p;
            projection.add_derivative(0, self.mom_index + i, -2.0 * p);
        }
        Ok(projection)
    }
}
