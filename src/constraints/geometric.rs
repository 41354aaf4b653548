//! Flight geometry of a long-lived composite.
//!
//! x_decay − x_production − L · p/|p| = 0, where L is the decay-length parameter of the node.

use super::{Constraint, ConstraintError, ConstraintKind, Projection};
use nalgebra::{DVector, Vector3};

#[derive(Debug, Clone)]
pub struct GeometricConstraint {
    name: String,
    depth: usize,
    vertex_index: usize,
    production_index: usize,
    mom_index: usize,
    tau_index: usize,
}

impl GeometricConstraint {
    pub fn new(
        name: impl Into<String>,
        depth: usize,
        vertex_index: usize,
        production_index: usize,
        mom_index: usize,
        tau_index: usize,
    ) -> Self {
        Self {
            name: name.into(),
            depth,
            vertex_index,
            production_index,
            mom_index,
            tau_index,
        }
    }
}

impl Constraint for GeometricConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Geometric
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn dimension(&self) -> usize {
        3
    }

    fn project(&self, parameters: &DVector<f64>) -> Result<Projection, ConstraintError> {
        let p = Vector3::new(
            parameters[self.mom_index],
            parameters[self.mom_index + 1],
            parameters[self.mom_index + 2],
        );
        let mom = p.norm();
        if mom <= 0.0 || !mom.is_finite() {
            return Err(ConstraintError::NonFinite(format!(
                "{} has no flight direction",
                self.name
            )));
        }
        let length = parameters[self.tau_index];
        let direction = p / mom;

        let mut projection = Projection::new(3);
        for i in 0..3 {
            projection.residual[i] = parameters[self.vertex_index + i]
                - parameters[self.production_index + i]
                - length * direction[i];
            projection.add_derivative(i, self.vertex_index + i, 1.0);
            projection.add_derivative(i, self.production_index + i, -1.0);
            projection.add_derivative(i, self.tau_index, -direction[i]);
            // ∂(p_i/|p|)/∂p_j = (δ_ij − p̂_i p̂_j) / |p|
            for j in 0..3 {
                let delta = if i == j { 1.0 } else { 0.0 };
                let d_direction = (delta - direction[i] * direction[j]) / mom;
                projection.add_derivative(i, self.mom_index + j, -length * d_direction);
            }
        }
        Ok(projection)
    }
}
