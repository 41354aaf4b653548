//! Four-momentum conservation at a decay.
//!
//! p_mother − Σ p_daughter = 0, and when the mother carries an energy parameter also
//! E_mother − Σ E_daughter = 0. Daughters without an energy parameter sit on their mass shell,
//! E = sqrt(|p|² + m²), which makes the energy row non-linear in their momenta.

use super::{Constraint, ConstraintError, ConstraintKind, Projection};
use nalgebra::{DVector, Vector3};

/// Where a node's momentum lives in the state vector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumSlot {
    pub mom_index: usize,
    pub energy_index: Option<usize>,
    /// Mass hypothesis, used when there is no energy parameter
    pub mass: f64,
}

impl MomentumSlot {
    pub fn momentum(&self, parameters: &DVector<f64>) -> Vector3<f64> {
        Vector3::new(
            parameters[self.mom_index],
            parameters[self.mom_index + 1],
            parameters[self.mom_index + 2],
        )
    }

    pub fn energy(&self, parameters: &DVector<f64>) -> f64 {
        match self.energy_index {
            Some(index) => parameters[index],
            None => (self.momentum(parameters).norm_squared() + self.mass * self.mass).sqrt(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KinematicConstraint {
    name: String,
    depth: usize,
    mother: MomentumSlot,
    daughters: Vec<MomentumSlot>,
}

impl KinematicConstraint {
    pub fn new(
        name: impl Into<String>,
        depth: usize,
        mother: MomentumSlot,
        daughters: Vec<MomentumSlot>,
    ) -> Self {
        Self {
            name: name.into(),
            depth,
            mother,
            daughters,
        }
    }
}

impl Constraint for KinematicConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Kinematic
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn dimension(&self) -> usize {
        if self.mother.energy_index.is_some() { 4 } else { 3 }
    }

    fn project(&self, parameters: &DVector<f64>) -> Result<Projection, ConstraintError> {
        let mut projection = Projection::new(self.dimension());

        for i in 0..3 {
            projection.residual[i] = parameters[self.mother.mom_index + i];
            projection.add_derivative(i, self.mother.mom_index + i, 1.0);
        }
        for daughter in &self.daughters {
            for i in 0..3 {
                projection.residual[i] -= parameters[daughter.mom_index + i];
                projection.add_derivative(i, daughter.mom_index + i, -1.0);
            }
        }

        if let Some(mother_energy) = self.mother.energy_index {
            projection.residual[3] = parameters[mother_energy];
            projection.add_derivative(3, mother_energy, 1.0);
            for daughter in &self.daughters {
                match daughter.energy_index {
                    Some(index) => {
                        projection.residual[3] -= parameters[index];
                        projection.add_derivative(3, index, -1.0);
                    }
                    None => {
                        let momentum = daughter.momentum(parameters);
                        let energy = daughter.energy(parameters);
                        projection.residual[3] -= energy;
                        if energy > 0.0 {
                            for i in 0..3 {
                                projection.add_derivative(
                                    3,
                                    daughter.mom_index + i,
                                    -momentum[i] / energy,
                                );
                            }
                        }
                    }
                }
            }
        }

        Ok(projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // layout: mother p(0..3) E(3), d1 p(4..7), d2 p(7..10) E(10)
    fn constraint() -> KinematicConstraint {
        KinematicConstraint::new(
            "D0",
            0,
            MomentumSlot { mom_index: 0, energy_index: Some(3), mass: 1.86484 },
            vec![
                MomentumSlot { mom_index: 4, energy_index: None, mass: 0.13957 },
                MomentumSlot { mom_index: 7, energy_index: Some(10), mass: 0.493677 },
            ],
        )
    }

    #[test]
    fn test_residual_vanishes_when_conserved() {
        let d1 = Vector3::<f64>::new(0.3, -0.1, 1.2);
        let d2 = Vector3::<f64>::new(-0.2, 0.4, 2.0);
        let e1 = (d1.norm_squared() + 0.13957f64.powi(2)).sqrt();
        let e2 = (d2.norm_squared() + 0.493677f64.powi(2)).sqrt();
        let sum = d1 + d2;
        let parameters = DVector::from_vec(vec![
            sum.x, sum.y, sum.z, e1 + e2, d1.x, d1.y, d1.z, d2.x, d2.y, d2.z, e2,
        ]);

        let projection = constraint().project(&parameters).unwrap();
        assert!(projection.residual.norm() < 1e-12);
    }

    #[test]
    fn test_energy_row_derivative_matches_mass_shell() {
        let parameters = DVector::from_vec(vec![
            0.0, 0.0, 3.0, 3.5, 0.3, -0.1, 1.2, -0.2, 0.4, 2.0, 2.1,
        ]);
        let projection = constraint().project(&parameters).unwrap();
        let jacobian = projection.jacobian();

        let column = projection.indices().iter().position(|&i| i == 6).unwrap();
        let d1 = Vector3::<f64>::new(0.3, -0.1, 1.2);
        let e1 = (d1.norm_squared() + 0.13957f64.powi(2)).sqrt();
        assert!((jacobian[(3, column)] + 1.2 / e1).abs() < 1e-12);
        // momentum rows are linear
        assert_eq!(jacobian[(2, column)], -1.0);
    }

    #[test]
    fn test_dimension_without_mother_energy() {
        let constraint = KinematicConstraint::new(
            "X",
            0,
            MomentumSlot { mom_index: 0, energy_index: None, mass: 1.0 },
            vec![MomentumSlot { mom_index: 3, energy_index: None, mass: 0.1 }],
        );
        assert_eq!(constraint.dimension(), 3);
    }
}
