//! Direct measurement of a final-state particle.
//!
//! Charged particles measure a point on their production vertex and their momentum; neutral ones
//! only their momentum. The relation is linear with unit Jacobian, weighted by the candidate's
//! measurement covariance.

use super::{Constraint, ConstraintError, ConstraintKind, Projection};
use crate::core::candidate::MeasuredState;
use crate::core::state::GlobalState;
use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone)]
pub struct MeasurementConstraint {
    name: String,
    depth: usize,
    /// Production vertex, measured only for charged candidates
    vertex_index: Option<usize>,
    mom_index: usize,
    measurement: Option<MeasuredState>,
}

impl MeasurementConstraint {
    pub fn new(
        name: impl Into<String>,
        depth: usize,
        vertex_index: Option<usize>,
        mom_index: usize,
        measurement: Option<MeasuredState>,
    ) -> Self {
        Self {
            name: name.into(),
            depth,
            vertex_index,
            mom_index,
            measurement,
        }
    }

    fn measured(&self) -> Result<&MeasuredState, ConstraintError> {
        self.measurement
            .as_ref()
            .ok_or_else(|| ConstraintError::MissingInput(format!("{} has no measurement", self.name)))
    }

    /// Rows of the 6×6 measurement covariance used by this constraint
    fn measured_rows(&self) -> &'static [usize] {
        if self.vertex_index.is_some() {
            &[0, 1, 2, 3, 4, 5]
        } else {
            &[3, 4, 5]
        }
    }

    fn measurement_covariance(&self, measured: &MeasuredState) -> DMatrix<f64> {
        let rows = self.measured_rows();
        DMatrix::from_fn(rows.len(), rows.len(), |r, c| {
            measured.covariance[(rows[r], rows[c])]
        })
    }
}

impl Constraint for MeasurementConstraint {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Measurement
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn dimension(&self) -> usize {
        self.measured_rows().len()
    }

    fn initialize(&self, _state: &mut GlobalState) -> Result<(), ConstraintError> {
        let measured = self.measured()?;
        let finite = measured.position.iter().all(|v| v.is_finite())
            && measured.momentum.iter().all(|v| v.is_finite())
            && measured.covariance.iter().all(|v| v.is_finite());
        if !finite {
            return Err(ConstraintError::NonFinite(self.name.clone()));
        }
        if self.measurement_covariance(measured).cholesky().is_none() {
            return Err(ConstraintError::InvalidSeed(format!(
                "{} measurement covariance is not positive definite",
                self.name
            )));
        }
        Ok(())
    }

    fn project(&self, parameters: &DVector<f64>) -> Result<Projection, ConstraintError> {
        let measured = self.measured()?;
        let mut projection = Projection::new(self.dimension());
        projection.covariance = self.measurement_covariance(measured);

        let mut row = 0;
        if let Some(vertex) = self.vertex_index {
            for i in 0..3 {
                projection.residual[row] = parameters[vertex + i] - measured.position[i];
                projection.add_derivative(row, vertex + i, 1.0);
                row += 1;
            }
        }
        for i in 0..3 {
            projection.residual[row] = parameters[self.mom_index + i] - measured.momentum[i];
            projection.add_derivative(row, self.mom_index + i, 1.0);
            row += 1;
        }
        Ok(projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix6, Vector3};

    fn measured() -> MeasuredState {
        MeasuredState {
            position: Vector3::new(0.1, 0.2, 0.3),
            momentum: Vector3::new(1.0, 2.0, 3.0),
            covariance: Matrix6::from_diagonal(&nalgebra::Vector6::new(
                1e-4, 1e-4, 1e-4, 4e-4, 4e-4, 4e-4,
            )),
        }
    }

    #[test]
    fn test_charged_measurement_projection() {
        let constraint = MeasurementConstraint::new("pi+", 1, Some(0), 3, Some(measured()));
        let parameters = DVector::from_vec(vec![0.1, 0.2, 0.4, 1.0, 2.5, 3.0]);

        let projection = constraint.project(&parameters).unwrap();

        assert_eq!(constraint.dimension(), 6);
        assert!((projection.residual[2] - 0.1).abs() < 1e-12);
        assert!((projection.residual[4] - 0.5).abs() < 1e-12);
        assert_eq!(projection.indices(), &[0, 1, 2, 3, 4, 5]);
        assert_eq!(projection.covariance[(3, 3)], 4e-4);
    }

    #[test]
    fn test_neutral_measures_momentum_only() {
        let constraint = MeasurementConstraint::new("gamma", 1, None, 0, Some(measured()));
        let parameters = DVector::from_vec(vec![1.0, 2.0, 3.0]);

        let projection = constraint.project(&parameters).unwrap();

        assert_eq!(constraint.dimension(), 3);
        assert_eq!(projection.covariance.shape(), (3, 3));
        assert_eq!(projection.covariance[(0, 0)], 4e-4);
        assert!(projection.residual.norm() < 1e-12);
    }

    #[test]
    fn test_missing_measurement_is_bad_input() {
        let constraint = MeasurementConstraint::new("K+", 1, Some(0), 3, None);
        let mut state = GlobalState::new(6);
        assert!(matches!(
            constraint.initialize(&mut state),
            Err(ConstraintError::MissingInput(_))
        ));
    }

    #[test]
    fn test_degenerate_covariance_is_bad_input() {
        let mut bad = measured();
        bad.covariance[(4, 4)] = -1.0;
        let constraint = MeasurementConstraint::new("mu+", 1, Some(0), 3, Some(bad));
        let mut state = GlobalState::new(6);
        assert!(matches!(
            constraint.initialize(&mut state),
            Err(ConstraintError::InvalidSeed(_))
        ));
    }
}
