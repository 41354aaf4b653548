//! Global fit state: the parameter vector of every node, its covariance and the running χ².

use nalgebra::{DMatrix, DVector, Vector3};

/// Parameter vector, covariance and accumulated fit statistics for one decay chain
///
/// The dimension is fixed once the chain is built. Constraints mutate the state in place through
/// the Kalman update; the fit engine keeps value copies of it as iteration snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalState {
    parameters: DVector<f64>,
    covariance: DMatrix<f64>,
    seed_variances: DVector<f64>,
    chi_square: f64,
    n_constraints: usize,
}

impl GlobalState {
    /// Zero-initialized state of the given dimension
    pub fn new(dimension: usize) -> Self {
        Self {
            parameters: DVector::zeros(dimension),
            covariance: DMatrix::zeros(dimension, dimension),
            seed_variances: DVector::zeros(dimension),
            chi_square: 0.0,
            n_constraints: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameters(&self) -> &DVector<f64> {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut DVector<f64> {
        &mut self.parameters
    }

    /// Replace the parameter vector; a vector of the wrong dimension is ignored and returns false
    pub fn set_parameters(&mut self, parameters: DVector<f64>) -> bool {
        if parameters.len() != self.dimension() {
            return false;
        }
        self.parameters = parameters;
        true
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn covariance_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.covariance
    }

    /// Replace the covariance; a matrix of the wrong shape is ignored and returns false
    pub fn set_covariance(&mut self, covariance: DMatrix<f64>) -> bool {
        let n = self.dimension();
        if covariance.shape() != (n, n) {
            return false;
        }
        self.covariance = covariance;
        true
    }

    /// Seed one parameter with a value and a loose, uncorrelated variance
    ///
    /// The variance is remembered so that [`reset_covariance`](Self::reset_covariance) can return
    /// to it at the start of every iteration.
    pub fn seed(&mut self, index: usize, value: f64, variance: f64) {
        self.parameters[index] = value;
        self.seed_variances[index] = variance;
        self.covariance.row_mut(index).fill(0.0);
        self.covariance.column_mut(index).fill(0.0);
        self.covariance[(index, index)] = variance;
    }

    /// Restore the diagonal seed covariance and clear the χ² bookkeeping
    pub fn reset_covariance(&mut self) {
        self.covariance = DMatrix::from_diagonal(&self.seed_variances);
        self.reset_statistics();
    }

    pub fn reset_statistics(&mut self) {
        self.chi_square = 0.0;
        self.n_constraints = 0;
    }

    /// Book the χ² contribution of a constraint block with `n_equations` rows
    pub fn add_chi_square(&mut self, chi_square: f64, n_equations: usize) {
        self.chi_square += chi_square;
        self.n_constraints += n_equations;
    }

    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    /// Number of constraint equations applied since the last reset
    pub fn n_constraints(&self) -> usize {
        self.n_constraints
    }

    /// Applied constraint equations minus state dimension
    pub fn degrees_of_freedom(&self) -> i64 {
        self.n_constraints as i64 - self.dimension() as i64
    }

    /// False if any diagonal covariance entry is negative
    pub fn test_covariance(&self) -> bool {
        self.covariance.diagonal().iter().all(|&v| v >= 0.0)
    }

    /// Immutable value copy used as the linearization point of the next pass
    pub fn snapshot(&self) -> GlobalState {
        self.clone()
    }

    /// Roll back to a previous snapshot
    pub fn restore(&mut self, snapshot: GlobalState) {
        *self = snapshot;
    }

    pub fn vector3(&self, start: usize) -> Vector3<f64> {
        Vector3::new(
            self.parameters[start],
            self.parameters[start + 1],
            self.parameters[start + 2],
        )
    }

    pub fn set_vector3(&mut self, start: usize, value: &Vector3<f64>) {
        self.parameters.rows_mut(start, 3).copy_from(value);
    }

    /// Covariance sub-matrix for an arbitrary, possibly non-contiguous index list
    pub fn sub_covariance(&self, indices: &[usize]) -> DMatrix<f64> {
        DMatrix::from_fn(indices.len(), indices.len(), |r, c| {
            self.covariance[(indices[r], indices[c])]
        })
    }

    /// Average the covariance with its transpose to remove accumulated asymmetry
    pub fn symmetrize(&mut self) {
        let transposed = self.covariance.transpose();
        self.covariance += transposed;
        self.covariance *= 0.5;
    }
}
