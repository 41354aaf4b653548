//! Kalman measurement update of the global state
//!
//! For a linearized block with residual r, Jacobian H (over the touched columns) and measurement
//! covariance V:
//!
//! ```text
//! R  = V + H C Hᵀ
//! K  = C Hᵀ R⁻¹
//! x' = x − K r
//! C' = C − K (C Hᵀ)ᵀ
//! χ² += rᵀ R⁻¹ r
//! ```
//!
//! Only the columns of C that the constraint touches are gathered, so the cost is
//! O(dim² · n_equations) rather than a full dense product.

use super::{ConstraintError, Projection};
use crate::core::state::GlobalState;
use nalgebra::DMatrix;

/// Apply `projection` to `state` and book its χ² contribution
pub fn update(
    state: &mut GlobalState,
    projection: &Projection,
    name: &str,
) -> Result<(), ConstraintError> {
    if !projection.is_finite() {
        return Err(ConstraintError::NonFinite(name.to_string()));
    }

    let indices = projection.indices();
    let n_equations = projection.dimension();
    let dimension = state.dimension();
    if indices.iter().any(|&i| i >= dimension) {
        return Err(ConstraintError::MissingInput(format!(
            "{name} refers to a parameter outside the state"
        )));
    }

    let h = projection.jacobian();

    // C Hᵀ, restricted to the columns H actually touches
    let c_columns = DMatrix::from_fn(dimension, indices.len(), |r, c| {
        state.covariance()[(r, indices[c])]
    });
    let cht = &c_columns * h.transpose();

    let cht_touched = DMatrix::from_fn(indices.len(), n_equations, |r, c| cht[(indices[r], c)]);
    let innovation = &projection.covariance + &h * cht_touched;

    let cholesky = innovation
        .cholesky()
        .ok_or_else(|| ConstraintError::Singular(name.to_string()))?;
    let r_inv = cholesky.inverse();

    let gain = &cht * &r_inv;
    let chi_square = projection.residual.dot(&(&r_inv * &projection.residual));
    if !chi_square.is_finite() {
        return Err(ConstraintError::NonFinite(name.to_string()));
    }

    *state.parameters_mut() -= &gain * &projection.residual;
    *state.covariance_mut() -= &gain * cht.transpose();
    state.symmetrize();
    state.add_chi_square(chi_square, n_equations);

    Ok(())
}
