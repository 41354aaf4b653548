//! Conversion of the fitted state into per-candidate results.
//!
//! For each node the projector extracts position and four-momentum, a 7×7 covariance ordered as
//! (px, py, pz, E, x, y, z), and, for nodes that fly away from their production vertex, the decay
//! length and proper time. Fit quality (χ², ndof, p-value) is only attached to the head.

use crate::core::candidate::{FitQuality, FitResult, FlightInfo, Matrix7};
use crate::core::chain::DecayChain;
use crate::core::node::NodeId;
use crate::core::state::GlobalState;
use crate::error::{FitterError, FitterResult};
use nalgebra::{Matrix4, RowVector4, SMatrix, Vector3, Vector4};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Speed of light in cm/ns
pub const SPEED_OF_LIGHT: f64 = 29.9792458;

/// Upper-tail χ² probability; zero when there are no degrees of freedom
pub fn p_value(chi_square: f64, degrees_of_freedom: i64) -> f64 {
    if degrees_of_freedom <= 0 || !chi_square.is_finite() {
        return 0.0;
    }
    match ChiSquared::new(degrees_of_freedom as f64) {
        Ok(distribution) => distribution.sf(chi_square.max(0.0)),
        Err(_) => 0.0,
    }
}

/// Proper time t = L·m / (|p|·c) and its uncertainty
///
/// `covariance` is the covariance of (L, px, py, pz). Returns `None` for a vanishing momentum.
pub fn proper_time(
    decay_length: f64,
    momentum: &Vector3<f64>,
    mass: f64,
    covariance: &Matrix4<f64>,
) -> Option<(f64, f64)> {
    let mom = momentum.norm();
    if !(mom > 0.0) {
        return None;
    }
    let scale = mass / (mom * SPEED_OF_LIGHT);
    let time = decay_length * scale;

    // ∂t/∂L = m/(|p|c), ∂t/∂p_i = −L·m·p_i/(|p|³c)
    let d_momentum = -time * momentum / (mom * mom);
    let jacobian = RowVector4::new(scale, d_momentum.x, d_momentum.y, d_momentum.z);
    let variance = (jacobian * covariance * jacobian.transpose())[(0, 0)];

    Some((time, variance.max(0.0).sqrt()))
}

/// Read-only view of a fitted chain
pub struct ResultProjector<'s> {
    chain: &'s DecayChain,
    state: &'s GlobalState,
}

impl<'s> ResultProjector<'s> {
    pub fn new(chain: &'s DecayChain, state: &'s GlobalState) -> Self {
        Self { chain, state }
    }

    fn pos_index(&self, node: NodeId) -> FitterResult<usize> {
        self.chain.pos_index(node).ok_or_else(|| {
            FitterError::InvalidTree(format!("node {node} has no vertex in the chain"))
        })
    }

    pub fn position(&self, node: NodeId) -> FitterResult<Vector3<f64>> {
        Ok(self.state.vector3(self.pos_index(node)?))
    }

    pub fn four_momentum(&self, node: NodeId) -> FitterResult<Vector4<f64>> {
        self.chain
            .node(node)
            .ok_or_else(|| FitterError::InvalidTree(format!("node {node} is not part of the chain")))?;
        Ok(self.chain.four_momentum(self.state, node))
    }

    /// Covariance of (px, py, pz, E, x, y, z)
    pub fn momentum_vertex_covariance(&self, node: NodeId) -> FitterResult<Matrix7> {
        let particle = self
            .chain
            .node(node)
            .ok_or_else(|| FitterError::InvalidTree(format!("node {node} is not part of the chain")))?;
        let pos = self.pos_index(node)?;
        let mom = particle.mom_index();

        if let Some(energy) = particle.energy_index() {
            let indices = [mom, mom + 1, mom + 2, energy, pos, pos + 1, pos + 2];
            let block = self.state.sub_covariance(&indices);
            return Ok(Matrix7::from_fn(|r, c| block[(r, c)]));
        }

        // fixed mass shell: E = sqrt(|p|² + m²), ∂E/∂p_i = p_i/E
        let indices = [mom, mom + 1, mom + 2, pos, pos + 1, pos + 2];
        let block = self.state.sub_covariance(&indices);
        let input = SMatrix::<f64, 6, 6>::from_fn(|r, c| block[(r, c)]);

        let p = self.state.vector3(mom);
        let energy = (p.norm_squared() + particle.mass() * particle.mass()).sqrt();
        let mut jacobian = SMatrix::<f64, 7, 6>::zeros();
        for i in 0..3 {
            jacobian[(i, i)] = 1.0;
            jacobian[(4 + i, 3 + i)] = 1.0;
            if energy > 0.0 {
                jacobian[(3, i)] = p[i] / energy;
            }
        }
        let mut covariance = jacobian * input * jacobian.transpose();
        covariance = (covariance + covariance.transpose()) * 0.5;
        Ok(covariance)
    }

    /// Decay length and proper time, for nodes with a decay-length parameter and a mother
    pub fn flight(&self, node: NodeId) -> Option<FlightInfo> {
        let particle = self.chain.node(node)?;
        particle.mother()?;
        let tau = particle.tau_index()?;
        let mom = particle.mom_index();

        let decay_length = self.state.parameters()[tau];
        let block = self.state.sub_covariance(&[tau, mom, mom + 1, mom + 2]);
        let covariance = Matrix4::from_fn(|r, c| block[(r, c)]);
        let (proper_time, proper_time_error) = proper_time(
            decay_length,
            &self.state.vector3(mom),
            particle.mass(),
            &covariance,
        )?;

        Some(FlightInfo {
            decay_length,
            decay_length_error: covariance[(0, 0)].max(0.0).sqrt(),
            proper_time,
            proper_time_error,
        })
    }

    /// Overall fit quality of the chain
    pub fn quality(&self) -> FitQuality {
        let chi_square = self.state.chi_square();
        let degrees_of_freedom = self.state.degrees_of_freedom();
        FitQuality {
            chi_square,
            degrees_of_freedom,
            p_value: p_value(chi_square, degrees_of_freedom),
        }
    }

    /// Full result for one node; fit quality is attached to the head only
    pub fn project(&self, node: NodeId) -> FitterResult<FitResult> {
        Ok(FitResult {
            position: self.position(node)?,
            momentum: self.four_momentum(node)?,
            covariance: self.momentum_vertex_covariance(node)?,
            flight: self.flight(node),
            quality: (node == self.chain.root()).then(|| self.quality()),
        })
    }
}
