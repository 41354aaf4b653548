//! Caller-side decay hypothesis.
//!
//! A [`CandidateTree`] is the hierarchy handed to the fitter: an arena of [`Candidate`]s linked by
//! mother/daughter ids. It is produced by whatever combinatorics built the hypothesis and receives
//! the fitted values back through [`FitEngine::update_candidate`](crate::FitEngine::update_candidate).

use crate::error::{FitterError, FitterResult};
use crate::optimizer::FailureReason;
use nalgebra::{Matrix6, SMatrix, Vector3, Vector4};
use std::fmt;

/// 7×7 covariance ordered as (px, py, pz, E, x, y, z)
pub type Matrix7 = SMatrix<f64, 7, 7>;

/// Index of a candidate inside its [`CandidateTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandidateId(pub usize);

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a candidate was reconstructed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Charged final state with a measured vertex point and momentum
    Charged,
    /// Neutral final state with a measured momentum only
    Neutral,
    /// Long-lived composite with its own decay vertex
    Composite,
    /// Short-lived composite decaying at its production point
    Resonance,
}

/// Measured state of a final-state candidate
#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredState {
    pub position: Vector3<f64>,
    pub momentum: Vector3<f64>,
    /// Covariance ordered as (x, y, z, px, py, pz)
    pub covariance: Matrix6<f64>,
}

/// Flight distance and proper time of a node that decays away from its production vertex
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlightInfo {
    pub decay_length: f64,
    pub decay_length_error: f64,
    /// Proper time in ns
    pub proper_time: f64,
    pub proper_time_error: f64,
}

/// Overall fit quality, only attached to the head of the tree
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitQuality {
    pub chi_square: f64,
    pub degrees_of_freedom: i64,
    pub p_value: f64,
}

/// Fitted values written back into a candidate
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    pub position: Vector3<f64>,
    /// Four-momentum (px, py, pz, E)
    pub momentum: Vector4<f64>,
    /// Covariance ordered as (px, py, pz, E, x, y, z)
    pub covariance: Matrix7,
    pub flight: Option<FlightInfo>,
    pub quality: Option<FitQuality>,
}

/// One particle of the decay hypothesis
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub kind: SourceKind,
    /// Mass hypothesis in GeV
    pub mass: f64,
    /// Measured point for final states, vertex seed for composites
    pub position: Vector3<f64>,
    /// Measured momentum for final states, momentum seed for invisible particles
    pub momentum: Vector3<f64>,
    /// Measurement covariance ordered as (x, y, z, px, py, pz)
    pub covariance: Option<Matrix6<f64>>,
    /// The candidate carries corrections applied outside the fit; its daughters are not fitted
    pub externally_corrected: bool,
    /// The candidate escapes detection; its momentum is inferred from the rest of the tree
    pub invisible: bool,
    pub fit_result: Option<FitResult>,
    pub fit_failure: Option<FailureReason>,
    mother: Option<CandidateId>,
    daughters: Vec<CandidateId>,
}

impl Candidate {
    fn with_kind(name: impl Into<String>, kind: SourceKind, mass: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            mass,
            position: Vector3::zeros(),
            momentum: Vector3::zeros(),
            covariance: None,
            externally_corrected: false,
            invisible: false,
            fit_result: None,
            fit_failure: None,
            mother: None,
            daughters: Vec::new(),
        }
    }

    /// Charged final state measured at `position` with momentum `momentum`
    pub fn charged(
        name: impl Into<String>,
        mass: f64,
        position: Vector3<f64>,
        momentum: Vector3<f64>,
        covariance: Matrix6<f64>,
    ) -> Self {
        let mut candidate = Self::with_kind(name, SourceKind::Charged, mass);
        candidate.position = position;
        candidate.momentum = momentum;
        candidate.covariance = Some(covariance);
        candidate
    }

    /// Neutral final state; only the momentum block of `covariance` is used by the fit
    pub fn neutral(
        name: impl Into<String>,
        mass: f64,
        momentum: Vector3<f64>,
        covariance: Matrix6<f64>,
    ) -> Self {
        let mut candidate = Self::with_kind(name, SourceKind::Neutral, mass);
        candidate.momentum = momentum;
        candidate.covariance = Some(covariance);
        candidate
    }

    /// Long-lived composite; `vertex` seeds its decay vertex
    pub fn composite(name: impl Into<String>, mass: f64, vertex: Vector3<f64>) -> Self {
        let mut candidate = Self::with_kind(name, SourceKind::Composite, mass);
        candidate.position = vertex;
        candidate
    }

    /// Short-lived composite sharing its mother's vertex
    pub fn resonance(name: impl Into<String>, mass: f64) -> Self {
        Self::with_kind(name, SourceKind::Resonance, mass)
    }

    /// Invisible particle whose momentum is inferred; `momentum` is only a seed
    pub fn invisible(name: impl Into<String>, mass: f64, momentum: Vector3<f64>) -> Self {
        let mut candidate = Self::with_kind(name, SourceKind::Neutral, mass);
        candidate.momentum = momentum;
        candidate.invisible = true;
        candidate
    }

    /// Mark the candidate as externally corrected
    pub fn with_external_correction(mut self) -> Self {
        self.externally_corrected = true;
        self
    }

    pub fn mother(&self) -> Option<CandidateId> {
        self.mother
    }

    pub fn daughters(&self) -> &[CandidateId] {
        &self.daughters
    }

    pub fn is_final_state(&self) -> bool {
        self.daughters.is_empty()
    }

    /// Measured state, if the candidate carries a measurement covariance
    pub fn measured_state(&self) -> Option<MeasuredState> {
        self.covariance.map(|covariance| MeasuredState {
            position: self.position,
            momentum: self.momentum,
            covariance,
        })
    }

    /// Energy on the mass shell of the seed momentum
    pub fn energy(&self) -> f64 {
        (self.momentum.norm_squared() + self.mass * self.mass).sqrt()
    }
}

/// Arena holding a decay hypothesis
#[derive(Debug, Clone, Default)]
pub struct CandidateTree {
    candidates: Vec<Candidate>,
}

impl CandidateTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate and return its id
    pub fn add(&mut self, candidate: Candidate) -> CandidateId {
        self.candidates.push(candidate);
        CandidateId(self.candidates.len() - 1)
    }

    /// Attach `daughter` to `mother`
    ///
    /// A candidate can have at most one mother and may not become its own ancestor.
    pub fn add_daughter(&mut self, mother: CandidateId, daughter: CandidateId) -> FitterResult<()> {
        self.check(mother)?;
        self.check(daughter)?;
        if let Some(existing) = self.candidates[daughter.0].mother {
            return Err(FitterError::InvalidTree(format!(
                "candidate {daughter} already decays from {existing}"
            )));
        }
        let mut ancestor = Some(mother);
        while let Some(id) = ancestor {
            if id == daughter {
                return Err(FitterError::InvalidTree(format!(
                    "attaching {daughter} below {mother} would create a cycle"
                )));
            }
            ancestor = self.candidates[id.0].mother;
        }
        self.candidates[daughter.0].mother = Some(mother);
        self.candidates[mother.0].daughters.push(daughter);
        Ok(())
    }

    /// Add `mother` together with its daughters in one call
    pub fn add_decay(
        &mut self,
        mother: Candidate,
        daughters: &[CandidateId],
    ) -> FitterResult<CandidateId> {
        let id = self.add(mother);
        for &daughter in daughters {
            self.add_daughter(id, daughter)?;
        }
        Ok(id)
    }

    pub fn get(&self, id: CandidateId) -> Option<&Candidate> {
        self.candidates.get(id.0)
    }

    pub fn get_mut(&mut self, id: CandidateId) -> Option<&mut Candidate> {
        self.candidates.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CandidateId, &Candidate)> {
        self.candidates
            .iter()
            .enumerate()
            .map(|(i, candidate)| (CandidateId(i), candidate))
    }

    /// The unique candidate without a mother, if there is exactly one
    pub fn root(&self) -> Option<CandidateId> {
        let mut roots = self.iter().filter(|(_, c)| c.mother.is_none());
        match (roots.next(), roots.next()) {
            (Some((id, _)), None) => Some(id),
            _ => None,
        }
    }

    fn check(&self, id: CandidateId) -> FitterResult<()> {
        if id.0 < self.candidates.len() {
            Ok(())
        } else {
            Err(FitterError::MissingCandidate(id))
        }
    }
}
