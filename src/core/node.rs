//! Arena records of the decay chain.
//!
//! Each [`ParticleNode`] mirrors one candidate of the caller's tree and remembers where its
//! parameters live in the [`GlobalState`](crate::core::state::GlobalState) vector. Nodes refer to
//! each other only through [`NodeId`]s, so the chain cannot hold cycles.

use crate::core::candidate::{Candidate, CandidateId, MeasuredState, SourceKind};
use nalgebra::Vector3;
use std::fmt;

/// Index of a node inside its [`DecayChain`](crate::core::chain::DecayChain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role of a node in the fit, which decides its parameters and constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Final state with a measured point and momentum
    Measured,
    /// Final state with a measured momentum only
    MeasuredMomentum,
    /// Composite with its own decay vertex
    Composite,
    /// Composite decaying at its production vertex
    Resonance,
    /// Invisible final state, constrained only through momentum conservation
    Missing,
}

impl NodeKind {
    /// Classify a candidate; `leaf` is true when its daughters are not part of the fit
    pub fn classify(candidate: &Candidate, leaf: bool) -> Self {
        if candidate.invisible {
            return NodeKind::Missing;
        }
        match candidate.kind {
            SourceKind::Charged => NodeKind::Measured,
            SourceKind::Neutral => NodeKind::MeasuredMomentum,
            // a composite fitted as a unit carries its own measured vertex and momentum
            SourceKind::Composite | SourceKind::Resonance if leaf => NodeKind::Measured,
            SourceKind::Composite => NodeKind::Composite,
            SourceKind::Resonance => NodeKind::Resonance,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, NodeKind::Composite | NodeKind::Resonance)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Measured => write!(f, "measured"),
            NodeKind::MeasuredMomentum => write!(f, "measured momentum"),
            NodeKind::Composite => write!(f, "composite"),
            NodeKind::Resonance => write!(f, "resonance"),
            NodeKind::Missing => write!(f, "missing"),
        }
    }
}

/// One particle of the decay chain
#[derive(Debug, Clone)]
pub struct ParticleNode {
    pub(crate) id: NodeId,
    pub(crate) candidate: CandidateId,
    pub(crate) kind: NodeKind,
    pub(crate) name: String,
    pub(crate) mass: f64,
    pub(crate) mother: Option<NodeId>,
    pub(crate) daughters: Vec<NodeId>,
    pub(crate) depth: usize,
    pub(crate) vertex_index: Option<usize>,
    pub(crate) mom_index: usize,
    pub(crate) has_energy: bool,
    pub(crate) tau_index: Option<usize>,
    pub(crate) seed_position: Vector3<f64>,
    pub(crate) seed_momentum: Vector3<f64>,
    pub(crate) measurement: Option<MeasuredState>,
}

impl ParticleNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Candidate of the caller's tree this node stands for
    pub fn candidate(&self) -> CandidateId {
        self.candidate
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mass hypothesis in GeV
    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn mother(&self) -> Option<NodeId> {
        self.mother
    }

    pub fn daughters(&self) -> &[NodeId] {
        &self.daughters
    }

    /// Distance from the head of the chain
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// First index of the node's own vertex, `None` if the vertex is inherited
    pub fn vertex_index(&self) -> Option<usize> {
        self.vertex_index
    }

    pub fn owns_vertex(&self) -> bool {
        self.vertex_index.is_some()
    }

    pub fn mom_index(&self) -> usize {
        self.mom_index
    }

    pub fn has_energy(&self) -> bool {
        self.has_energy
    }

    /// Energy parameter, stored right after the momentum
    pub fn energy_index(&self) -> Option<usize> {
        self.has_energy.then_some(self.mom_index + 3)
    }

    /// Decay-length parameter, present for composites with their own vertex and a mother
    pub fn tau_index(&self) -> Option<usize> {
        self.tau_index
    }

    /// Number of state parameters owned by this node
    pub fn dimension(&self) -> usize {
        let vertex = if self.owns_vertex() { 3 } else { 0 };
        let energy = usize::from(self.has_energy);
        let tau = usize::from(self.tau_index.is_some());
        vertex + 3 + energy + tau
    }

    pub fn measurement(&self) -> Option<&MeasuredState> {
        self.measurement.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix6;

    #[test]
    fn test_classification() {
        let track = Candidate::charged(
            "pi-",
            0.13957,
            Vector3::zeros(),
            Vector3::new(0.0, 0.0, 1.0),
            Matrix6::identity(),
        );
        let photon = Candidate::neutral("gamma", 0.0, Vector3::z(), Matrix6::identity());
        let neutrino = Candidate::invisible("nu", 0.0, Vector3::z());
        let ks = Candidate::composite("K0S", 0.497611, Vector3::zeros());
        let rho = Candidate::resonance("rho0", 0.775);

        assert_eq!(NodeKind::classify(&track, true), NodeKind::Measured);
        assert_eq!(NodeKind::classify(&photon, true), NodeKind::MeasuredMomentum);
        assert_eq!(NodeKind::classify(&neutrino, true), NodeKind::Missing);
        assert_eq!(NodeKind::classify(&ks, false), NodeKind::Composite);
        assert_eq!(NodeKind::classify(&ks, true), NodeKind::Measured);
        assert_eq!(NodeKind::classify(&rho, false), NodeKind::Resonance);
        assert!(NodeKind::Resonance.is_composite());
        assert!(!NodeKind::Missing.is_composite());
    }

    #[test]
    fn test_parameter_layout() {
        let node = ParticleNode {
            id: NodeId(1),
            candidate: CandidateId(4),
            kind: NodeKind::Composite,
            name: "K0S".to_string(),
            mass: 0.497611,
            mother: Some(NodeId(0)),
            daughters: vec![NodeId(2), NodeId(3)],
            depth: 1,
            vertex_index: Some(7),
            mom_index: 10,
            has_energy: true,
            tau_index: Some(14),
            seed_position: Vector3::zeros(),
            seed_momentum: Vector3::zeros(),
            measurement: None,
        };

        assert_eq!(node.energy_index(), Some(13));
        assert_eq!(node.dimension(), 8);
        assert!(node.owns_vertex());
        assert_eq!(node.id().to_string(), "#1");
    }
}
