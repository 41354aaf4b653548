//! Decay chain: the fit-side image of a candidate tree.
//!
//! [`DecayChain::build`] walks the caller's tree from the head in pre-order, creates one
//! [`ParticleNode`] per fitted candidate, lays out their parameters in the global state vector and
//! attaches the constraints implied by each node's kind:
//!
//! | Node kind           | Parameters                          | Constraints                     |
//! |---------------------|-------------------------------------|---------------------------------|
//! | `Measured`          | p (3)                               | measurement of vertex and p     |
//! | `MeasuredMomentum`  | p (3)                               | measurement of p                |
//! | `Missing`           | p (3)                               | none                            |
//! | `Composite`         | vertex (3), p (3), E (1), L (1)     | conservation, flight geometry   |
//! | `Resonance`         | p (3), E (1)                        | conservation                    |
//!
//! The head always owns a vertex and never has a decay length. Nodes without their own vertex use
//! the vertex of the nearest ancestor that has one.

use crate::constraints::{
    Constraint, ConstraintError, GeometricConstraint, KinematicConstraint, MassConstraint,
    MeasurementConstraint, MomentumSlot,
};
use crate::core::candidate::{CandidateId, CandidateTree, SourceKind};
use crate::core::node::{NodeId, NodeKind, ParticleNode};
use crate::core::state::GlobalState;
use crate::error::{FitterError, FitterResult};
use crate::optimizer::FitConfig;
use nalgebra::{Vector3, Vector4};
use std::cmp::Reverse;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Arena of particle nodes plus the ordered constraint list
#[derive(Debug)]
pub struct DecayChain {
    nodes: Vec<ParticleNode>,
    lookup: HashMap<CandidateId, NodeId>,
    constraints: Vec<Box<dyn Constraint>>,
    mass_constrained: Vec<NodeId>,
    dimension: usize,
    config: FitConfig,
}

impl DecayChain {
    /// Build the chain for the subtree headed by `root`
    pub fn build(tree: &CandidateTree, root: CandidateId, config: &FitConfig) -> FitterResult<Self> {
        if tree.is_empty() {
            return Err(FitterError::InvalidTree("empty candidate tree".to_string()));
        }

        let mut chain = Self {
            nodes: Vec::new(),
            lookup: HashMap::new(),
            constraints: Vec::new(),
            mass_constrained: Vec::new(),
            dimension: 0,
            config: config.clone(),
        };
        chain.add_node(tree, root, None, 0)?;
        chain.create_constraints();

        let requested: Vec<CandidateId> = chain
            .nodes
            .iter()
            .filter(|node| config.mass_constraint_names.iter().any(|n| n == &node.name))
            .map(|node| node.candidate)
            .collect();
        for candidate in requested {
            if let Err(err) = chain.mass_constraint(candidate) {
                warn!("Skipping configured mass constraint: {}", err);
            }
        }

        debug!(
            "Built decay chain: {} nodes, {} parameters, {} constraints ({} equations)",
            chain.nodes.len(),
            chain.dimension,
            chain.constraints.len(),
            chain.n_constraint_equations()
        );
        Ok(chain)
    }

    fn allocate(&mut self, size: usize) -> usize {
        let start = self.dimension;
        self.dimension += size;
        start
    }

    fn add_node(
        &mut self,
        tree: &CandidateTree,
        id: CandidateId,
        mother: Option<NodeId>,
        depth: usize,
    ) -> FitterResult<NodeId> {
        let candidate = tree.get(id).ok_or(FitterError::MissingCandidate(id))?;
        if self.lookup.contains_key(&id) {
            return Err(FitterError::InvalidTree(format!(
                "candidate {id} is reached twice"
            )));
        }

        // invisible and externally corrected candidates are fitted as a unit
        let leaf = candidate.is_final_state()
            || candidate.invisible
            || candidate.externally_corrected
            || matches!(candidate.kind, SourceKind::Charged | SourceKind::Neutral);
        let kind = NodeKind::classify(candidate, leaf);

        let node_id = NodeId(self.nodes.len());
        let owns_vertex = mother.is_none() || kind == NodeKind::Composite;
        let has_energy = kind.is_composite();

        let vertex_index = owns_vertex.then(|| self.allocate(3));
        let mom_index = self.allocate(3);
        if has_energy {
            self.allocate(1);
        }
        let tau_index = (owns_vertex && mother.is_some()).then(|| self.allocate(1));

        let measurement = match kind {
            NodeKind::Measured | NodeKind::MeasuredMomentum => candidate.measured_state(),
            _ => None,
        };

        self.lookup.insert(id, node_id);
        self.nodes.push(ParticleNode {
            id: node_id,
            candidate: id,
            kind,
            name: candidate.name.clone(),
            mass: candidate.mass,
            mother,
            daughters: Vec::new(),
            depth,
            vertex_index,
            mom_index,
            has_energy,
            tau_index,
            seed_position: candidate.position,
            seed_momentum: candidate.momentum,
            measurement,
        });

        if !leaf {
            for &daughter in candidate.daughters() {
                let child = self.add_node(tree, daughter, Some(node_id), depth + 1)?;
                self.nodes[node_id.0].daughters.push(child);
            }
        }
        Ok(node_id)
    }

    fn slot(&self, id: NodeId) -> MomentumSlot {
        let node = &self.nodes[id.0];
        MomentumSlot {
            mom_index: node.mom_index,
            energy_index: node.energy_index(),
            mass: node.mass,
        }
    }

    fn create_constraints(&mut self) {
        let mut constraints: Vec<Box<dyn Constraint>> = Vec::new();
        for node in &self.nodes {
            match node.kind {
                NodeKind::Measured | NodeKind::MeasuredMomentum => {
                    let vertex = match node.kind {
                        NodeKind::Measured => self.pos_index(node.id),
                        _ => None,
                    };
                    constraints.push(Box::new(MeasurementConstraint::new(
                        node.name.clone(),
                        node.depth,
                        vertex,
                        node.mom_index,
                        node.measurement.clone(),
                    )));
                }
                NodeKind::Composite | NodeKind::Resonance => {
                    let daughters = node.daughters.iter().map(|&d| self.slot(d)).collect();
                    constraints.push(Box::new(KinematicConstraint::new(
                        node.name.clone(),
                        node.depth,
                        self.slot(node.id),
                        daughters,
                    )));

                    let production = node.mother.and_then(|m| self.pos_index(m));
                    if let (Some(vertex), Some(production), Some(tau)) =
                        (node.vertex_index, production, node.tau_index)
                    {
                        constraints.push(Box::new(GeometricConstraint::new(
                            node.name.clone(),
                            node.depth,
                            vertex,
                            production,
                            node.mom_index,
                            tau,
                        )));
                    }
                }
                NodeKind::Missing => {}
            }
        }
        self.constraints.extend(constraints);
        self.sort_constraints();
    }

    /// By kind, then deepest node first; the sort is stable so pre-order breaks ties
    fn sort_constraints(&mut self) {
        self.constraints
            .sort_by(|a, b| a.kind().cmp(&b.kind()).then_with(|| b.depth().cmp(&a.depth())));
    }

    /// Insert a caller-supplied constraint into the ordered list
    pub fn add_constraint(&mut self, constraint: Box<dyn Constraint>) {
        self.constraints.push(constraint);
        self.sort_constraints();
    }

    /// Constrain the invariant mass of `candidate` to its mass hypothesis
    ///
    /// The node must carry an energy parameter. Requesting the same constraint twice is a no-op.
    pub fn mass_constraint(&mut self, candidate: CandidateId) -> FitterResult<()> {
        let id = self
            .locate(candidate)
            .ok_or(FitterError::UnknownCandidate(candidate))?;
        if self.mass_constrained.contains(&id) {
            return Ok(());
        }
        let node = &self.nodes[id.0];
        let energy_index = node.energy_index().ok_or_else(|| {
            FitterError::InvalidConstraint(format!(
                "{} (candidate {candidate}) has no energy parameter",
                node.name
            ))
        })?;
        let constraint = MassConstraint::new(
            format!("{} mass", node.name),
            node.depth,
            node.mom_index,
            energy_index,
            node.mass,
        );
        self.mass_constrained.push(id);
        self.add_constraint(Box::new(constraint));
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn nodes(&self) -> &[ParticleNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&ParticleNode> {
        self.nodes.get(id.0)
    }

    /// The head of the chain
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn locate(&self, candidate: CandidateId) -> Option<NodeId> {
        self.lookup.get(&candidate).copied()
    }

    pub fn constraints(&self) -> &[Box<dyn Constraint>] {
        &self.constraints
    }

    /// Nodes that carry a mass constraint
    pub fn mass_constrained(&self) -> &[NodeId] {
        &self.mass_constrained
    }

    /// Total number of equations contributed by one filter pass
    pub fn n_constraint_equations(&self) -> usize {
        self.constraints.iter().map(|c| c.dimension()).sum()
    }

    /// Nearest node, starting at `id` and walking up, that owns a vertex
    pub fn vertex_owner(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node) = current.and_then(|c| self.node(c)) {
            if node.owns_vertex() {
                return Some(node.id);
            }
            current = node.mother;
        }
        None
    }

    /// Position parameters of `id`, resolving inherited vertices
    pub fn pos_index(&self, id: NodeId) -> Option<usize> {
        self.vertex_owner(id)
            .and_then(|owner| self.nodes[owner.0].vertex_index)
    }

    pub fn mom_index(&self, id: NodeId) -> Option<usize> {
        self.node(id).map(|node| node.mom_index)
    }

    pub fn energy_index(&self, id: NodeId) -> Option<usize> {
        self.node(id).and_then(|node| node.energy_index())
    }

    pub fn tau_index(&self, id: NodeId) -> Option<usize> {
        self.node(id).and_then(|node| node.tau_index)
    }

    fn seed_momentum(&self, id: NodeId) -> Vector3<f64> {
        let node = &self.nodes[id.0];
        if node.kind.is_composite() {
            node.daughters
                .iter()
                .fold(Vector3::zeros(), |sum, &d| sum + self.seed_momentum(d))
        } else {
            node.seed_momentum
        }
    }

    fn seed_energy(&self, id: NodeId) -> f64 {
        let node = &self.nodes[id.0];
        if node.kind.is_composite() {
            node.daughters.iter().map(|&d| self.seed_energy(d)).sum()
        } else {
            (node.seed_momentum.norm_squared() + node.mass * node.mass).sqrt()
        }
    }

    /// Seed every node, mothers before daughters, then validate each constraint's inputs
    pub fn initialize(&self, state: &mut GlobalState) -> Result<(), ConstraintError> {
        if state.dimension() != self.dimension {
            return Err(ConstraintError::MissingInput(format!(
                "state has {} parameters, chain needs {}",
                state.dimension(),
                self.dimension
            )));
        }
        let config = &self.config;

        for node in &self.nodes {
            if let Some(vertex) = node.vertex_index {
                for k in 0..3 {
                    state.seed(vertex + k, node.seed_position[k], config.seed_position_variance);
                }
            }

            let momentum = self.seed_momentum(node.id);
            for k in 0..3 {
                state.seed(node.mom_index + k, momentum[k], config.seed_momentum_variance);
            }
            if let Some(energy) = node.energy_index() {
                state.seed(energy, self.seed_energy(node.id), config.seed_momentum_variance);
            }

            if let Some(tau) = node.tau_index {
                let production = node
                    .mother
                    .and_then(|m| self.vertex_owner(m))
                    .map(|owner| self.nodes[owner.0].seed_position)
                    .ok_or_else(|| {
                        ConstraintError::InvalidSeed(format!("{} has no production vertex", node.name))
                    })?;
                let mom = momentum.norm();
                if !(mom > 0.0) {
                    return Err(ConstraintError::InvalidSeed(format!(
                        "{} has no momentum to define a flight direction",
                        node.name
                    )));
                }
                let length = (node.seed_position - production).dot(&momentum) / mom;
                state.seed(tau, length, config.seed_decay_length_variance);
            }
        }

        if state.parameters().iter().any(|v| !v.is_finite()) {
            return Err(ConstraintError::NonFinite("seed state".to_string()));
        }
        for constraint in &self.constraints {
            constraint.initialize(state)?;
        }
        Ok(())
    }

    /// Fresh state of the chain's dimension, seeded by [`initialize`](Self::initialize)
    pub fn seeded_state(&self) -> FitterResult<GlobalState> {
        let mut state = GlobalState::new(self.dimension);
        self.initialize(&mut state)?;
        Ok(state)
    }

    /// One filter pass over all constraints, in order
    pub fn apply_constraints(
        &self,
        state: &mut GlobalState,
        reference: Option<&GlobalState>,
    ) -> Result<(), ConstraintError> {
        for constraint in &self.constraints {
            constraint.filter(state, reference)?;
            if self.config.verbose {
                debug!(
                    "{} constraint {}: chi2 = {:.4}",
                    constraint.kind(),
                    constraint.name(),
                    state.chi_square()
                );
            } else {
                trace!(
                    "{} constraint {}: chi2 = {:.4}",
                    constraint.kind(),
                    constraint.name(),
                    state.chi_square()
                );
            }
        }
        Ok(())
    }

    /// Energy of a node, from its parameter or from its mass shell
    pub fn energy(&self, state: &GlobalState, id: NodeId) -> f64 {
        let node = &self.nodes[id.0];
        match node.energy_index() {
            Some(index) => state.parameters()[index],
            None => {
                (state.vector3(node.mom_index).norm_squared() + node.mass * node.mass).sqrt()
            }
        }
    }

    pub fn four_momentum(&self, state: &GlobalState, id: NodeId) -> Vector4<f64> {
        let p = state.vector3(self.nodes[id.0].mom_index);
        Vector4::new(p.x, p.y, p.z, self.energy(state, id))
    }

    /// Replace the four-momentum of every mass-constrained node by the sum of its daughters'
    pub fn enforce_momentum_conservation(&self, state: &mut GlobalState) {
        let mut ordered = self.mass_constrained.clone();
        ordered.sort_by_key(|id| Reverse(self.nodes[id.0].depth));

        for id in ordered {
            let node = &self.nodes[id.0];
            if node.daughters.is_empty() {
                continue;
            }
            let sum = node
                .daughters
                .iter()
                .fold(Vector4::zeros(), |sum, &d| sum + self.four_momentum(state, d));
            state.set_vector3(node.mom_index, &sum.xyz());
            if let Some(energy) = node.energy_index() {
                state.parameters_mut()[energy] = sum.w;
            }
        }
    }
}
