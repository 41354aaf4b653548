//! End-to-end fits of synthetic decay trees
//!
//! The reference topology is B+ -> (K0S -> pi+ pi-) K+: a two-generation tree with one
//! long-lived intermediate, three measured tracks and 24 fit parameters.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use decay_tree_fitter::{
    Candidate, CandidateId, CandidateTree, Constraint, ConstraintError, ConstraintKind,
    FailureReason, FitConfig, FitEngine, FitOutcome, GlobalState, Projection, fit_batch,
};
use nalgebra::{DVector, Vector3, Vector4};
use std::sync::atomic::{AtomicUsize, Ordering};

use fit_test_utils::*;

/// Adds a χ² that grows by one unit every pass
#[derive(Debug, Default)]
struct GrowingChiSquare {
    passes: AtomicUsize,
}

impl Constraint for GrowingChiSquare {
    fn name(&self) -> &str {
        "growing"
    }

    fn kind(&self) -> ConstraintKind {
        ConstraintKind::External
    }

    fn dimension(&self) -> usize {
        1
    }

    fn project(&self, _parameters: &DVector<f64>) -> Result<Projection, ConstraintError> {
        Ok(Projection::new(1))
    }

    fn filter(
        &self,
        state: &mut GlobalState,
        _reference: Option<&GlobalState>,
    ) -> Result<(), ConstraintError> {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed) + 1;
        state.add_chi_square(pass as f64, 1);
        Ok(())
    }
}

/// Forces a negative variance after every pass
#[derive(Debug)]
struct SpoilCovariance(usize);

impl Constraint for SpoilCovariance {
    fn name(&self) -> &str {
        "spoil covariance"
    }

    fn kind(&self) -> ConstraintKind {
        ConstraintKind::External
    }

    fn dimension(&self) -> usize {
        0
    }

    fn project(&self, _parameters: &DVector<f64>) -> Result<Projection, ConstraintError> {
        Ok(Projection::new(0))
    }

    fn filter(
        &self,
        state: &mut GlobalState,
        _reference: Option<&GlobalState>,
    ) -> Result<(), ConstraintError> {
        state.covariance_mut()[(self.0, self.0)] = -1e-6;
        Ok(())
    }
}

fn four_momentum(tree: &CandidateTree, id: CandidateId) -> Vector4<f64> {
    tree.get(id)
        .and_then(|c| c.fit_result.as_ref())
        .map(|r| r.momentum)
        .expect("fitted candidate")
}

#[test]
fn test_zero_residual_tree_converges_in_one_linearized_pass() {
    let truth = TwoGenerationTruth::default();
    let (mut tree, _) = two_generation_tree(&truth, 0.0, 0);
    let mut engine = FitEngine::new(&mut tree, FitConfig::default()).unwrap();

    assert!(engine.fit());
    assert_eq!(engine.status(), FitOutcome::Success);
    // seed pass plus one linearized pass
    assert_eq!(engine.iterations(), 2);
    assert!(engine.chi_square().abs() < 1e-8);

    let chain = engine.chain();
    assert_eq!(chain.dimension(), 24);
    assert_eq!(chain.n_constraint_equations(), 29);
    assert_eq!(engine.degrees_of_freedom(), 5);
}

#[test]
fn test_degrees_of_freedom_invariant_across_iterations() {
    let truth = TwoGenerationTruth::default();
    let (mut tree, _) = two_generation_tree(&truth, 1.0, 17);
    let mut engine = FitEngine::new(&mut tree, FitConfig::default()).unwrap();
    let expected =
        engine.chain().n_constraint_equations() as i64 - engine.chain().dimension() as i64;

    assert!(engine.fit());
    assert!(engine.iterations() >= 2);
    assert_eq!(engine.degrees_of_freedom(), expected);

    assert!(engine.fit());
    assert_eq!(engine.degrees_of_freedom(), expected);
}

#[test]
fn test_refit_is_idempotent() {
    let truth = TwoGenerationTruth::default();
    let (mut tree, _) = two_generation_tree(&truth, 1.0, 101);
    let mut engine = FitEngine::new(&mut tree, FitConfig::default()).unwrap();

    assert!(engine.fit());
    let chi_square = engine.chi_square();
    let parameters = engine.state().parameters().clone();

    assert!(engine.fit());
    assert_eq!(engine.status(), FitOutcome::Success);
    assert_eq!(engine.iterations(), 1);
    assert!((engine.chi_square() - chi_square).abs() < 0.01);
    assert!((engine.state().parameters() - parameters).norm() < 1e-3);
}

#[test]
fn test_noisy_fit_writes_results_back() {
    let truth = TwoGenerationTruth::default();
    let (mut tree, ids) = two_generation_tree(&truth, 1.0, 7);
    let mut engine = FitEngine::new(&mut tree, FitConfig::default()).unwrap();

    assert!(engine.fit());
    assert!(engine.update_tree().unwrap());
    drop(engine);

    let b = tree.get(ids.b).unwrap();
    assert_eq!(b.fit_failure, Some(FailureReason::NoFailure));
    let head = b.fit_result.as_ref().unwrap();
    let quality = head.quality.unwrap();
    assert_eq!(quality.degrees_of_freedom, 5);
    assert!(quality.p_value > 0.0 && quality.p_value <= 1.0);
    assert!(head.flight.is_none());
    assert!((head.covariance - head.covariance.transpose()).norm() < 1e-9);

    let ks = tree.get(ids.ks).unwrap().fit_result.as_ref().unwrap();
    assert!(ks.quality.is_none());
    let flight = ks.flight.unwrap();
    assert!((flight.decay_length - truth.decay_length).abs() < 0.1);
    assert!(flight.decay_length_error > 0.0);
    assert!(flight.proper_time > 0.0 && flight.proper_time_error > 0.0);

    // momentum conservation at both vertices
    let sum_b = four_momentum(&tree, ids.ks) + four_momentum(&tree, ids.kaon);
    assert!((four_momentum(&tree, ids.b) - sum_b).norm() < 1e-4);
    let sum_ks = four_momentum(&tree, ids.pip) + four_momentum(&tree, ids.pim);
    assert!((four_momentum(&tree, ids.ks) - sum_ks).norm() < 1e-4);

    // tracks share the fitted vertex of their mother
    let pip = tree.get(ids.pip).unwrap().fit_result.as_ref().unwrap();
    assert!((pip.position - ks.position).norm() < 1e-12);
    assert!(pip.flight.is_none());
    let e = pip.momentum.w;
    let p2 = pip.momentum.xyz().norm_squared();
    assert!((e * e - p2 - PION_MASS * PION_MASS).abs() < 1e-10);
}

#[test]
fn test_mass_constraint_pins_invariant_mass() {
    let truth = TwoGenerationTruth::default();
    let (mut tree, ids) = two_generation_tree(&truth, 1.0, 29);
    let mut engine = FitEngine::new(&mut tree, FitConfig::default())
        .unwrap()
        .with_mass_constraint(ids.ks)
        .unwrap();

    assert!(engine.fit());
    assert_eq!(engine.degrees_of_freedom(), 6);
    assert!(engine.update_tree().unwrap());
    drop(engine);

    let ks = four_momentum(&tree, ids.ks);
    let mass = (ks.w * ks.w - ks.xyz().norm_squared()).sqrt();
    assert!((mass - truth.ks_mass).abs() < 1e-3);

    // conservation is enforced exactly after a successful mass-constrained fit
    let sum = four_momentum(&tree, ids.pip) + four_momentum(&tree, ids.pim);
    assert!((ks - sum).norm() < 1e-9);
}

#[test]
fn test_configured_mass_constraint_by_name() {
    let truth = TwoGenerationTruth::default();
    let (mut tree, _) = two_generation_tree(&truth, 1.0, 29);
    let config = FitConfig::default().with_mass_constraint("K0S");
    let mut engine = FitEngine::new(&mut tree, config).unwrap();

    assert!(engine.fit());
    assert_eq!(engine.chain().mass_constrained().len(), 1);
    assert_eq!(engine.degrees_of_freedom(), 6);
}

#[test]
fn test_growing_chi_square_never_succeeds() {
    let truth = TwoGenerationTruth::default();
    for rollback in [true, false] {
        let (mut tree, ids) = two_generation_tree(&truth, 0.0, 0);
        let config = FitConfig::default().with_fast_divergence_rollback(rollback);
        let mut engine = FitEngine::new(&mut tree, config)
            .unwrap()
            .with_constraint(Box::new(GrowingChiSquare::default()));

        assert!(!engine.fit());
        assert!(matches!(
            engine.status(),
            FitOutcome::NonConverged | FitOutcome::Failed
        ));
        assert!(!engine.update_tree().unwrap());
        drop(engine);
        assert!(tree.get(ids.b).unwrap().fit_result.is_none());
        assert_ne!(tree.get(ids.b).unwrap().fit_failure, Some(FailureReason::NoFailure));
    }
}

#[test]
fn test_negative_covariance_forces_failure() {
    let truth = TwoGenerationTruth::default();
    let (mut tree, ids) = two_generation_tree(&truth, 0.0, 0);
    let mut engine = FitEngine::new(&mut tree, FitConfig::default())
        .unwrap()
        .with_constraint(Box::new(SpoilCovariance(14)));

    assert!(!engine.fit());
    assert_eq!(engine.status(), FitOutcome::Failed);
    assert_eq!(engine.failure_reason(), FailureReason::CovarianceFailure);
    drop(engine);
    assert_eq!(
        tree.get(ids.b).unwrap().fit_failure,
        Some(FailureReason::CovarianceFailure)
    );
}

#[test]
fn test_non_finite_measurement_is_bad_input() {
    let truth = TwoGenerationTruth::default();
    let (mut tree, ids) = two_generation_tree(&truth, 0.0, 0);
    tree.get_mut(ids.kaon).unwrap().momentum.x = f64::NAN;
    let mut engine = FitEngine::new(&mut tree, FitConfig::default()).unwrap();

    assert!(!engine.fit());
    assert_eq!(engine.status(), FitOutcome::BadInput);
    assert_eq!(engine.iterations(), 0);
    drop(engine);
    let reason = tree.get(ids.b).unwrap().fit_failure.unwrap();
    assert_eq!(reason.code(), 5);
}

#[test]
fn test_update_stops_at_corrected_and_invisible_candidates() {
    let vertex = Vector3::new(0.0, 0.1, 0.2);
    let mut tree = CandidateTree::new();

    let g1 = tree.add(Candidate::neutral(
        "gamma",
        0.0,
        Vector3::new(0.1, 0.0, 1.0),
        track_covariance(),
    ));
    let g2 = tree.add(Candidate::neutral(
        "gamma",
        0.0,
        Vector3::new(-0.1, 0.0, 1.0),
        track_covariance(),
    ));
    let mut pi0 = Candidate::composite("pi0", 0.135, vertex).with_external_correction();
    pi0.momentum = Vector3::new(0.0, 0.0, 2.0);
    pi0.covariance = Some(track_covariance());
    let pi0 = tree.add_decay(pi0, &[g1, g2]).unwrap();

    let track = tree.add(Candidate::charged(
        "pi+",
        PION_MASS,
        vertex,
        Vector3::new(0.3, 0.2, 1.5),
        track_covariance(),
    ));
    let nu = tree.add(Candidate::invisible("nu", 0.0, Vector3::new(0.2, -0.4, 3.0)));
    let tau = tree
        .add_decay(Candidate::resonance("tau+", 1.77686), &[pi0, track, nu])
        .unwrap();
    tree.get_mut(tau).unwrap().position = vertex;

    let mut engine = FitEngine::new(&mut tree, FitConfig::default()).unwrap();
    assert!(engine.fit());
    assert_eq!(engine.degrees_of_freedom(), 0);
    assert!(engine.update_tree().unwrap());
    drop(engine);

    for id in [tau, pi0, track, nu] {
        assert!(tree.get(id).unwrap().fit_result.is_some(), "{id} not updated");
    }
    for id in [g1, g2] {
        assert!(tree.get(id).unwrap().fit_result.is_none(), "{id} updated");
    }
    let head = tree.get(tau).unwrap().fit_result.as_ref().unwrap();
    assert_eq!(head.quality.unwrap().p_value, 0.0);
}

#[test]
fn test_fit_without_reference_state() {
    let truth = TwoGenerationTruth::default();
    let (mut tree, _) = two_generation_tree(&truth, 0.0, 0);
    let config = FitConfig::default().with_reference_state(false);
    let mut engine = FitEngine::new(&mut tree, config).unwrap();

    assert!(engine.fit());
    assert!(engine.chi_square().abs() < 1e-8);
}

#[test]
fn test_batch_fit_of_independent_trees() {
    let truth = TwoGenerationTruth::default();
    let mut trees: Vec<CandidateTree> = (0..8)
        .map(|event| two_generation_tree(&truth, 1.0, 1000 + 97 * event).0)
        .collect();

    let summaries = fit_batch(&mut trees, &FitConfig::default());

    assert_eq!(summaries.len(), 8);
    for (tree, summary) in trees.iter().zip(&summaries) {
        let summary = summary.as_ref().unwrap();
        assert!(summary.is_success(), "{summary}");
        assert_eq!(summary.statistics.degrees_of_freedom, 5);
        let head = tree.root().and_then(|id| tree.get(id)).unwrap();
        assert!(head.fit_result.is_some());
        assert_eq!(head.fit_failure, Some(FailureReason::NoFailure));
    }
}
