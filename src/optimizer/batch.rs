//! Independent trees fitted in parallel, one tree per task.
//!
//! Engines share nothing, so each rayon task builds its own chain and state and writes results
//! back into its own tree.

use crate::core::candidate::CandidateTree;
use crate::error::FitterResult;
use crate::optimizer::{FitConfig, FitEngine, FitSummary};
use rayon::prelude::*;

/// Fit one tree and write the results back on success
pub fn fit_tree(tree: &mut CandidateTree, config: &FitConfig) -> FitterResult<FitSummary> {
    let mut engine = FitEngine::new(tree, config.clone())?;
    engine.fit();
    engine.update_tree()?;
    Ok(engine.summary())
}

/// Fit every tree of `trees` in parallel
///
/// Results come back in input order. A tree that cannot be turned into a chain yields an error
/// without affecting the others.
pub fn fit_batch(trees: &mut [CandidateTree], config: &FitConfig) -> Vec<FitterResult<FitSummary>> {
    trees
        .par_iter_mut()
        .map(|tree| fit_tree(tree, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::candidate::Candidate;
    use crate::optimizer::{FailureReason, FitOutcome};
    use nalgebra::{Matrix6, Vector3};

    fn track_tree(measured: bool) -> CandidateTree {
        let mut tree = CandidateTree::new();
        let mut track = Candidate::charged(
            "e-",
            0.000511,
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.1, 0.2, 1.5),
            Matrix6::identity() * 1e-4,
        );
        if !measured {
            track.covariance = None;
        }
        tree.add(track);
        tree
    }

    #[test]
    fn test_batch_keeps_order_and_isolates_failures() {
        let mut trees = vec![track_tree(true), track_tree(false), CandidateTree::new()];
        let results = fit_batch(&mut trees, &FitConfig::default());

        assert_eq!(results.len(), 3);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.outcome, FitOutcome::Success);
        assert!(trees[0].get(crate::CandidateId(0)).unwrap().fit_result.is_some());

        let second = results[1].as_ref().unwrap();
        assert_eq!(second.outcome, FitOutcome::BadInput);
        assert_eq!(second.failure, FailureReason::BadInput);
        assert!(trees[1].get(crate::CandidateId(0)).unwrap().fit_result.is_none());

        assert!(results[2].is_err());
    }
}
