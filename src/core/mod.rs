//! Core data structures of the decay-tree fitter
//!
//! This module contains the building blocks the fit operates on:
//! - Candidate trees handed in by the caller and receiving the results
//! - The global parameter state and its covariance
//! - Particle nodes and the decay chain built from a candidate tree

pub mod candidate;
pub mod chain;
pub mod node;
pub mod state;
