//! # Reference Potentials
//!
//! In-process analytic evaluators and the [`Evaluator`] contract every synchronous
//! backend satisfies.
//!
//! - [`null`] - The base backend: zero energy, forces and virial
//! - [`lennard_jones`] - Non-cutoff, non-periodic pairwise Lennard-Jones
//! - [`harmonic`] - Harmonic reference potential around a minimum-energy configuration
//!
//! An evaluator is deterministic given its inputs and performs no I/O of its own.
//! Evaluators that delegate to other processes live in [`crate::engine::external`].

pub mod harmonic;
pub mod lennard_jones;
pub mod null;

use crate::core::models::request::{ForceRequest, ForceResult};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Size mismatch for {what}: expected {expected}, found {found}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid evaluator parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Failed to launch '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' exited with {status}: {stderr}")]
    ProcessFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Malformed output in '{path}': {reason}")]
    MalformedOutput { path: String, reason: String },

    #[error("Evaluation still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: String },
}

/// A synchronous energy/force provider.
///
/// `evaluate` is the only place a result is produced for a record; the dispatch engine
/// is responsible for moving the record through its states around the call.
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    /// Checks that the evaluator can handle a system of `n_coords` flattened coordinates.
    ///
    /// Called once, when the dispatcher sees its first configuration.
    fn validate(&self, n_coords: usize) -> Result<(), EvaluationError> {
        let _ = n_coords;
        Ok(())
    }

    fn evaluate(&self, request: &ForceRequest) -> Result<ForceResult, EvaluationError>;

    /// Per-timestep hook, invoked once per completed simulation step.
    fn update(&self) {}
}
