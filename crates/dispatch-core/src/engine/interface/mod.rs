//! Remote evaluation interfaces.
//!
//! An [`Interface`] shares the live request queue of its dispatcher and is driven by the
//! polling thread: every `poll` collects finished work, reassigns work held by lost
//! workers and hands queued records to idle workers. All transitions happen while the
//! caller holds the queue lock.

pub mod worker_pool;

use super::backend::PollOutcome;
use super::queue::RequestQueue;
use crate::core::potentials::EvaluationError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("Interface '{0}' is already open")]
    AlreadyOpen(String),

    #[error("Failed to start worker '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub trait Interface: Send + Sync {
    fn name(&self) -> &str;

    /// Checks the system size against whatever the workers evaluate with.
    fn validate(&self, n_coords: usize) -> Result<(), EvaluationError> {
        let _ = n_coords;
        Ok(())
    }

    fn open(&self, queue: Arc<RequestQueue>) -> Result<(), InterfaceError>;

    fn poll(&self, queue: &RequestQueue) -> PollOutcome;

    fn close(&self);
}
