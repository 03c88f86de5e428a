use super::config::ForceFieldKind;
use super::error::DispatchError;
use super::external::ExternalProcess;
use super::interface::worker_pool::WorkerPool;
use super::interface::{Interface, InterfaceError};
use super::queue::RequestQueue;
use crate::core::models::request::RequestStatus;
use crate::core::potentials::harmonic::HarmonicReference;
use crate::core::potentials::lennard_jones::LennardJones;
use crate::core::potentials::null::NullPotential;
use crate::core::potentials::{EvaluationError, Evaluator};
use std::sync::Arc;
use tracing::{debug, error};

/// What a single poll achieved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Records moved to `Done` during this poll.
    pub processed: usize,
    /// Set when the backend hit an unrecoverable failure; names the cause of the shutdown.
    pub escalation: Option<String>,
}

/// The evaluation plugin behind a dispatcher.
pub enum Backend {
    InProcess(Box<dyn Evaluator>),
    ExternalProcess(ExternalProcess),
    RemoteSocket(Box<dyn Interface>),
}

impl Backend {
    pub fn from_kind(name: &str, kind: &ForceFieldKind) -> Result<Self, DispatchError> {
        match kind {
            ForceFieldKind::ExternalProcess(config) => {
                Ok(Backend::ExternalProcess(ExternalProcess::new(config.clone())?))
            }
            ForceFieldKind::Socket { interface, driver } => {
                let driver: Arc<dyn Evaluator> = Arc::from(build_evaluator(driver)?);
                Ok(Backend::RemoteSocket(Box::new(WorkerPool::new(
                    name,
                    interface.clone(),
                    driver,
                ))))
            }
            other => Ok(Backend::InProcess(build_evaluator(other)?)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Backend::InProcess(evaluator) => evaluator.name(),
            Backend::ExternalProcess(process) => process.name(),
            Backend::RemoteSocket(interface) => interface.name(),
        }
    }

    pub fn validate(&self, n_coords: usize) -> Result<(), EvaluationError> {
        match self {
            Backend::InProcess(evaluator) => evaluator.validate(n_coords),
            Backend::ExternalProcess(process) => process.validate(n_coords),
            Backend::RemoteSocket(interface) => interface.validate(n_coords),
        }
    }

    /// Shares the live queue with a remote interface. Synchronous backends need no setup.
    pub fn open(&self, queue: Arc<RequestQueue>) -> Result<(), InterfaceError> {
        match self {
            Backend::RemoteSocket(interface) => interface.open(queue),
            _ => Ok(()),
        }
    }

    pub fn close(&self) {
        if let Backend::RemoteSocket(interface) = self {
            interface.close();
        }
    }

    pub fn update(&self) {
        match self {
            Backend::InProcess(evaluator) => evaluator.update(),
            Backend::ExternalProcess(process) => process.update(),
            Backend::RemoteSocket(_) => {}
        }
    }

    /// Advances every tracked record this backend can make progress on.
    pub fn poll(&self, queue: &RequestQueue) -> PollOutcome {
        match self {
            Backend::InProcess(evaluator) => sweep(evaluator.as_ref(), queue, false),
            Backend::ExternalProcess(process) => sweep(process, queue, true),
            Backend::RemoteSocket(interface) => interface.poll(queue),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Backend::InProcess(_) => "InProcess",
            Backend::ExternalProcess(_) => "ExternalProcess",
            Backend::RemoteSocket(_) => "RemoteSocket",
        };
        write!(f, "{variant}({})", self.name())
    }
}

/// Builds the synchronous evaluator for `kind`.
pub fn build_evaluator(kind: &ForceFieldKind) -> Result<Box<dyn Evaluator>, DispatchError> {
    let evaluator: Box<dyn Evaluator> = match kind {
        ForceFieldKind::Null => Box::new(NullPotential),
        ForceFieldKind::LennardJones { epsilon, sigma } => {
            Box::new(LennardJones::new(*epsilon, *sigma)?)
        }
        ForceFieldKind::Harmonic {
            hessian,
            x_ref,
            v_ref,
        } => Box::new(HarmonicReference::from_row_major(hessian, x_ref, *v_ref)?),
        ForceFieldKind::ExternalProcess(config) => Box::new(ExternalProcess::new(config.clone())?),
        ForceFieldKind::Socket { .. } => {
            return Err(super::config::ConfigError::Unsupported(
                "a remote interface cannot be evaluated in process".to_string(),
            )
            .into());
        }
    };
    Ok(evaluator)
}

/// Evaluates every queued record in order while holding the queue lock.
///
/// A failed evaluation forces its record to `Exit`. When `escalate` is set, an evaluator
/// that ran out of retries ends the sweep and reports the failure for shutdown.
fn sweep(evaluator: &dyn Evaluator, queue: &RequestQueue, escalate: bool) -> PollOutcome {
    let guard = queue.lock();
    let mut outcome = PollOutcome::default();

    for request in RequestQueue::with_status(&guard, RequestStatus::Queued) {
        if !request.mark_running() {
            continue;
        }
        match evaluator.evaluate(&request) {
            Ok(result) => {
                if request.complete(result) {
                    outcome.processed += 1;
                } else {
                    debug!(id = request.id(), "Discarded result of a request that already exited.");
                }
            }
            Err(err) => {
                error!(backend = evaluator.name(), id = request.id(), error = %err, "Evaluation failed; request forced to exit.");
                request.abandon();
                if escalate && matches!(err, EvaluationError::RetriesExhausted { .. }) {
                    outcome.escalation = Some(format!(
                        "backend '{}' failed to evaluate request {}: {err}",
                        evaluator.name(),
                        request.id()
                    ));
                    break;
                }
            }
        }
    }
    outcome
}
