use super::{Interface, InterfaceError};
use crate::core::models::request::{ForceRequest, ForceResult, RequestStatus};
use crate::core::potentials::{EvaluationError, Evaluator};
use crate::engine::backend::PollOutcome;
use crate::engine::config::{InterfaceConfig, Matching};
use crate::engine::queue::{QueueGuard, RequestQueue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

struct Job {
    request: Arc<ForceRequest>,
}

struct Reply {
    worker: usize,
    generation: u64,
    request: Arc<ForceRequest>,
    outcome: Result<ForceResult, EvaluationError>,
}

struct Assignment {
    request: Arc<ForceRequest>,
    since: Instant,
}

struct Worker {
    index: usize,
    generation: u64,
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    assignment: Option<Assignment>,
    last_id: Option<i64>,
}

impl Worker {
    fn is_connected(&self) -> bool {
        self.jobs.is_some()
    }

    fn is_idle(&self) -> bool {
        self.is_connected() && self.assignment.is_none()
    }

    fn disconnect(&mut self) -> Option<Assignment> {
        self.jobs = None;
        self.assignment.take()
    }
}

#[derive(Default)]
struct PoolState {
    workers: Vec<Worker>,
    replies: Option<Receiver<Reply>>,
    reply_tx: Option<Sender<Reply>>,
    queue: Option<Arc<RequestQueue>>,
    /// Threads of timed-out workers; they exit after their current job.
    retired: Vec<JoinHandle<()>>,
}

/// Remote-interface stand-in that serves requests from a fixed set of worker threads.
///
/// Each of the `slots` workers behaves like a connected client: it receives one request
/// at a time, evaluates it with the shared driver and sends the result back. Workers
/// that hold a request longer than the configured timeout are treated as disconnected
/// and replaced by a fresh worker in the same slot, the way a remote client reconnects.
pub struct WorkerPool {
    name: String,
    config: InterfaceConfig,
    driver: Arc<dyn Evaluator>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: InterfaceConfig, driver: Arc<dyn Evaluator>) -> Self {
        Self {
            name: name.into(),
            config,
            driver,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().replies.is_some()
    }

    pub fn connected_workers(&self) -> usize {
        self.state
            .lock()
            .workers
            .iter()
            .filter(|w| w.is_connected())
            .count()
    }

    fn spawn_worker(
        &self,
        index: usize,
        generation: u64,
        replies: Sender<Reply>,
    ) -> Result<Worker, InterfaceError> {
        let (job_tx, job_rx) = mpsc::channel();
        let driver = self.driver.clone();
        let thread_name = format!("{}_worker_{index}", self.name);
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker_loop(index, generation, driver, job_rx, replies))
            .map_err(|source| InterfaceError::Spawn {
                name: thread_name,
                source,
            })?;
        Ok(Worker {
            index,
            generation,
            jobs: Some(job_tx),
            handle: Some(handle),
            assignment: None,
            last_id: None,
        })
    }

    /// Puts a fresh worker into the slot of a disconnected one.
    fn reconnect(&self, state: &mut PoolState, index: usize) {
        let Some(replies) = state.reply_tx.clone() else {
            return;
        };
        let generation = state.workers[index].generation + 1;
        match self.spawn_worker(index, generation, replies) {
            Ok(fresh) => {
                let old = std::mem::replace(&mut state.workers[index], fresh);
                state.retired.extend(old.handle);
                debug!(interface = %self.name, worker = index, generation, "Worker reconnected.");
            }
            Err(err) => {
                error!(interface = %self.name, worker = index, error = %err, "Failed to reconnect worker.");
            }
        }
    }

    fn collect_replies(state: &mut PoolState, outcome: &mut PollOutcome) {
        let replies: Vec<Reply> = match &state.replies {
            Some(receiver) => receiver.try_iter().collect(),
            None => return,
        };

        for reply in replies {
            let worker = &mut state.workers[reply.worker];
            let held = worker.generation == reply.generation
                && worker
                    .assignment
                    .as_ref()
                    .is_some_and(|a| Arc::ptr_eq(&a.request, &reply.request));
            if !held {
                debug!(
                    worker = reply.worker,
                    id = reply.request.id(),
                    "Ignoring late reply from a disconnected worker."
                );
                continue;
            }
            worker.assignment = None;

            match reply.outcome {
                Ok(result) => {
                    if reply.request.complete(result) {
                        outcome.processed += 1;
                    }
                }
                Err(err) => {
                    error!(worker = reply.worker, id = reply.request.id(), error = %err, "Worker failed to evaluate request.");
                    reply.request.abandon();
                }
            }
        }
    }

    fn check_timeouts(&self, state: &mut PoolState, outcome: &mut PollOutcome) {
        let Some(timeout) = self.config.timeout() else {
            return;
        };

        for index in 0..state.workers.len() {
            let worker = &mut state.workers[index];
            let expired = worker
                .assignment
                .as_ref()
                .is_some_and(|a| a.since.elapsed() > timeout);
            if !expired {
                continue;
            }
            let Some(assignment) = worker.disconnect() else {
                continue;
            };
            let id = assignment.request.id();
            warn!(interface = %self.name, worker = index, id, "Worker timed out and was disconnected.");

            if self.config.exit_on_disconnect {
                assignment.request.abandon();
                outcome.escalation.get_or_insert_with(|| {
                    format!(
                        "worker {index} of interface '{}' disconnected while holding request {id}",
                        self.name
                    )
                });
            } else {
                assignment.request.requeue();
                self.reconnect(state, index);
            }
        }
    }

    fn dispatch(&self, guard: &QueueGuard<'_>, state: &mut PoolState) {
        for request in RequestQueue::with_status(guard, RequestStatus::Queued) {
            let Some(index) = self.pick_worker(&state.workers, request.id()) else {
                trace!(interface = %self.name, "No idle worker; leaving remaining requests queued.");
                break;
            };
            if !request.mark_running() {
                continue;
            }

            let worker = &mut state.workers[index];
            let job = Job {
                request: request.clone(),
            };
            let sent = worker.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok());
            if sent {
                trace!(worker = index, id = request.id(), "Request handed to worker.");
                worker.last_id = Some(request.id());
                worker.assignment = Some(Assignment {
                    request,
                    since: Instant::now(),
                });
            } else {
                warn!(interface = %self.name, worker = index, "Worker is gone; requeueing its request.");
                worker.disconnect();
                request.requeue();
            }
        }
    }

    fn pick_worker(&self, workers: &[Worker], id: i64) -> Option<usize> {
        let idle: Vec<&Worker> = workers.iter().filter(|w| w.is_idle()).collect();
        let chosen = match self.config.matching {
            Matching::Auto => idle
                .iter()
                .find(|w| w.last_id == Some(id))
                .or_else(|| idle.iter().find(|w| w.last_id.is_none()))
                .or_else(|| idle.first()),
            Matching::Any => idle.first(),
        };
        chosen.map(|w| w.index)
    }
}

impl Interface for WorkerPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, n_coords: usize) -> Result<(), EvaluationError> {
        self.driver.validate(n_coords)
    }

    fn open(&self, queue: Arc<RequestQueue>) -> Result<(), InterfaceError> {
        let mut state = self.state.lock();
        if state.replies.is_some() {
            return Err(InterfaceError::AlreadyOpen(self.name.clone()));
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        let workers = (0..self.config.slots)
            .map(|index| self.spawn_worker(index, 0, reply_tx.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        state.workers = workers;
        state.replies = Some(reply_rx);
        state.reply_tx = Some(reply_tx);
        state.queue = Some(queue);
        info!(
            interface = %self.name,
            address = %self.config.address,
            port = self.config.port,
            mode = ?self.config.mode,
            slots = self.config.slots,
            "Remote interface opened."
        );
        Ok(())
    }

    fn poll(&self, queue: &RequestQueue) -> PollOutcome {
        let guard = queue.lock();
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut outcome = PollOutcome::default();
        if state.replies.is_none() {
            return outcome;
        }

        Self::collect_replies(state, &mut outcome);
        self.check_timeouts(state, &mut outcome);
        if outcome.escalation.is_none() {
            self.dispatch(&guard, state);
        }
        outcome
    }

    fn close(&self) {
        let (mut workers, retired, queue) = {
            let mut state = self.state.lock();
            state.replies = None;
            state.reply_tx = None;
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.retired),
                state.queue.take(),
            )
        };
        if workers.is_empty() {
            return;
        }

        // Work still held by a worker can no longer be delivered.
        if let Some(queue) = queue {
            let guard = queue.lock();
            for request in RequestQueue::with_status(&guard, RequestStatus::Running) {
                request.abandon();
            }
        }

        for worker in &mut workers {
            worker.disconnect();
        }
        let handles = workers
            .iter_mut()
            .filter_map(|w| w.handle.take())
            .chain(retired);
        for handle in handles {
            if handle.join().is_err() {
                warn!(interface = %self.name, "Worker thread panicked.");
            }
        }
        info!(interface = %self.name, "Remote interface closed.");
    }
}

fn worker_loop(
    index: usize,
    generation: u64,
    driver: Arc<dyn Evaluator>,
    jobs: Receiver<Job>,
    replies: Sender<Reply>,
) {
    while let Ok(job) = jobs.recv() {
        let outcome = driver.evaluate(&job.request);
        let reply = Reply {
            worker: index,
            generation,
            request: job.request,
            outcome,
        };
        if replies.send(reply).is_err() {
            break;
        }
    }
    trace!(worker = index, "Worker exiting.");
}
