use super::cell::Cell;
use super::ids::RequestKey;
use nalgebra::Matrix3;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{AddAssign, Deref};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Lifecycle state of a request.
///
/// `Queued` is initial, `Running` is optional and backend-dependent, `Done` and `Exit`
/// are terminal. No transition ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestStatus {
    Queued = 0,
    Running = 1,
    Done = 2,
    Exit = 3,
}

impl RequestStatus {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Done | RequestStatus::Exit)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestStatus::Queued,
            1 => RequestStatus::Running,
            2 => RequestStatus::Done,
            _ => RequestStatus::Exit,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestStatus::Queued => "Queued",
            RequestStatus::Running => "Running",
            RequestStatus::Done => "Done",
            RequestStatus::Exit => "Exit",
        };
        f.write_str(label)
    }
}

/// Energy, forces, virial and backend-specific extras produced by an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceResult {
    pub energy: f64,
    pub forces: Vec<f64>,
    pub virial: Matrix3<f64>,
    pub extra: String,
}

impl ForceResult {
    /// A result with zero energy, `n_coords` zero forces and a zero virial.
    pub fn zeros(n_coords: usize) -> Self {
        Self {
            energy: 0.0,
            forces: vec![0.0; n_coords],
            virial: Matrix3::zeros(),
            extra: String::new(),
        }
    }
}

impl AddAssign<&ForceResult> for ForceResult {
    fn add_assign(&mut self, rhs: &ForceResult) {
        self.energy += rhs.energy;
        for (f, df) in self.forces.iter_mut().zip(&rhs.forces) {
            *f += df;
        }
        self.virial += rhs.virial;
        self.extra.push_str(&rhs.extra);
    }
}

/// Monotonic markers used for latency diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub queued_at: Instant,
    pub dispatched_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl Timestamps {
    fn new() -> Self {
        Self {
            queued_at: Instant::now(),
            dispatched_at: None,
            finished_at: None,
        }
    }

    /// Time between queueing and reaching a terminal state, if the request has finished.
    pub fn latency(&self) -> Option<Duration> {
        self.finished_at
            .map(|finished| finished.duration_since(self.queued_at))
    }
}

#[derive(Debug)]
struct RequestState {
    result: Option<ForceResult>,
    timestamps: Timestamps,
}

/// A single unit of dispatched work.
///
/// The immutable inputs (`id`, `position`, `active`, `cell`, `parameters`) are fixed at
/// construction. The status lives in an atomic so that waiters can observe it without the
/// queue lock; the result and timestamps are guarded by a per-record mutex that is held
/// across every status transition, so a reader that sees `Done` and then asks for the
/// result always finds it populated.
///
/// `ForceRequest` deliberately does not implement `PartialEq`: two records are the same
/// only if they are the same allocation. See [`RequestHandle`].
#[derive(Debug)]
pub struct ForceRequest {
    id: i64,
    position: Vec<f64>,
    active: Arc<[usize]>,
    cell: Cell,
    parameters: String,
    status: AtomicU8,
    state: Mutex<RequestState>,
}

impl ForceRequest {
    pub fn new(
        id: i64,
        position: Vec<f64>,
        active: Arc<[usize]>,
        cell: Cell,
        parameters: String,
    ) -> Self {
        Self {
            id,
            position,
            active,
            cell,
            parameters,
            status: AtomicU8::new(RequestStatus::Queued as u8),
            state: Mutex::new(RequestState {
                result: None,
                timestamps: Timestamps::new(),
            }),
        }
    }

    /// Builds a record that already reached `status`, carrying the given result and timestamps.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn finished(
        id: i64,
        position: Vec<f64>,
        active: Arc<[usize]>,
        cell: Cell,
        parameters: String,
        status: RequestStatus,
        result: ForceResult,
        timestamps: Timestamps,
    ) -> Self {
        Self {
            id,
            position,
            active,
            cell,
            parameters,
            status: AtomicU8::new(status as u8),
            state: Mutex::new(RequestState {
                result: Some(result),
                timestamps,
            }),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn position(&self) -> &[f64] {
        &self.position
    }

    pub fn n_coords(&self) -> usize {
        self.position.len()
    }

    pub fn active(&self) -> &Arc<[usize]> {
        &self.active
    }

    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    pub fn parameters(&self) -> &str {
        &self.parameters
    }

    #[inline]
    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn result(&self) -> Option<ForceResult> {
        self.state.lock().result.clone()
    }

    pub fn timestamps(&self) -> Timestamps {
        self.state.lock().timestamps
    }

    /// Moves the record from `Queued` to `Running`.
    pub fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        let moved = self.transition(|s| s == RequestStatus::Queued, RequestStatus::Running);
        if moved {
            state.timestamps.dispatched_at = Some(Instant::now());
        }
        moved
    }

    /// Stores the result and moves the record to `Done`.
    ///
    /// Returns `false` and drops the result when the record already reached a terminal
    /// state, in particular when it was forced to `Exit` mid-evaluation.
    pub fn complete(&self, result: ForceResult) -> bool {
        let mut state = self.state.lock();
        let moved = self.transition(|s| !s.is_terminal(), RequestStatus::Done);
        if moved {
            let now = Instant::now();
            state.timestamps.dispatched_at.get_or_insert(now);
            state.timestamps.finished_at = Some(now);
            state.result = Some(result);
        }
        moved
    }

    /// Forces the record to `Exit` unless it already finished.
    pub fn abandon(&self) -> bool {
        let mut state = self.state.lock();
        let moved = self.transition(|s| !s.is_terminal(), RequestStatus::Exit);
        if moved {
            state.timestamps.finished_at = Some(Instant::now());
        }
        moved
    }

    /// Returns a `Running` record to `Queued` so that it can be dispatched again.
    pub fn requeue(&self) -> bool {
        let mut state = self.state.lock();
        let moved = self.transition(|s| s == RequestStatus::Running, RequestStatus::Queued);
        if moved {
            state.timestamps.dispatched_at = None;
        }
        moved
    }

    fn transition<F>(&self, allowed: F, to: RequestStatus) -> bool
    where
        F: Fn(RequestStatus) -> bool,
    {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if !allowed(RequestStatus::from_u8(current)) {
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// The caller-facing reference to a submitted request.
///
/// Equality is identity: two handles are equal only when they point at the same record
/// allocation, regardless of field values. Handles returned by a dispatcher also carry the
/// versioned arena key of the record in the shared queue; detached handles (such as the
/// aggregate record of a fan-out submission) have no key and are never in any queue.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    key: Option<RequestKey>,
    request: Arc<ForceRequest>,
}

impl RequestHandle {
    pub(crate) fn attached(key: RequestKey, request: Arc<ForceRequest>) -> Self {
        Self {
            key: Some(key),
            request,
        }
    }

    pub fn detached(request: ForceRequest) -> Self {
        Self {
            key: None,
            request: Arc::new(request),
        }
    }

    pub fn key(&self) -> Option<RequestKey> {
        self.key
    }

    pub fn request(&self) -> &Arc<ForceRequest> {
        &self.request
    }
}

impl PartialEq for RequestHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.request, &other.request)
    }
}

impl Eq for RequestHandle {}

impl Deref for RequestHandle {
    type Target = ForceRequest;

    fn deref(&self) -> &Self::Target {
        &self.request
    }
}

/// Serializes backend parameters into the string attached to every request.
pub fn encode_parameters(parameters: &BTreeMap<String, String>) -> String {
    let mut encoded = String::from(" ");
    for (key, value) in parameters {
        encoded.push_str(key);
        encoded.push_str(" : ");
        encoded.push_str(value);
        encoded.push_str(" , ");
    }
    encoded
}
