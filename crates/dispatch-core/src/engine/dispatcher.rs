use super::backend::Backend;
use super::config::{ActiveSelection, DEFAULT_LATENCY_SECS, ForceFieldConfig};
use super::error::DispatchError;
use super::queue::RequestQueue;
use super::scheduler::PollingThread;
use super::shutdown::ShutdownToken;
use crate::core::models::cell::Cell;
use crate::core::models::request::{
    ForceRequest, ForceResult, RequestHandle, RequestStatus, encode_parameters,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Active coordinate indices, resolved from the selection on the first configuration seen.
#[derive(Debug, Clone)]
pub(crate) enum ActiveAtoms {
    Pending(ActiveSelection),
    Resolved(Arc<[usize]>),
}

impl ActiveAtoms {
    /// Returns the resolved indices, resolving them against `n_coords` on the first call.
    ///
    /// `on_first` runs once, after the indices passed the range check, and can veto the
    /// resolution. A failed first call leaves the selection pending.
    pub(crate) fn resolve<F>(&mut self, n_coords: usize, on_first: F) -> Result<Arc<[usize]>, DispatchError>
    where
        F: FnOnce() -> Result<(), DispatchError>,
    {
        let selection = match self {
            ActiveAtoms::Resolved(active) => return Ok(active.clone()),
            ActiveAtoms::Pending(selection) => selection,
        };

        let expanded: Vec<usize> = match selection {
            ActiveSelection::All => (0..n_coords).collect(),
            ActiveSelection::Atoms(atoms) => atoms
                .iter()
                .flat_map(|&atom| [3 * atom, 3 * atom + 1, 3 * atom + 2])
                .collect(),
        };
        let offending = expanded.iter().copied().find(|&index| index >= n_coords);
        if expanded.len() > n_coords || offending.is_some() {
            return Err(DispatchError::ActiveAtomsOutOfRange {
                count: expanded.len(),
                offending,
                n_coords,
            });
        }
        on_first()?;

        let active: Arc<[usize]> = Arc::from(expanded);
        *self = ActiveAtoms::Resolved(active.clone());
        Ok(active)
    }
}

/// Runtime settings of a dispatcher, independent of its backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub latency: Duration,
    pub threaded: bool,
    pub pbc: bool,
    pub active: ActiveSelection,
    pub parameters: BTreeMap<String, String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs_f64(DEFAULT_LATENCY_SECS),
            threaded: false,
            pbc: false,
            active: ActiveSelection::All,
            parameters: BTreeMap::new(),
        }
    }
}

impl From<&ForceFieldConfig> for DispatchSettings {
    fn from(config: &ForceFieldConfig) -> Self {
        Self {
            latency: config.latency,
            threaded: config.threaded,
            pbc: config.pbc,
            active: config.active.clone(),
            parameters: config.parameters.clone(),
        }
    }
}

struct DispatchCore {
    name: String,
    latency: Duration,
    threaded: bool,
    pbc: bool,
    parameters: String,
    active: Mutex<ActiveAtoms>,
    queue: Arc<RequestQueue>,
    backend: Backend,
    scheduler: Mutex<Option<PollingThread>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl DispatchCore {
    fn poll_once(&self, shutdown: &ShutdownToken) -> usize {
        let outcome = self.backend.poll(&self.queue);
        // The queue lock is released here, so shutdown callbacks may take it.
        if let Some(reason) = outcome.escalation {
            error!(forcefield = %self.name, %reason, "Unrecoverable backend failure.");
            shutdown.trigger(reason);
        }
        outcome.processed
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let poller = self.scheduler.lock().take();
        if let Some(poller) = poller {
            poller.stop();
        }
        let exited = self.queue.abandon_all();
        self.backend.close();
        info!(forcefield = %self.name, exited, "Force field stopped.");
    }
}

/// Owns one request queue and drives it through one backend.
///
/// In serial mode every submission is followed by an inline poll; in threaded mode a
/// [`PollingThread`] polls the queue every `latency` once [`Dispatcher::start`] has run.
pub struct Dispatcher {
    core: Arc<DispatchCore>,
    shutdown: ShutdownToken,
}

impl Dispatcher {
    pub fn new(
        name: impl Into<String>,
        backend: Backend,
        settings: DispatchSettings,
        shutdown: ShutdownToken,
    ) -> Self {
        let core = DispatchCore {
            name: name.into(),
            latency: settings.latency,
            threaded: settings.threaded,
            pbc: settings.pbc,
            parameters: encode_parameters(&settings.parameters),
            active: Mutex::new(ActiveAtoms::Pending(settings.active)),
            queue: Arc::new(RequestQueue::new()),
            backend,
            scheduler: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        };
        Self {
            core: Arc::new(core),
            shutdown,
        }
    }

    pub fn from_config(config: &ForceFieldConfig, shutdown: ShutdownToken) -> Result<Self, DispatchError> {
        let backend = Backend::from_kind(&config.name, &config.kind)?;
        debug!(forcefield = %config.name, ?backend, "Built force field backend.");
        Ok(Self::new(
            config.name.clone(),
            backend,
            DispatchSettings::from(config),
            shutdown,
        ))
    }

    /// Queues a configuration for evaluation.
    ///
    /// The first call resolves the active indices against the configuration size and lets
    /// the backend validate it. In serial mode the queue is polled before returning.
    pub fn submit(&self, positions: Vec<f64>, cell: &Cell, reqid: i64) -> Result<RequestHandle, DispatchError> {
        let active = self.resolve_active(positions.len())?;
        let mut positions = positions;
        if self.core.pbc {
            cell.fold(&mut positions);
        }

        let request = ForceRequest::new(reqid, positions, active, *cell, self.core.parameters.clone());
        let handle = self.core.queue.insert(request);
        debug!(forcefield = %self.core.name, reqid, "Request queued.");

        if !self.core.threaded {
            self.poll_once();
        }
        Ok(handle)
    }

    /// Queues several prepared configurations under a single acquisition of the queue lock.
    ///
    /// Positions are taken as given: no folding and no active-index resolution.
    pub(crate) fn submit_batch(
        &self,
        blocks: Vec<Vec<f64>>,
        active: Arc<[usize]>,
        cell: &Cell,
        reqids: impl IntoIterator<Item = i64>,
    ) -> Vec<RequestHandle> {
        let requests = blocks
            .into_iter()
            .zip(reqids)
            .map(|(positions, reqid)| {
                ForceRequest::new(reqid, positions, active.clone(), *cell, self.core.parameters.clone())
            })
            .collect();
        let handles = self.core.queue.insert_batch(requests);
        if !self.core.threaded {
            self.poll_once();
        }
        handles
    }

    /// Runs one backend sweep; returns how many records finished.
    pub fn poll_once(&self) -> usize {
        self.core.poll_once(&self.shutdown)
    }

    /// Stops tracking the record behind `handle`. Returns `false` if it was not tracked.
    pub fn release(&self, handle: &RequestHandle) -> bool {
        let removed = self.core.queue.remove(handle);
        if removed {
            debug!(forcefield = %self.core.name, id = handle.id(), status = %handle.status(), "Request released.");
        }
        removed
    }

    /// Opens the backend and, in threaded mode, starts the polling thread.
    pub fn start(&self) -> Result<(), DispatchError> {
        if self.core.started.swap(true, Ordering::AcqRel) {
            return Err(DispatchError::AlreadyStarted(self.core.name.clone()));
        }
        self.core.backend.open(self.core.queue.clone())?;

        if self.core.threaded {
            let weak: Weak<DispatchCore> = Arc::downgrade(&self.core);
            let shutdown = self.shutdown.clone();
            let poller = PollingThread::spawn(
                format!("poll_{}", self.core.name),
                self.core.latency,
                &self.shutdown,
                move || {
                    if let Some(core) = weak.upgrade() {
                        if !core.queue.is_empty() {
                            core.poll_once(&shutdown);
                        }
                    }
                },
            )?;
            *self.core.scheduler.lock() = Some(poller);
        }

        let weak = Arc::downgrade(&self.core);
        self.shutdown.register_callback(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                core.stop();
            }
        }));
        info!(forcefield = %self.core.name, backend = self.core.backend.name(), threaded = self.core.threaded, "Force field started.");
        Ok(())
    }

    /// Halts polling, forces every tracked record to `Exit` and closes the backend.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Per-timestep hook forwarded to the backend.
    pub fn update(&self) {
        self.core.backend.update();
    }

    /// Blocks until the record is `Done` and returns its result.
    pub fn wait(&self, handle: &RequestHandle) -> Result<ForceResult, DispatchError> {
        wait_for(handle, self.core.latency, &self.shutdown)
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn latency(&self) -> Duration {
        self.core.latency
    }

    pub fn is_threaded(&self) -> bool {
        self.core.threaded
    }

    pub fn pbc(&self) -> bool {
        self.core.pbc
    }

    /// Number of records currently tracked.
    pub fn pending(&self) -> usize {
        self.core.queue.len()
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.core.queue
    }

    pub fn shutdown(&self) -> &ShutdownToken {
        &self.shutdown
    }

    pub(crate) fn validate(&self, n_coords: usize) -> Result<(), DispatchError> {
        Ok(self.core.backend.validate(n_coords)?)
    }

    fn resolve_active(&self, n_coords: usize) -> Result<Arc<[usize]>, DispatchError> {
        self.core
            .active
            .lock()
            .resolve(n_coords, || self.validate(n_coords))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.core.started.load(Ordering::Acquire) {
            self.core.stop();
        }
    }
}

/// Sleep-polls `request` until it is `Done`.
///
/// Returns [`DispatchError::Aborted`] as soon as the record is forced to `Exit` or a
/// shutdown is triggered, so a waiter never outlives a shutdown by more than one latency.
pub(crate) fn wait_for(
    request: &ForceRequest,
    latency: Duration,
    shutdown: &ShutdownToken,
) -> Result<ForceResult, DispatchError> {
    let aborted = || DispatchError::Aborted {
        id: request.id(),
        child: None,
    };
    loop {
        match request.status() {
            RequestStatus::Done => return request.result().ok_or_else(aborted),
            RequestStatus::Exit => return Err(aborted()),
            RequestStatus::Queued | RequestStatus::Running => {}
        }
        if shutdown.is_triggered() {
            return Err(aborted());
        }
        if latency.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(latency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::potentials::lennard_jones::LennardJones;
    use crate::core::potentials::null::NullPotential;
    use crate::core::potentials::{EvaluationError, Evaluator};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn serial(backend: Backend, active: ActiveSelection) -> Dispatcher {
        let settings = DispatchSettings {
            active,
            latency: Duration::from_millis(1),
            ..DispatchSettings::default()
        };
        Dispatcher::new("test", backend, settings, ShutdownToken::new())
    }

    fn threaded(backend: Backend) -> Dispatcher {
        let settings = DispatchSettings {
            threaded: true,
            latency: Duration::from_millis(1),
            ..DispatchSettings::default()
        };
        Dispatcher::new("test", backend, settings, ShutdownToken::new())
    }

    fn null() -> Backend {
        Backend::InProcess(Box::new(NullPotential))
    }

    /// Counts how often the dispatcher asks it to validate a system size.
    struct CountingValidator {
        validations: Arc<AtomicUsize>,
    }

    impl Evaluator for CountingValidator {
        fn name(&self) -> &str {
            "counting"
        }

        fn validate(&self, _: usize) -> Result<(), EvaluationError> {
            self.validations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn evaluate(&self, request: &ForceRequest) -> Result<ForceResult, EvaluationError> {
            Ok(ForceResult::zeros(request.n_coords()))
        }
    }

    #[test]
    fn active_indices_are_computed_once_from_the_first_configuration() {
        let validations = Arc::new(AtomicUsize::new(0));
        let backend = Backend::InProcess(Box::new(CountingValidator {
            validations: validations.clone(),
        }));
        let dispatcher = serial(backend, ActiveSelection::Atoms(vec![1]));

        let first = dispatcher.submit(vec![0.0; 6], &Cell::default(), 0).unwrap();
        let second = dispatcher.submit(vec![0.0; 9], &Cell::default(), 1).unwrap();

        assert_eq!(&first.active()[..], &[3, 4, 5]);
        assert!(Arc::ptr_eq(first.active(), second.active()));
        assert_eq!(validations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn all_atoms_selection_covers_every_coordinate() {
        let dispatcher = serial(null(), ActiveSelection::All);
        let handle = dispatcher.submit(vec![0.0; 6], &Cell::default(), 0).unwrap();
        assert_eq!(&handle.active()[..], &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn out_of_range_active_atoms_fail_without_creating_a_record() {
        let dispatcher = serial(null(), ActiveSelection::Atoms(vec![0, 2]));
        let result = dispatcher.submit(vec![0.0; 6], &Cell::default(), 0);

        assert!(matches!(
            result,
            Err(DispatchError::ActiveAtomsOutOfRange {
                count: 6,
                offending: Some(6),
                n_coords: 6
            })
        ));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn out_of_range_atom_ahead_of_valid_ones_is_rejected() {
        let dispatcher = serial(null(), ActiveSelection::Atoms(vec![5, 0]));
        let result = dispatcher.submit(vec![0.0; 6], &Cell::default(), 0);

        assert!(matches!(
            result,
            Err(DispatchError::ActiveAtomsOutOfRange {
                offending: Some(15),
                n_coords: 6,
                ..
            })
        ));
        assert_eq!(dispatcher.pending(), 0);

        // The selection stays pending, so a large enough system still resolves it.
        let handle = dispatcher.submit(vec![0.0; 18], &Cell::default(), 1).unwrap();
        assert_eq!(&handle.active()[..], &[15, 16, 17, 0, 1, 2]);
    }

    #[test]
    fn too_many_active_atoms_fail_even_when_indices_fit() {
        let dispatcher = serial(null(), ActiveSelection::Atoms(vec![0, 0, 0]));
        let result = dispatcher.submit(vec![0.0; 6], &Cell::default(), 0);
        assert!(matches!(result, Err(DispatchError::ActiveAtomsOutOfRange { .. })));
    }

    #[test]
    fn backend_validation_failure_rejects_first_submission() {
        let backend = Backend::InProcess(Box::new(LennardJones::new(1.0, 1.0).unwrap()));
        let dispatcher = serial(backend, ActiveSelection::All);
        let result = dispatcher.submit(vec![0.0; 4], &Cell::default(), 0);

        assert!(matches!(result, Err(DispatchError::Evaluation { .. })));
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn serial_mode_completes_each_request_before_returning() {
        let dispatcher = serial(null(), ActiveSelection::All);
        let handles: Vec<_> = (0..10)
            .map(|id| dispatcher.submit(vec![1.0; 9], &Cell::default(), id).unwrap())
            .collect();

        for handle in &handles {
            assert_eq!(handle.status(), RequestStatus::Done);
            let result = dispatcher.wait(handle).unwrap();
            assert_eq!(result.energy, 0.0);
            assert_eq!(result.forces, vec![0.0; 9]);
        }
        assert_eq!(dispatcher.pending(), 10);
        for handle in &handles {
            assert!(dispatcher.release(handle));
        }
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn pbc_folds_positions_into_the_cell() {
        let settings = DispatchSettings {
            pbc: true,
            ..DispatchSettings::default()
        };
        let dispatcher = Dispatcher::new("pbc", null(), settings, ShutdownToken::new());
        let cell = Cell::orthorhombic(10.0, 10.0, 10.0).unwrap();
        let handle = dispatcher.submit(vec![12.0, -7.0, 3.0], &cell, 0).unwrap();

        let folded = handle.position();
        assert!((folded[0] - 2.0).abs() < 1e-12);
        assert!((folded[1] - 3.0).abs() < 1e-12);
        assert!((folded[2] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn parameters_are_attached_to_every_request() {
        let mut parameters = BTreeMap::new();
        parameters.insert("sigma".to_string(), "1.0".to_string());
        let settings = DispatchSettings {
            parameters,
            ..DispatchSettings::default()
        };
        let dispatcher = Dispatcher::new("p", null(), settings, ShutdownToken::new());
        let handle = dispatcher.submit(vec![0.0; 3], &Cell::default(), 0).unwrap();
        assert_eq!(handle.parameters(), " sigma : 1.0 , ");
    }

    #[test]
    fn release_is_identity_based() {
        let dispatcher = serial(null(), ActiveSelection::All);
        let a = dispatcher.submit(vec![0.0; 3], &Cell::default(), 4).unwrap();
        let b = dispatcher.submit(vec![0.0; 3], &Cell::default(), 4).unwrap();

        assert_ne!(a, b);
        assert!(dispatcher.release(&a));
        assert!(!dispatcher.release(&a));
        assert_eq!(dispatcher.pending(), 1);
        assert!(dispatcher.queue().contains(&b));
    }

    #[test]
    fn concurrent_release_of_one_handle_removes_it_once() {
        let dispatcher = Arc::new(serial(null(), ActiveSelection::All));
        let handle = dispatcher.submit(vec![0.0; 3], &Cell::default(), 0).unwrap();

        let removed: usize = (0..8)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let handle = handle.clone();
                thread::spawn(move || dispatcher.release(&handle))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap() as usize)
            .sum();

        assert_eq!(removed, 1);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn threaded_mode_completes_requests_from_the_polling_thread() {
        let dispatcher = threaded(null());
        dispatcher.start().unwrap();

        let handles: Vec<_> = (0..5)
            .map(|id| dispatcher.submit(vec![0.0; 6], &Cell::default(), id).unwrap())
            .collect();
        for handle in &handles {
            let result = dispatcher.wait(handle).unwrap();
            assert_eq!(result.forces, vec![0.0; 6]);
            dispatcher.release(handle);
        }
        dispatcher.stop();
    }

    #[test]
    fn threaded_mode_without_start_never_polls() {
        let dispatcher = threaded(null());
        let handle = dispatcher.submit(vec![0.0; 3], &Cell::default(), 0).unwrap();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(handle.status(), RequestStatus::Queued);
    }

    #[test]
    fn start_twice_is_an_error() {
        let dispatcher = threaded(null());
        dispatcher.start().unwrap();
        assert!(matches!(dispatcher.start(), Err(DispatchError::AlreadyStarted(_))));
        dispatcher.stop();
    }

    #[test]
    fn stop_marks_pending_requests_exit_and_wait_aborts() {
        let dispatcher = threaded(null());
        let handle = dispatcher.submit(vec![0.0; 3], &Cell::default(), 7).unwrap();
        dispatcher.stop();

        assert_eq!(handle.status(), RequestStatus::Exit);
        assert!(matches!(
            dispatcher.wait(&handle),
            Err(DispatchError::Aborted { id: 7, child: None })
        ));
    }

    #[test]
    fn shutdown_stops_a_started_dispatcher() {
        let dispatcher = threaded(null());
        dispatcher.start().unwrap();
        let waiting = {
            let shutdown = dispatcher.shutdown().clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                shutdown.trigger("test shutdown");
            })
        };
        let settings = DispatchSettings {
            threaded: true,
            ..DispatchSettings::default()
        };
        let never_polled = Dispatcher::new("idle", null(), settings, dispatcher.shutdown().clone());
        let handle = never_polled.submit(vec![0.0; 3], &Cell::default(), 0).unwrap();

        let started = Instant::now();
        let result = never_polled.wait(&handle);
        waiting.join().unwrap();

        assert!(matches!(result, Err(DispatchError::Aborted { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(dispatcher.shutdown().is_triggered());
    }

    #[test]
    fn two_atom_lennard_jones_matches_closed_form() {
        let backend = Backend::InProcess(Box::new(LennardJones::new(1.0, 1.0).unwrap()));
        let dispatcher = serial(backend, ActiveSelection::All);
        let r = 2f64.powf(1.0 / 6.0);
        let handle = dispatcher
            .submit(vec![0.0, 0.0, 0.0, r, 0.0, 0.0], &Cell::default(), 0)
            .unwrap();
        let result = dispatcher.wait(&handle).unwrap();

        assert!((result.energy + 1.0).abs() < 1e-12);
        assert!(result.forces.iter().all(|f| f.abs() < 1e-9));

        let handle = dispatcher
            .submit(vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0], &Cell::default(), 1)
            .unwrap();
        let result = dispatcher.wait(&handle).unwrap();
        assert!(result.energy.abs() < 1e-12);
        assert!((result.forces[3] - 24.0).abs() < 1e-9);
        assert!((result.forces[0] + 24.0).abs() < 1e-9);
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn exhausted_external_retries_exit_the_request_and_trigger_shutdown() {
        use crate::engine::config::ExternalProcessConfig;
        use crate::engine::external::ExternalProcess;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("broken.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut config = ExternalProcessConfig::new(dir.path(), "broken.sh");
        config.max_retries = 2;
        let backend = Backend::ExternalProcess(ExternalProcess::new(config).unwrap());

        let dispatcher = serial(backend, ActiveSelection::All);
        dispatcher.start().unwrap();
        let handle = dispatcher.submit(vec![0.0; 3], &Cell::default(), 0).unwrap();

        assert_eq!(handle.status(), RequestStatus::Exit);
        assert!(dispatcher.shutdown().is_triggered());
        assert!(dispatcher.shutdown().reason().unwrap().contains("request 0"));
        assert!(matches!(dispatcher.wait(&handle), Err(DispatchError::Aborted { .. })));
    }
}
