use super::error::DispatchError;
use super::shutdown::{ShutdownToken, ThreadSlot, join_slot};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, instrument};

/// The background thread that drives a threaded dispatcher.
///
/// Every iteration sleeps for the latency and then runs the poll callback, until the run
/// flag is cleared or shutdown is triggered.
#[derive(Debug)]
pub struct PollingThread {
    name: String,
    running: Arc<AtomicBool>,
    slot: ThreadSlot,
}

impl PollingThread {
    pub fn spawn<F>(
        name: String,
        latency: Duration,
        shutdown: &ShutdownToken,
        poll: F,
    ) -> Result<Self, DispatchError>
    where
        F: Fn() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let slot: ThreadSlot = Arc::new(Mutex::new(None));

        let handle = {
            let running = running.clone();
            let shutdown = shutdown.clone();
            let thread_name = name.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || polling_loop(&thread_name, latency, &running, &shutdown, poll))
                .map_err(|source| DispatchError::Thread {
                    name: name.clone(),
                    source,
                })?
        };
        *slot.lock() = Some(handle);
        shutdown.register_thread(running.clone(), slot.clone());

        Ok(Self {
            name,
            running,
            slot,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clears the run flag and joins the thread, unless called from the thread itself.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        join_slot(&self.slot);
    }
}

#[instrument(skip_all, name = "polling_loop", fields(thread = %name))]
fn polling_loop<F: Fn()>(
    name: &str,
    latency: Duration,
    running: &AtomicBool,
    shutdown: &ShutdownToken,
    poll: F,
) {
    debug!("Polling thread started.");
    while running.load(Ordering::Acquire) && !shutdown.is_triggered() {
        thread::sleep(latency);
        poll();
    }
    debug!("Polling thread finished.");
}
