use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// A joinable thread shared between its owner and the shutdown coordinator.
///
/// Whoever takes the handle out first joins it, so a thread is joined at most once.
pub type ThreadSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

pub type ShutdownCallback = Box<dyn FnOnce() + Send>;

struct RegisteredThread {
    running: Arc<AtomicBool>,
    slot: ThreadSlot,
}

#[derive(Default)]
struct ShutdownState {
    triggered: AtomicBool,
    exiting: AtomicBool,
    reason: Mutex<Option<String>>,
    threads: Mutex<Vec<RegisteredThread>>,
    callbacks: Mutex<Vec<ShutdownCallback>>,
}

/// Cooperative, process-wide shutdown coordinator.
///
/// Cloning the token shares the same state. Long-running loops check
/// [`ShutdownToken::is_triggered`] on every iteration; [`ShutdownToken::trigger`] runs the
/// registered callbacks, clears every registered run flag and joins the registered threads.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    state: Arc<ShutdownState>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a background thread together with the flag that keeps it running.
    pub fn register_thread(&self, running: Arc<AtomicBool>, slot: ThreadSlot) {
        self.state
            .threads
            .lock()
            .push(RegisteredThread { running, slot });
    }

    /// Registers a callback run once when shutdown is triggered.
    pub fn register_callback(&self, callback: ShutdownCallback) {
        self.state.callbacks.lock().push(callback);
    }

    /// Starts a shutdown. Returns `false` if one was already triggered.
    ///
    /// Callbacks run before any thread is joined. The calling thread is never joined, so
    /// triggering from a polling thread is safe.
    pub fn trigger(&self, reason: impl Into<String>) -> bool {
        if self.state.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        let reason = reason.into();
        warn!(%reason, "Shutdown triggered.");
        self.state.exiting.store(true, Ordering::Release);
        *self.state.reason.lock() = Some(reason);

        let callbacks = std::mem::take(&mut *self.state.callbacks.lock());
        debug!(count = callbacks.len(), "Running shutdown callbacks.");
        for callback in callbacks {
            callback();
        }

        let threads = std::mem::take(&mut *self.state.threads.lock());
        for thread in &threads {
            thread.running.store(false, Ordering::Release);
        }
        for thread in threads {
            join_slot(&thread.slot);
        }

        self.state.exiting.store(false, Ordering::Release);
        true
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.state.triggered.load(Ordering::Acquire)
    }

    /// `true` while a triggered shutdown is still running callbacks and joining threads.
    pub fn is_exiting(&self) -> bool {
        self.state.exiting.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.state.reason.lock().clone()
    }
}

impl std::fmt::Debug for ShutdownToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownToken")
            .field("triggered", &self.is_triggered())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Joins the thread held in `slot` unless it is the current thread or already joined.
pub(crate) fn join_slot(slot: &ThreadSlot) {
    let handle = {
        let mut guard = slot.lock();
        match guard.as_ref() {
            Some(handle) if handle.thread().id() == thread::current().id() => None,
            _ => guard.take(),
        }
    };
    if let Some(handle) = handle {
        let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
        if handle.join().is_err() {
            warn!(thread = %name, "Background thread panicked before shutdown.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn spin_thread(running: Arc<AtomicBool>) -> ThreadSlot {
        let handle = thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
        });
        Arc::new(Mutex::new(Some(handle)))
    }

    #[test]
    fn new_token_is_not_triggered() {
        let token = ShutdownToken::new();
        assert!(!token.is_triggered());
        assert!(!token.is_exiting());
        assert!(token.reason().is_none());
    }

    #[test]
    fn trigger_is_idempotent_and_keeps_first_reason() {
        let token = ShutdownToken::new();
        assert!(token.trigger("first"));
        assert!(!token.trigger("second"));
        assert!(token.is_triggered());
        assert!(!token.is_exiting());
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[test]
    fn trigger_runs_each_callback_exactly_once() {
        let token = ShutdownToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            token.register_callback(Box::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
        }

        token.trigger("test");
        token.trigger("again");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn trigger_clears_flags_and_joins_registered_threads() {
        let token = ShutdownToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let slot = spin_thread(running.clone());
        token.register_thread(running.clone(), slot.clone());

        token.trigger("stop");

        assert!(!running.load(Ordering::Acquire));
        assert!(slot.lock().is_none());
    }

    #[test]
    fn clones_share_state() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        clone.trigger("from clone");
        assert!(token.is_triggered());
    }

    #[test]
    fn trigger_from_registered_thread_does_not_join_itself() {
        let token = ShutdownToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let slot: ThreadSlot = Arc::new(Mutex::new(None));
        let handle = {
            let token = token.clone();
            let running = running.clone();
            thread::spawn(move || {
                while running.load(Ordering::Acquire) && !token.is_triggered() {
                    token.trigger("from worker");
                }
            })
        };
        *slot.lock() = Some(handle);
        token.register_thread(running, slot.clone());

        while !token.is_triggered() {
            thread::sleep(Duration::from_millis(1));
        }
        join_slot(&slot);
        assert_eq!(token.reason().as_deref(), Some("from worker"));
    }
}
