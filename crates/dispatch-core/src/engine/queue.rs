use crate::core::models::ids::RequestKey;
use crate::core::models::request::{ForceRequest, RequestHandle, RequestStatus};
use parking_lot::{Mutex, MutexGuard};
use slotmap::SlotMap;
use std::sync::Arc;

pub type QueueGuard<'a> = MutexGuard<'a, SlotMap<RequestKey, Arc<ForceRequest>>>;

/// The shared queue of tracked requests.
///
/// A single coarse lock guards membership. Caller threads append and release, the polling
/// thread sweeps, and a remote interface that was opened on this queue sweeps through the
/// same lock.
#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: Mutex<SlotMap<RequestKey, Arc<ForceRequest>>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: ForceRequest) -> RequestHandle {
        let request = Arc::new(request);
        let key = self.requests.lock().insert(request.clone());
        RequestHandle::attached(key, request)
    }

    /// Appends all requests under a single acquisition of the lock.
    pub fn insert_batch(&self, requests: Vec<ForceRequest>) -> Vec<RequestHandle> {
        let mut guard = self.requests.lock();
        requests
            .into_iter()
            .map(|request| {
                let request = Arc::new(request);
                let key = guard.insert(request.clone());
                RequestHandle::attached(key, request)
            })
            .collect()
    }

    /// Removes the exact record behind `handle`.
    ///
    /// Returns `false` when the record is not tracked: it was already released, the handle
    /// is detached, or the key now belongs to another record.
    pub fn remove(&self, handle: &RequestHandle) -> bool {
        let Some(key) = handle.key() else {
            return false;
        };
        let mut guard = self.requests.lock();
        match guard.get(key) {
            Some(tracked) if Arc::ptr_eq(tracked, handle.request()) => {
                guard.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, handle: &RequestHandle) -> bool {
        handle.key().is_some_and(|key| {
            self.requests
                .lock()
                .get(key)
                .is_some_and(|tracked| Arc::ptr_eq(tracked, handle.request()))
        })
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    pub fn lock(&self) -> QueueGuard<'_> {
        self.requests.lock()
    }

    /// Forces every non-terminal tracked record to `Exit`, returning how many moved.
    pub fn abandon_all(&self) -> usize {
        self.requests
            .lock()
            .values()
            .filter(|request| request.abandon())
            .count()
    }

    /// Records currently in `status`, oldest first.
    pub fn with_status(guard: &QueueGuard<'_>, status: RequestStatus) -> Vec<Arc<ForceRequest>> {
        let mut selected: Vec<_> = guard
            .values()
            .filter(|request| request.status() == status)
            .cloned()
            .collect();
        selected.sort_by_key(|request| request.timestamps().queued_at);
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::cell::Cell;
    use std::thread;

    fn request(id: i64) -> ForceRequest {
        ForceRequest::new(
            id,
            vec![0.0; 3],
            Arc::from(vec![0, 1, 2]),
            Cell::default(),
            String::from(" "),
        )
    }

    #[test]
    fn insert_tracks_record_behind_returned_handle() {
        let queue = RequestQueue::new();
        let handle = queue.insert(request(0));
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&handle));
        assert!(handle.key().is_some());
    }

    #[test]
    fn insert_batch_returns_handles_in_order() {
        let queue = RequestQueue::new();
        let handles = queue.insert_batch((0..4).map(request).collect());
        let ids: Vec<_> = handles.iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn remove_is_identity_based_and_idempotent() {
        let queue = RequestQueue::new();
        let first = queue.insert(request(7));
        let twin = queue.insert(request(7));

        assert!(queue.remove(&first));
        assert!(!queue.remove(&first));
        assert!(queue.contains(&twin));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn stale_key_never_removes_a_newer_record() {
        let queue = RequestQueue::new();
        let old = queue.insert(request(1));
        assert!(queue.remove(&old));
        let newer = queue.insert(request(1));

        assert!(!queue.remove(&old));
        assert!(queue.contains(&newer));
    }

    #[test]
    fn detached_handle_is_never_removed() {
        let queue = RequestQueue::new();
        queue.insert(request(0));
        let detached = RequestHandle::detached(request(0));
        assert!(!queue.remove(&detached));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn concurrent_releases_remove_exactly_once() {
        for _ in 0..32 {
            let queue = Arc::new(RequestQueue::new());
            let handle = queue.insert(request(0));
            let removals: usize = (0..8)
                .map(|_| {
                    let queue = queue.clone();
                    let handle = handle.clone();
                    thread::spawn(move || queue.remove(&handle))
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|t| t.join().unwrap() as usize)
                .sum();

            assert_eq!(removals, 1);
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn abandon_all_skips_finished_records() {
        let queue = RequestQueue::new();
        let done = queue.insert(request(0));
        let pending = queue.insert(request(1));
        assert!(done.complete(crate::core::models::request::ForceResult::zeros(3)));

        assert_eq!(queue.abandon_all(), 1);
        assert_eq!(done.status(), RequestStatus::Done);
        assert_eq!(pending.status(), RequestStatus::Exit);
    }

    #[test]
    fn with_status_selects_oldest_first() {
        let queue = RequestQueue::new();
        let handles = queue.insert_batch((0..3).map(request).collect());
        handles[1].mark_running();

        let guard = queue.lock();
        let queued = RequestQueue::with_status(&guard, RequestStatus::Queued);
        let ids: Vec<_> = queued.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![0, 2]);
    }
}
