//! Ready-gated FIFO dispatch queue
//!
//! Operations wait here for an execution slot. The queue preserves
//! submission order but only dispatches entries that have been marked
//! ready, and never more than the configured number at once. Slots are
//! released by dropping the [`QueuePermit`] held by the running
//! operation.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::protocol::TransferId;

struct QueueEntry {
    id: TransferId,
    ready: bool,
}

struct QueueInner {
    waiting: VecDeque<QueueEntry>,
    active: HashSet<TransferId>,
}

/// Concurrency-limited dispatch queue for download operations
pub(crate) struct DispatchQueue {
    semaphore: Arc<Semaphore>,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl DispatchQueue {
    pub(crate) fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            inner: Mutex::new(QueueInner {
                waiting: VecDeque::new(),
                active: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Add an entry to the back of the queue. Entries submitted not
    /// ready sit in line but are skipped by dispatch until
    /// [`mark_ready`](Self::mark_ready) is called for them.
    pub(crate) fn submit(&self, id: TransferId, ready: bool) {
        let mut inner = self.inner.lock();
        if inner.waiting.iter().any(|e| e.id == id) || inner.active.contains(&id) {
            return;
        }
        inner.waiting.push_back(QueueEntry { id, ready });
        drop(inner);
        if ready {
            self.notify.notify_waiters();
        }
    }

    /// Mark a waiting entry as eligible for dispatch
    pub(crate) fn mark_ready(&self, id: TransferId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.waiting.iter_mut().find(|e| e.id == id) {
            entry.ready = true;
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// Remove an entry from the queue. Pending [`acquire`](Self::acquire)
    /// calls for it resolve to `None`.
    pub(crate) fn remove(&self, id: TransferId) {
        let mut inner = self.inner.lock();
        inner.waiting.retain(|e| e.id != id);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Drop every waiting entry
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.waiting.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Wait until `id` reaches the front of the ready line and a slot is
    /// free. Returns `None` if the entry was removed while waiting.
    pub(crate) async fn acquire(self: &Arc<Self>, id: TransferId) -> Option<QueuePermit> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if !inner.waiting.iter().any(|e| e.id == id) {
                    return None;
                }
                let first_ready = inner.waiting.iter().find(|e| e.ready).map(|e| e.id);
                if first_ready == Some(id) {
                    if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                        inner.waiting.retain(|e| e.id != id);
                        inner.active.insert(id);
                        drop(inner);
                        // A new head emerged; waiters parked behind the
                        // departed entry must re-check
                        self.notify.notify_waiters();
                        return Some(QueuePermit {
                            _permit: permit,
                            id,
                            queue: Arc::clone(self),
                        });
                    }
                }
            }
            notified.await;
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub(crate) fn waiting_count(&self) -> usize {
        self.inner.lock().waiting.len()
    }
}

/// RAII execution slot. Dropping it frees the slot and wakes waiters.
pub(crate) struct QueuePermit {
    _permit: OwnedSemaphorePermit,
    id: TransferId,
    queue: Arc<DispatchQueue>,
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        let mut inner = self.queue.inner.lock();
        inner.active.remove(&self.id);
        drop(inner);
        self.queue.notify.notify_waiters();
    }
}
