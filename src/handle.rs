//! Per-subscriber download handle
//!
//! A [`DownloadHandle`] is one subscriber's view of a shared transfer.
//! Each handle carries its own observer callbacks and its own standing
//! vote; the owning operation arbitrates across all of them. When a
//! paused transfer is resumed the operation underneath a handle may be
//! swapped for a replacement, which the handle follows transparently.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use url::Url;

use crate::error::TaskError;
use crate::operation::Operation;
use crate::protocol::{
    ProgressCallback, StateCallback, TaskProgress, TaskState, TransferOutcome,
};

/// Shared state behind a handle. The operation keeps an `Arc` to this
/// in its ledger; the handle owns another. Identity comparisons use the
/// `Arc` pointer.
pub(crate) struct HandleCore {
    id: String,
    op: RwLock<Weak<Operation>>,
    /// Terminal state recorded at fan-out time so the handle can answer
    /// after the operation is gone
    latched: Mutex<Option<TaskState>>,
    /// Completion payload recorded alongside the terminal state; the
    /// container drops a finished operation while handles still exist
    outcome: Mutex<Option<TransferOutcome>>,
    progress: Mutex<Option<ProgressCallback>>,
    on_state: Mutex<Option<StateCallback>>,
}

impl HandleCore {
    pub(crate) fn new(id: String, op: Weak<Operation>) -> Self {
        Self {
            id,
            op: RwLock::new(op),
            latched: Mutex::new(None),
            outcome: Mutex::new(None),
            progress: Mutex::new(None),
            on_state: Mutex::new(None),
        }
    }

    /// Swap the observed operation for its replacement
    pub(crate) fn repoint(&self, op: Weak<Operation>) {
        *self.op.write() = op;
    }

    /// Record a terminal state for post-mortem queries
    pub(crate) fn latch(&self, state: TaskState) {
        *self.latched.lock() = Some(state);
    }

    /// Record the completion payload for post-mortem queries
    pub(crate) fn latch_outcome(&self, outcome: TransferOutcome) {
        *self.outcome.lock() = Some(outcome);
    }

    pub(crate) fn progress_callback(&self) -> Option<ProgressCallback> {
        self.progress.lock().clone()
    }

    pub(crate) fn state_callback(&self) -> Option<StateCallback> {
        self.on_state.lock().clone()
    }

    fn operation(&self) -> Option<Arc<Operation>> {
        self.op.read().upgrade()
    }
}

/// One subscriber's view of a download task.
///
/// Handles are deliberately not `Clone`; independent subscribers get
/// independent handles via [`new_handle`](Self::new_handle), each with
/// its own vote in the shared operation.
pub struct DownloadHandle {
    core: Arc<HandleCore>,
}

impl DownloadHandle {
    pub(crate) fn from_core(core: Arc<HandleCore>) -> Self {
        Self { core }
    }

    #[cfg(test)]
    pub(crate) fn core_for_tests(&self) -> Arc<HandleCore> {
        Arc::clone(&self.core)
    }

    /// Unique handle identifier, `"{transfer}-{index}"`
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// The download URL this handle observes
    pub fn url(&self) -> Option<Url> {
        self.core.operation().map(|op| op.request().url.clone())
    }

    /// Current task state as seen by this handle.
    ///
    /// After the operation is dropped this reports the latched terminal
    /// state, or `Suspended` when the task simply never ran.
    pub fn state(&self) -> TaskState {
        let latched = *self.core.latched.lock();
        if let Some(state) = latched {
            return state;
        }
        match self.core.operation() {
            Some(op) => op.state(),
            None => TaskState::Suspended,
        }
    }

    /// Terminal result, once the task completed. Remains available
    /// after the owning operation has been dropped.
    pub fn outcome(&self) -> Option<TransferOutcome> {
        let latched = self.core.outcome.lock().clone();
        if latched.is_some() {
            return latched;
        }
        self.core.operation().and_then(|op| op.outcome())
    }

    /// Whether the task is runnable and waiting for an execution slot
    pub fn is_ready(&self) -> bool {
        self.core
            .operation()
            .map(|op| op.facets().is_ready)
            .unwrap_or(false)
    }

    /// Whether the task was cancelled
    pub fn is_cancelled(&self) -> bool {
        if *self.core.latched.lock() == Some(TaskState::Cancelled) {
            return true;
        }
        self.core
            .operation()
            .map(|op| op.facets().is_cancelled)
            .unwrap_or(false)
    }

    /// Whether the transfer is executing right now
    pub fn is_running(&self) -> bool {
        self.core
            .operation()
            .map(|op| op.facets().is_executing)
            .unwrap_or(false)
    }

    /// Whether the underlying transfer has run its course: terminal, or
    /// paused after having started (a resume builds a replacement
    /// transfer rather than restarting this one). Also true once the
    /// operation itself is gone.
    pub fn is_finished(&self) -> bool {
        if self.core.latched.lock().is_some() {
            return true;
        }
        match self.core.operation() {
            Some(op) => op.facets().is_finished,
            None => true,
        }
    }

    /// Vote to run the task.
    ///
    /// A no-op when the task is already runnable or running. Fails with
    /// the appropriate terminal error once the task is over.
    pub fn resume(&self) -> Result<(), TaskError> {
        let op = self.upgrade()?;
        match op.state() {
            TaskState::Cancelled => Err(TaskError::Cancelled),
            TaskState::Completed => Err(TaskError::Completed),
            _ => op.request_state(&self.core, TaskState::Ready),
        }
    }

    /// Vote to pause the task.
    ///
    /// The task only suspends once every resume vote has been
    /// retracted; until then this merely withdraws this handle's
    /// support.
    pub fn suspend(&self) -> Result<(), TaskError> {
        let op = self.upgrade()?;
        match op.state() {
            TaskState::Cancelled => Err(TaskError::Cancelled),
            TaskState::Completed => Err(TaskError::Completed),
            _ => op.request_state(&self.core, TaskState::Suspended),
        }
    }

    /// Cancel the task for every subscriber. Cancellation overrides any
    /// standing resume votes.
    pub fn cancel(&self) -> Result<(), TaskError> {
        let op = self.upgrade()?;
        match op.state() {
            TaskState::Cancelled => Err(TaskError::Cancelled),
            TaskState::Completed => Err(TaskError::Completed),
            _ => op.request_state(&self.core, TaskState::Cancelled),
        }
    }

    /// Create another independent handle on the same task
    pub fn new_handle(&self) -> Result<DownloadHandle, TaskError> {
        let op = self.upgrade()?;
        match op.state() {
            TaskState::Cancelled => Err(TaskError::Cancelled),
            TaskState::Completed => Err(TaskError::Completed),
            _ => Ok(op.new_handle()),
        }
    }

    /// Install a progress observer for this handle. Progress events are
    /// produced only while at least one handle anywhere has an observer
    /// installed.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(TaskProgress) + Send + Sync + 'static,
    {
        let was_enabled = {
            let mut slot = self.core.progress.lock();
            let was = slot.is_some();
            *slot = Some(Arc::new(callback));
            was
        };
        if !was_enabled {
            if let Some(op) = self.core.operation() {
                op.adjust_progress_interest(true);
            }
        }
    }

    /// Remove this handle's progress observer
    pub fn clear_progress(&self) {
        let was_enabled = self.core.progress.lock().take().is_some();
        if was_enabled {
            if let Some(op) = self.core.operation() {
                op.adjust_progress_interest(false);
            }
        }
    }

    /// Install a state-change observer for this handle
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(TaskState) + Send + Sync + 'static,
    {
        let was_enabled = {
            let mut slot = self.core.on_state.lock();
            let was = slot.is_some();
            *slot = Some(Arc::new(callback));
            was
        };
        if !was_enabled {
            if let Some(op) = self.core.operation() {
                op.adjust_state_interest(true);
            }
        }
    }

    /// Remove this handle's state observer
    pub fn clear_state_change(&self) {
        let was_enabled = self.core.on_state.lock().take().is_some();
        if was_enabled {
            if let Some(op) = self.core.operation() {
                op.adjust_state_interest(false);
            }
        }
    }

    fn upgrade(&self) -> Result<Arc<Operation>, TaskError> {
        match self.core.operation() {
            Some(op) => Ok(op),
            None => {
                let latched = *self.core.latched.lock();
                match latched {
                    Some(TaskState::Completed) => Err(TaskError::Completed),
                    Some(TaskState::Cancelled) => Err(TaskError::Cancelled),
                    _ => Err(TaskError::TaskOver),
                }
            }
        }
    }
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}
