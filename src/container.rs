//! Download container
//!
//! A container owns one transport, one dispatch queue and the tables of
//! live operations. It bridges transport events back onto operations
//! and, as the operations' delegate, moves them between the running and
//! waiting tables as their state changes. Resuming a started, paused
//! operation builds a replacement transfer from the captured resume
//! token and migrates the handles over.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ContainerConfig;
use crate::error::ServiceError;
use crate::handle::DownloadHandle;
use crate::operation::{Operation, OperationDelegate};
use crate::protocol::{DownloadSuccess, TaskState, TransferId, TransferRequest};
use crate::queue::DispatchQueue;
use crate::transport::{HttpTransport, Transport, TransportEvent};

struct Tables {
    running: HashMap<TransferId, Arc<Operation>>,
    waiting: HashMap<TransferId, Arc<Operation>>,
}

struct ContainerInner {
    name: Option<String>,
    self_ref: Weak<ContainerInner>,
    transport: Arc<dyn Transport>,
    queue: Arc<DispatchQueue>,
    tables: Mutex<Tables>,
    shutdown: CancellationToken,
}

/// Queue plus transport for a group of download tasks
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    /// Create a container backed by the HTTP transport
    pub fn new(config: ContainerConfig) -> Result<Self, ServiceError> {
        Self::with_transport(config, |events, cfg| {
            Ok(Arc::new(HttpTransport::new(cfg, events)?) as Arc<dyn Transport>)
        })
    }

    /// Create a container with a caller-supplied transport. The factory
    /// receives the event channel the container listens on.
    pub fn with_transport<F>(config: ContainerConfig, factory: F) -> Result<Self, ServiceError>
    where
        F: FnOnce(
            UnboundedSender<TransportEvent>,
            &ContainerConfig,
        ) -> Result<Arc<dyn Transport>, ServiceError>,
    {
        Self::build(None, config, factory)
    }

    pub(crate) fn named(name: &str, config: ContainerConfig) -> Result<Self, ServiceError> {
        Self::build(Some(name.to_string()), config, |events, cfg| {
            Ok(Arc::new(HttpTransport::new(cfg, events)?) as Arc<dyn Transport>)
        })
    }

    fn build<F>(
        name: Option<String>,
        config: ContainerConfig,
        factory: F,
    ) -> Result<Self, ServiceError>
    where
        F: FnOnce(
            UnboundedSender<TransportEvent>,
            &ContainerConfig,
        ) -> Result<Arc<dyn Transport>, ServiceError>,
    {
        config.validate()?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = factory(tx, &config)?;
        let shutdown = CancellationToken::new();

        let inner = Arc::new_cyclic(|self_ref| ContainerInner {
            name,
            self_ref: self_ref.clone(),
            transport,
            queue: Arc::new(DispatchQueue::new(config.max_concurrent_transfers)),
            tables: Mutex::new(Tables {
                running: HashMap::new(),
                waiting: HashMap::new(),
            }),
            shutdown,
        });

        // Event pump: transport events onto operations until shutdown
        let pump_ref = Arc::downgrade(&inner);
        let pump_shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        let Some(container) = pump_ref.upgrade() else { break };
                        container.dispatch(event);
                    }
                    _ = pump_shutdown.cancelled() => break,
                }
            }
        });

        Ok(Self { inner })
    }

    /// Container name, `None` for the service default
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Register a download. The task starts out suspended; every
    /// returned or derived handle must vote before anything runs.
    pub fn add_download_task(&self, url: &str) -> Result<DownloadHandle, ServiceError> {
        let request = TransferRequest::parse(url)?;
        let transfer_id = self.inner.transport.create(request.clone());
        let op = Operation::new(transfer_id, request, Arc::clone(&self.inner.transport));
        op.set_delegate(self.inner.self_ref.clone() as Weak<dyn OperationDelegate>);
        debug!(container = ?self.inner.name, transfer = %transfer_id, url, "task added");
        self.inner.enqueue(&op, false);
        Ok(op.new_handle())
    }

    /// Register a download and immediately vote it runnable through the
    /// returned handle
    pub fn add_download_task_and_resume(&self, url: &str) -> Result<DownloadHandle, ServiceError> {
        let handle = self.add_download_task(url)?;
        // Cannot fail: the operation was created a moment ago
        let _ = handle.resume();
        Ok(handle)
    }

    /// Number of transfers currently executing
    pub fn running_count(&self) -> usize {
        self.inner.tables.lock().running.len()
    }

    /// Number of transfers parked in the waiting table
    pub fn waiting_count(&self) -> usize {
        self.inner.tables.lock().waiting.len()
    }

    /// Stop the event pump and drop every tracked operation
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.queue.clear();
        let mut tables = self.inner.tables.lock();
        tables.running.clear();
        tables.waiting.clear();
    }
}

impl ContainerInner {
    fn dispatch(&self, event: TransportEvent) {
        match event {
            TransportEvent::Progress { id, progress } => {
                let op = {
                    let tables = self.tables.lock();
                    tables.running.get(&id).cloned()
                };
                match op {
                    Some(op) => {
                        if op.is_progress_monitor_enabled() {
                            op.notify_progress(progress);
                        }
                    }
                    None => trace!(transfer = %id, "progress for unknown transfer"),
                }
            }
            TransportEvent::Finished { id, location } => {
                if let Some(op) = self.tracked_operation(id) {
                    op.finish(Ok(DownloadSuccess { location }));
                } else {
                    warn!(transfer = %id, "finish for unknown transfer");
                }
            }
            TransportEvent::Failed { id, error } => {
                if let Some(op) = self.tracked_operation(id) {
                    op.finish(Err(error));
                } else {
                    warn!(transfer = %id, ?error, "failure for unknown transfer");
                }
            }
        }
    }

    fn tracked_operation(&self, id: TransferId) -> Option<Arc<Operation>> {
        let tables = self.tables.lock();
        tables
            .running
            .get(&id)
            .or_else(|| tables.waiting.get(&id))
            .cloned()
    }

    /// Put an operation in the dispatch queue and spawn its waiter
    fn enqueue(&self, op: &Arc<Operation>, ready: bool) {
        let id = op.transfer_id();
        op.mark_queued();
        self.queue.submit(id, ready);

        let queue = Arc::clone(&self.queue);
        let op = Arc::clone(op);
        tokio::spawn(async move {
            if let Some(permit) = queue.acquire(id).await {
                op.execute(permit);
            }
        });
    }
}

impl OperationDelegate for ContainerInner {
    fn operation_state_changed(&self, op: &Arc<Operation>, state: TaskState) {
        let id = op.transfer_id();
        let mut tables = self.tables.lock();
        match state {
            TaskState::Running => {
                tables.waiting.remove(&id);
                tables.running.insert(id, Arc::clone(op));
            }
            TaskState::Suspended => {
                tables.running.remove(&id);
            }
            TaskState::Cancelled | TaskState::Completed => {
                tables.running.remove(&id);
                tables.waiting.remove(&id);
                drop(tables);
                self.queue.remove(id);
            }
            TaskState::Ready => {}
        }
    }

    fn operation_became_ready(&self, op: &Arc<Operation>) {
        self.queue.mark_ready(op.transfer_id());
    }

    fn move_to_waiting(&self, op: &Arc<Operation>) {
        let id = op.transfer_id();
        self.queue.remove(id);
        let mut tables = self.tables.lock();
        tables.waiting.insert(id, Arc::clone(op));
    }

    fn resubmit(&self, op: &Arc<Operation>) {
        let id = op.transfer_id();
        {
            let mut tables = self.tables.lock();
            tables.waiting.remove(&id);
        }

        if !op.has_started() {
            // Never ran; the original transfer is still usable
            self.enqueue(op, true);
            return;
        }

        // A started transfer cannot be restarted in place. Build a
        // replacement from the resume token (or from scratch when the
        // pause produced none) and move the handles over.
        let request = op.request().clone();
        let new_id = match op.take_resume_token() {
            Some(token) => self.transport.create_with_resume_data(request.clone(), token),
            None => self.transport.create(request.clone()),
        };
        let successor = Operation::new(new_id, request, Arc::clone(&self.transport));
        successor.set_delegate(self.self_ref.clone() as Weak<dyn OperationDelegate>);
        op.migrate_into(&successor);
        debug!(old = %id, new = %new_id, "replaced paused transfer");
        self.enqueue(&successor, true);
    }
}

impl Drop for ContainerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
