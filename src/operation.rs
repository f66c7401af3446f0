//! Vote-arbitrating download operation
//!
//! One [`Operation`] owns one transport transfer and fans its lifecycle
//! out to any number of handles. Handles do not command the operation;
//! they vote. The operation counts standing resume and suspend votes
//! and derives its effective state from the tally, with cancellation
//! overriding both.
//!
//! Locking discipline: all mutation happens under the single `inner`
//! mutex, side effects are collected as [`Action`]s and executed only
//! after the lock is released. Nothing here ever awaits.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::TaskError;
use crate::handle::{DownloadHandle, HandleCore};
use crate::protocol::{
    ProgressCallback, ResumeToken, StateCallback, TaskProgress, TaskState, TransferId,
    TransferOutcome, TransferRequest,
};
use crate::queue::QueuePermit;
use crate::transport::Transport;

/// Container-side hooks invoked when an operation changes state.
///
/// Called without any operation lock held. Implementations may call
/// back into the operation.
pub(crate) trait OperationDelegate: Send + Sync {
    /// The effective state changed
    fn operation_state_changed(&self, op: &Arc<Operation>, state: TaskState);
    /// A queued operation became eligible for dispatch
    fn operation_became_ready(&self, op: &Arc<Operation>);
    /// The operation left the runnable set and should be parked
    fn move_to_waiting(&self, op: &Arc<Operation>);
    /// A started operation was resumed and needs a replacement transfer
    fn resubmit(&self, op: &Arc<Operation>);
}

struct HandleEntry {
    core: Arc<HandleCore>,
    /// Last standing vote from this handle, if any
    vote: Option<TaskState>,
}

struct OpInner {
    state: TaskState,
    /// True once the transport has ever moved bytes for this operation
    started: bool,
    /// True while an entry for this operation sits in the dispatch queue
    in_queue: bool,
    /// True while a resumable pause is in flight at the transport
    pause_pending: bool,
    resume_count: i32,
    suspend_count: i32,
    progress_interest: usize,
    state_interest: usize,
    handles: Vec<HandleEntry>,
    handle_seq: u64,
    resume_token: Option<ResumeToken>,
    outcome: Option<TransferOutcome>,
    permit: Option<QueuePermit>,
}

/// Deferred side effect, executed after the inner lock is released
enum Action {
    NotifyState(StateCallback, TaskState),
    StateChanged(TaskState),
    BecameReady,
    MoveToWaiting,
    Resubmit,
    TransportStart,
    TransportCancel,
    TransportPause,
}

/// Derived execution facets of one operation; see [`Operation::facets`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OperationFacets {
    pub is_ready: bool,
    pub is_executing: bool,
    pub is_cancelled: bool,
    pub is_finished: bool,
}

/// One transfer plus the vote ledger of its handles
pub(crate) struct Operation {
    transfer_id: TransferId,
    request: TransferRequest,
    transport: Arc<dyn Transport>,
    delegate: Mutex<Weak<dyn OperationDelegate>>,
    inner: Mutex<OpInner>,
}

impl Operation {
    pub(crate) fn new(
        transfer_id: TransferId,
        request: TransferRequest,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transfer_id,
            request,
            transport,
            delegate: Mutex::new(Weak::<NullDelegate>::new() as Weak<dyn OperationDelegate>),
            inner: Mutex::new(OpInner {
                state: TaskState::Suspended,
                started: false,
                in_queue: false,
                pause_pending: false,
                resume_count: 0,
                suspend_count: 0,
                progress_interest: 0,
                state_interest: 0,
                handles: Vec::new(),
                handle_seq: 0,
                resume_token: None,
                outcome: None,
                permit: None,
            }),
        })
    }

    pub(crate) fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    pub(crate) fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub(crate) fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub(crate) fn outcome(&self) -> Option<TransferOutcome> {
        self.inner.lock().outcome.clone()
    }

    pub(crate) fn has_started(&self) -> bool {
        self.inner.lock().started
    }

    pub(crate) fn take_resume_token(&self) -> Option<ResumeToken> {
        self.inner.lock().resume_token.take()
    }

    pub(crate) fn set_delegate(&self, delegate: Weak<dyn OperationDelegate>) {
        *self.delegate.lock() = delegate;
    }

    /// Mark this operation as sitting in the dispatch queue
    pub(crate) fn mark_queued(&self) {
        self.inner.lock().in_queue = true;
    }

    pub(crate) fn is_progress_monitor_enabled(&self) -> bool {
        self.inner.lock().progress_interest > 0
    }

    pub(crate) fn is_state_monitor_enabled(&self) -> bool {
        self.inner.lock().state_interest > 0
    }

    /// The four queue-facing facets, derived from (state, started) on
    /// every read. A started operation that got paused is finished from
    /// the transport's point of view even though the task lives on
    /// through a replacement.
    pub(crate) fn facets(&self) -> OperationFacets {
        let inner = self.inner.lock();
        OperationFacets {
            is_ready: inner.state == TaskState::Ready,
            is_executing: inner.state == TaskState::Running,
            is_cancelled: inner.state == TaskState::Cancelled,
            is_finished: inner.state.is_terminal()
                || (inner.state == TaskState::Suspended && inner.started),
        }
    }

    /// Attach a fresh handle. Handle ids are `"{transfer}-{seq}"`.
    pub(crate) fn new_handle(self: &Arc<Self>) -> DownloadHandle {
        let mut inner = self.inner.lock();
        let id = format!("{}-{}", self.transfer_id, inner.handle_seq);
        inner.handle_seq += 1;
        let core = Arc::new(HandleCore::new(id, Arc::downgrade(self)));
        inner.handles.push(HandleEntry {
            core: Arc::clone(&core),
            vote: None,
        });
        DownloadHandle::from_core(core)
    }

    /// Record one handle's vote for a target state and re-arbitrate.
    ///
    /// Votes are idempotent per handle: re-voting the same state is a
    /// no-op, voting a different state first retracts the previous one.
    pub(crate) fn request_state(
        self: &Arc<Self>,
        handle: &Arc<HandleCore>,
        to: TaskState,
    ) -> Result<(), TaskError> {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();

            if inner.state == TaskState::Completed {
                return Err(TaskError::Completed);
            }
            if matches!(to, TaskState::Running | TaskState::Completed) {
                return Err(TaskError::UnsupportedTransition(to));
            }

            let idx = inner
                .handles
                .iter()
                .position(|e| Arc::ptr_eq(&e.core, handle))
                .ok_or(TaskError::TaskOver)?;

            let prev = inner.handles[idx].vote;
            if prev == Some(to) {
                return Ok(());
            }

            match prev {
                Some(TaskState::Ready) => inner.resume_count -= 1,
                Some(TaskState::Suspended) => inner.suspend_count -= 1,
                _ => {}
            }
            match to {
                TaskState::Ready => inner.resume_count += 1,
                TaskState::Suspended => inner.suspend_count += 1,
                _ => {}
            }
            inner.handles[idx].vote = Some(to);

            // Votes still land in the ledger after cancellation, but
            // nothing re-arbitrates a cancelled operation.
            if inner.state == TaskState::Cancelled {
                return Ok(());
            }

            if to == TaskState::Cancelled {
                inner.pause_pending = false;
                self.apply_state(&mut inner, TaskState::Cancelled, &mut actions);
            } else if !inner.pause_pending {
                let net = self.net_state(&inner);
                // Running already satisfies a net-Ready tally
                let satisfied = net == inner.state
                    || (net == TaskState::Ready && inner.state == TaskState::Running);
                if !satisfied {
                    if net == TaskState::Suspended && inner.state == TaskState::Running {
                        inner.pause_pending = true;
                        actions.push(Action::TransportPause);
                    } else {
                        self.apply_state(&mut inner, net, &mut actions);
                    }
                }
            }
            // With a pause in flight the tally is re-read when the
            // transport replies; see pause_did_complete.
        }
        self.run_actions(actions);
        Ok(())
    }

    /// Dispatch callback from the queue: the operation won a slot
    pub(crate) fn execute(self: &Arc<Self>, permit: QueuePermit) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.in_queue = false;
            if inner.state != TaskState::Ready {
                // Permit drops here and frees the slot
                return;
            }
            inner.started = true;
            inner.permit = Some(permit);
            self.apply_state(&mut inner, TaskState::Running, &mut actions);
            actions.push(Action::TransportStart);
        }
        self.run_actions(actions);
    }

    /// Terminal result arrived from the transport
    pub(crate) fn finish(self: &Arc<Self>, outcome: TransferOutcome) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.outcome = Some(outcome);
            inner.pause_pending = false;
            self.apply_state(&mut inner, TaskState::Completed, &mut actions);
        }
        self.run_actions(actions);
    }

    /// The transport finished a resumable pause. Re-arbitrate against
    /// whatever the vote tally says now; handles may have voted again
    /// while the pause was in flight.
    pub(crate) fn pause_did_complete(self: &Arc<Self>, token: Option<ResumeToken>) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            if !inner.pause_pending {
                return;
            }
            inner.pause_pending = false;
            if inner.state.is_terminal() {
                return;
            }
            inner.resume_token = token;
            match self.net_state(&inner) {
                TaskState::Suspended => {
                    self.apply_state(&mut inner, TaskState::Suspended, &mut actions);
                }
                TaskState::Ready => {
                    // Resumed while pausing: pass through Suspended so
                    // the Ready application takes the replacement path.
                    self.apply_state(&mut inner, TaskState::Suspended, &mut actions);
                    self.apply_state(&mut inner, TaskState::Ready, &mut actions);
                }
                _ => {
                    self.apply_state(&mut inner, TaskState::Cancelled, &mut actions);
                }
            }
        }
        self.run_actions(actions);
    }

    /// Move handles, votes and observer interest from `self` into a
    /// freshly created successor operation. The successor must not have
    /// handles of its own yet. Handle cores are repointed so existing
    /// [`DownloadHandle`]s transparently follow.
    pub(crate) fn migrate_into(&self, successor: &Arc<Operation>) {
        let (handles, resume, suspend, progress_interest, state_interest, seq) = {
            let mut inner = self.inner.lock();
            let handles = std::mem::take(&mut inner.handles);
            let resume = std::mem::replace(&mut inner.resume_count, 0);
            let suspend = std::mem::replace(&mut inner.suspend_count, 0);
            let progress = std::mem::replace(&mut inner.progress_interest, 0);
            let state = std::mem::replace(&mut inner.state_interest, 0);
            (handles, resume, suspend, progress, state, inner.handle_seq)
        };

        for entry in &handles {
            entry.core.repoint(Arc::downgrade(successor));
        }

        let mut inner = successor.inner.lock();
        inner.handles = handles;
        inner.resume_count = resume;
        inner.suspend_count = suspend;
        inner.progress_interest = progress_interest;
        inner.state_interest = state_interest;
        inner.handle_seq = seq;
        // The successor starts out voted-runnable; no fan-out, the
        // handles already saw the resume they asked for.
        inner.state = TaskState::Ready;
    }

    /// Fan a progress event out to interested handles
    pub(crate) fn notify_progress(&self, progress: TaskProgress) {
        let callbacks: Vec<ProgressCallback> = {
            let inner = self.inner.lock();
            inner
                .handles
                .iter()
                .filter_map(|e| e.core.progress_callback())
                .collect()
        };
        for cb in callbacks {
            cb(progress);
        }
    }

    pub(crate) fn adjust_progress_interest(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        if enabled {
            inner.progress_interest += 1;
        } else {
            inner.progress_interest = inner.progress_interest.saturating_sub(1);
        }
    }

    pub(crate) fn adjust_state_interest(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        if enabled {
            inner.state_interest += 1;
        } else {
            inner.state_interest = inner.state_interest.saturating_sub(1);
        }
    }

    fn net_state(&self, inner: &OpInner) -> TaskState {
        if inner.resume_count > 0 {
            TaskState::Ready
        } else if inner.suspend_count > 0 {
            TaskState::Suspended
        } else {
            TaskState::Cancelled
        }
    }

    /// Transition the effective state and collect the side effects.
    /// Must be called with the inner lock held.
    fn apply_state(&self, inner: &mut OpInner, new: TaskState, actions: &mut Vec<Action>) {
        let old = inner.state;
        if old == new {
            return;
        }
        inner.state = new;
        debug!(transfer = %self.transfer_id, from = %old, to = %new, "state transition");

        // A started operation leaving Suspended for Ready cannot reuse
        // its transport transfer; the container builds a replacement
        // from the resume token instead. The handles keep their view of
        // the transition, the container never hears it as a plain
        // state change.
        if new == TaskState::Ready && inner.started && old == TaskState::Suspended {
            self.fan_out(inner, new, actions);
            actions.push(Action::Resubmit);
            return;
        }

        self.fan_out(inner, new, actions);
        actions.push(Action::StateChanged(new));

        match new {
            TaskState::Ready => {
                if inner.in_queue {
                    actions.push(Action::BecameReady);
                } else {
                    actions.push(Action::Resubmit);
                }
            }
            TaskState::Suspended => {
                inner.permit = None;
                inner.in_queue = false;
                actions.push(Action::MoveToWaiting);
            }
            TaskState::Cancelled => {
                inner.permit = None;
                actions.push(Action::TransportCancel);
            }
            TaskState::Completed => {
                inner.permit = None;
            }
            TaskState::Running => {}
        }
    }

    /// Deliver a state change to every attached handle, skipping the
    /// handle whose own standing vote is the other non-terminal member
    /// of the {Suspended, Cancelled} pair. A handle that asked to
    /// suspend does not hear that someone else cancelled, and vice
    /// versa; terminal latching still happens regardless.
    fn fan_out(&self, inner: &mut OpInner, new: TaskState, actions: &mut Vec<Action>) {
        for entry in &inner.handles {
            if new.is_terminal() {
                entry.core.latch(new);
                if let Some(outcome) = &inner.outcome {
                    entry.core.latch_outcome(outcome.clone());
                }
            }
            // No handle is listening; skip the callback bookkeeping
            if inner.state_interest == 0 {
                continue;
            }
            let suppressed = matches!(new, TaskState::Suspended | TaskState::Cancelled)
                && matches!(
                    entry.vote,
                    Some(v @ (TaskState::Suspended | TaskState::Cancelled)) if v != new
                );
            if suppressed {
                continue;
            }
            if let Some(cb) = entry.core.state_callback() {
                actions.push(Action::NotifyState(cb, new));
            }
        }
    }

    fn run_actions(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::NotifyState(cb, state) => cb(state),
                Action::StateChanged(state) => {
                    if let Some(delegate) = self.delegate() {
                        delegate.operation_state_changed(self, state);
                    }
                }
                Action::BecameReady => {
                    if let Some(delegate) = self.delegate() {
                        delegate.operation_became_ready(self);
                    }
                }
                Action::MoveToWaiting => {
                    if let Some(delegate) = self.delegate() {
                        delegate.move_to_waiting(self);
                    }
                }
                Action::Resubmit => {
                    if let Some(delegate) = self.delegate() {
                        delegate.resubmit(self);
                    }
                }
                Action::TransportStart => self.transport.start(self.transfer_id),
                Action::TransportCancel => self.transport.cancel(self.transfer_id),
                Action::TransportPause => {
                    let op = Arc::clone(self);
                    self.transport.cancel_for_resume(
                        self.transfer_id,
                        Box::new(move |token| op.pause_did_complete(token)),
                    );
                }
            }
        }
    }

    fn delegate(&self) -> Option<Arc<dyn OperationDelegate>> {
        let guard = self.delegate.lock();
        guard.upgrade()
    }
}

struct NullDelegate;

impl OperationDelegate for NullDelegate {
    fn operation_state_changed(&self, _op: &Arc<Operation>, _state: TaskState) {}
    fn operation_became_ready(&self, _op: &Arc<Operation>) {}
    fn move_to_waiting(&self, _op: &Arc<Operation>) {}
    fn resubmit(&self, _op: &Arc<Operation>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TransferRequest;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubTransport {
        started: PlMutex<Vec<TransferId>>,
        cancelled: PlMutex<Vec<TransferId>>,
        pause_replies: PlMutex<Vec<crate::transport::PauseReply>>,
        next_id: AtomicUsize,
    }

    impl StubTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: PlMutex::new(Vec::new()),
                cancelled: PlMutex::new(Vec::new()),
                pause_replies: PlMutex::new(Vec::new()),
                next_id: AtomicUsize::new(1),
            })
        }

        fn complete_pause(&self, token: Option<ResumeToken>) {
            let reply = self.pause_replies.lock().pop().unwrap();
            reply(token);
        }
    }

    impl Transport for StubTransport {
        fn create(&self, _request: TransferRequest) -> TransferId {
            TransferId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst) as u64)
        }
        fn create_with_resume_data(
            &self,
            _request: TransferRequest,
            _token: ResumeToken,
        ) -> TransferId {
            TransferId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst) as u64)
        }
        fn start(&self, id: TransferId) {
            self.started.lock().push(id);
        }
        fn cancel(&self, id: TransferId) {
            self.cancelled.lock().push(id);
        }
        fn cancel_for_resume(&self, _id: TransferId, reply: crate::transport::PauseReply) {
            self.pause_replies.lock().push(reply);
        }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        states: PlMutex<Vec<TaskState>>,
        resubmits: AtomicUsize,
        waiting_moves: AtomicUsize,
        ready_events: AtomicUsize,
    }

    impl OperationDelegate for RecordingDelegate {
        fn operation_state_changed(&self, _op: &Arc<Operation>, state: TaskState) {
            self.states.lock().push(state);
        }
        fn operation_became_ready(&self, _op: &Arc<Operation>) {
            self.ready_events.fetch_add(1, Ordering::SeqCst);
        }
        fn move_to_waiting(&self, _op: &Arc<Operation>) {
            self.waiting_moves.fetch_add(1, Ordering::SeqCst);
        }
        fn resubmit(&self, _op: &Arc<Operation>) {
            self.resubmits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn make_op(transport: &Arc<StubTransport>) -> (Arc<Operation>, Arc<RecordingDelegate>) {
        let request = TransferRequest::parse("https://example.com/file.bin").unwrap();
        let id = transport.create(request.clone());
        let op = Operation::new(id, request, Arc::clone(transport) as Arc<dyn Transport>);
        let delegate = Arc::new(RecordingDelegate::default());
        op.set_delegate(Arc::downgrade(&delegate) as Weak<dyn OperationDelegate>);
        (op, delegate)
    }

    fn core_of(handle: &DownloadHandle) -> Arc<HandleCore> {
        handle.core_for_tests()
    }

    #[test]
    fn single_resume_vote_makes_ready() {
        let transport = StubTransport::new();
        let (op, delegate) = make_op(&transport);
        op.mark_queued();
        let h = op.new_handle();

        op.request_state(&core_of(&h), TaskState::Ready).unwrap();
        assert_eq!(op.state(), TaskState::Ready);
        assert_eq!(delegate.ready_events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn votes_are_idempotent_per_handle() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        op.mark_queued();
        let h = op.new_handle();
        let core = core_of(&h);

        op.request_state(&core, TaskState::Ready).unwrap();
        op.request_state(&core, TaskState::Ready).unwrap();
        op.request_state(&core, TaskState::Ready).unwrap();
        {
            let inner = op.inner.lock();
            assert_eq!(inner.resume_count, 1);
        }

        op.request_state(&core, TaskState::Suspended).unwrap();
        {
            let inner = op.inner.lock();
            assert_eq!(inner.resume_count, 0);
            assert_eq!(inner.suspend_count, 1);
        }
    }

    #[test]
    fn one_resume_vote_outweighs_suspends() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        op.mark_queued();
        let h1 = op.new_handle();
        let h2 = op.new_handle();
        let h3 = op.new_handle();

        op.request_state(&core_of(&h1), TaskState::Suspended)
            .unwrap();
        op.request_state(&core_of(&h2), TaskState::Suspended)
            .unwrap();
        assert_eq!(op.state(), TaskState::Suspended);

        op.request_state(&core_of(&h3), TaskState::Ready).unwrap();
        assert_eq!(op.state(), TaskState::Ready);
    }

    #[test]
    fn cancel_overrides_resume_votes() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        op.mark_queued();
        let h1 = op.new_handle();
        let h2 = op.new_handle();

        op.request_state(&core_of(&h1), TaskState::Ready).unwrap();
        op.request_state(&core_of(&h2), TaskState::Cancelled)
            .unwrap();
        assert_eq!(op.state(), TaskState::Cancelled);
        assert_eq!(transport.cancelled.lock().len(), 1);
    }

    #[test]
    fn terminal_state_is_immutable() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        op.mark_queued();
        let h1 = op.new_handle();
        let h2 = op.new_handle();

        op.request_state(&core_of(&h1), TaskState::Cancelled)
            .unwrap();
        assert_eq!(op.state(), TaskState::Cancelled);

        // Later votes land in the ledger but never resurrect the task
        op.request_state(&core_of(&h2), TaskState::Ready).unwrap();
        assert_eq!(op.state(), TaskState::Cancelled);

        op.finish(Err(crate::error::TransferError::Cancelled));
        assert_eq!(op.state(), TaskState::Cancelled);
        assert!(op.outcome().is_none());
    }

    #[test]
    fn completed_rejects_further_votes() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        op.mark_queued();
        let h = op.new_handle();

        op.finish(Ok(crate::protocol::DownloadSuccess {
            location: "out.bin".into(),
        }));
        assert_eq!(op.state(), TaskState::Completed);

        let err = op.request_state(&core_of(&h), TaskState::Ready).unwrap_err();
        assert_eq!(err, TaskError::Completed);
    }

    #[test]
    fn running_and_completed_cannot_be_requested() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        let h = op.new_handle();

        assert_eq!(
            op.request_state(&core_of(&h), TaskState::Running),
            Err(TaskError::UnsupportedTransition(TaskState::Running))
        );
        assert_eq!(
            op.request_state(&core_of(&h), TaskState::Completed),
            Err(TaskError::UnsupportedTransition(TaskState::Completed))
        );
    }

    #[test]
    fn suspending_a_running_operation_defers_to_transport() {
        let transport = StubTransport::new();
        let (op, delegate) = make_op(&transport);
        op.mark_queued();
        let h = op.new_handle();
        let core = core_of(&h);

        op.request_state(&core, TaskState::Ready).unwrap();
        // Simulate dispatch without a real queue
        {
            let mut inner = op.inner.lock();
            inner.in_queue = false;
            inner.started = true;
            inner.state = TaskState::Running;
        }

        op.request_state(&core, TaskState::Suspended).unwrap();
        // Still Running until the transport confirms the pause
        assert_eq!(op.state(), TaskState::Running);
        assert_eq!(transport.pause_replies.lock().len(), 1);

        transport.complete_pause(Some(ResumeToken::from_bytes(b"T1".to_vec())));
        assert_eq!(op.state(), TaskState::Suspended);
        assert_eq!(delegate.waiting_moves.load(Ordering::SeqCst), 1);
        assert_eq!(op.take_resume_token().unwrap().as_bytes(), b"T1");
        // Paused after starting: the transport task is spent
        assert!(op.facets().is_finished);
        assert!(!op.facets().is_executing);
    }

    #[test]
    fn resume_during_pending_pause_triggers_resubmit() {
        let transport = StubTransport::new();
        let (op, delegate) = make_op(&transport);
        op.mark_queued();
        let h1 = op.new_handle();
        let h2 = op.new_handle();

        op.request_state(&core_of(&h1), TaskState::Ready).unwrap();
        {
            let mut inner = op.inner.lock();
            inner.in_queue = false;
            inner.started = true;
            inner.state = TaskState::Running;
        }

        op.request_state(&core_of(&h1), TaskState::Suspended)
            .unwrap();
        assert_eq!(op.state(), TaskState::Running);

        // Second handle resumes while the pause is still in flight
        op.request_state(&core_of(&h2), TaskState::Ready).unwrap();
        assert_eq!(op.state(), TaskState::Running);

        transport.complete_pause(Some(ResumeToken::from_bytes(b"tok".to_vec())));
        assert_eq!(op.state(), TaskState::Ready);
        assert_eq!(delegate.resubmits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_during_pending_pause_wins() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        op.mark_queued();
        let h = op.new_handle();
        let core = core_of(&h);

        op.request_state(&core, TaskState::Ready).unwrap();
        {
            let mut inner = op.inner.lock();
            inner.in_queue = false;
            inner.started = true;
            inner.state = TaskState::Running;
        }
        op.request_state(&core, TaskState::Suspended).unwrap();
        op.request_state(&core, TaskState::Cancelled).unwrap();
        assert_eq!(op.state(), TaskState::Cancelled);

        // Late pause reply must not resurrect the operation
        transport.complete_pause(Some(ResumeToken::from_bytes(b"late".to_vec())));
        assert_eq!(op.state(), TaskState::Cancelled);
    }

    #[test]
    fn suppression_hides_cancel_from_suspend_voter() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        op.mark_queued();
        let h1 = op.new_handle();
        let h2 = op.new_handle();

        let h1_states: Arc<PlMutex<Vec<TaskState>>> = Arc::new(PlMutex::new(Vec::new()));
        let h2_states: Arc<PlMutex<Vec<TaskState>>> = Arc::new(PlMutex::new(Vec::new()));
        {
            let sink = Arc::clone(&h1_states);
            h1.on_state_change(move |s| sink.lock().push(s));
        }
        {
            let sink = Arc::clone(&h2_states);
            h2.on_state_change(move |s| sink.lock().push(s));
        }

        op.request_state(&core_of(&h1), TaskState::Suspended)
            .unwrap();
        op.request_state(&core_of(&h2), TaskState::Cancelled)
            .unwrap();

        // h1 asked to suspend; it does not hear the cancellation
        assert!(!h1_states.lock().contains(&TaskState::Cancelled));
        // h2 asked for it; it does
        assert!(h2_states.lock().contains(&TaskState::Cancelled));
        // but h1's view still reports the latched terminal state
        assert_eq!(h1.state(), TaskState::Cancelled);
    }

    #[test]
    fn migration_carries_handles_and_votes() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        op.mark_queued();
        let h1 = op.new_handle();
        let h2 = op.new_handle();
        op.request_state(&core_of(&h1), TaskState::Ready).unwrap();
        op.request_state(&core_of(&h2), TaskState::Ready).unwrap();

        let request = op.request().clone();
        let new_id = transport.create(request.clone());
        let successor = Operation::new(new_id, request, Arc::clone(&transport) as Arc<dyn Transport>);
        op.migrate_into(&successor);

        assert_eq!(successor.state(), TaskState::Ready);
        {
            let inner = successor.inner.lock();
            assert_eq!(inner.handles.len(), 2);
            assert_eq!(inner.resume_count, 2);
        }
        // Handles now observe the successor
        assert_eq!(h1.state(), TaskState::Ready);
        // And their ids survive the move
        assert_eq!(h1.id(), format!("{}-0", op.transfer_id()));

        // New votes arbitrate on the successor, not the old operation
        successor
            .request_state(&core_of(&h1), TaskState::Suspended)
            .unwrap();
        {
            let inner = successor.inner.lock();
            assert_eq!(inner.resume_count, 1);
            assert_eq!(inner.suspend_count, 1);
        }
    }

    #[test]
    fn handle_ids_are_sequential() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        let h0 = op.new_handle();
        let h1 = op.new_handle();
        assert_eq!(h0.id(), format!("{}-0", op.transfer_id()));
        assert_eq!(h1.id(), format!("{}-1", op.transfer_id()));
    }

    #[test]
    fn state_interest_counts_across_handles() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        let h1 = op.new_handle();
        let h2 = op.new_handle();

        assert!(!op.is_state_monitor_enabled());
        h1.on_state_change(|_| {});
        assert!(op.is_state_monitor_enabled());
        h2.on_state_change(|_| {});
        h1.clear_state_change();
        assert!(op.is_state_monitor_enabled());
        h2.clear_state_change();
        assert!(!op.is_state_monitor_enabled());
    }

    #[test]
    fn terminal_latch_survives_gated_fan_out() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        op.mark_queued();
        let h = op.new_handle();

        // No state observer anywhere, so fan-out has nothing to notify,
        // but the terminal state must still latch on the handle
        assert!(!op.is_state_monitor_enabled());
        op.request_state(&core_of(&h), TaskState::Cancelled).unwrap();
        assert_eq!(h.state(), TaskState::Cancelled);
    }

    #[test]
    fn progress_interest_counts_across_handles() {
        let transport = StubTransport::new();
        let (op, _delegate) = make_op(&transport);
        let h1 = op.new_handle();
        let h2 = op.new_handle();

        assert!(!op.is_progress_monitor_enabled());
        h1.on_progress(|_| {});
        assert!(op.is_progress_monitor_enabled());
        h2.on_progress(|_| {});
        h1.clear_progress();
        assert!(op.is_progress_monitor_enabled());
        h2.clear_progress();
        assert!(!op.is_progress_monitor_enabled());
    }
}
