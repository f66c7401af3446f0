//! Transport abstraction
//!
//! The coordinator drives transfers through this trait and hears back
//! through [`TransportEvent`]s on a channel. Every method is synchronous
//! fire-and-forget so the coordinator never awaits while holding its
//! own locks; real transports spawn their work onto the runtime.

use std::path::PathBuf;

use crate::error::TransferError;
use crate::protocol::{ResumeToken, TaskProgress, TransferId, TransferRequest};

mod http;

pub use http::HttpTransport;

/// Reply callback for [`Transport::cancel_for_resume`]
pub type PauseReply = Box<dyn FnOnce(Option<ResumeToken>) + Send>;

/// Driver for the actual byte transfer.
///
/// Implementations assign a fresh [`TransferId`] per created transfer
/// and report lifecycle through the event channel handed to them at
/// construction.
pub trait Transport: Send + Sync {
    /// Register a new transfer. Does not start it.
    fn create(&self, request: TransferRequest) -> TransferId;

    /// Register a transfer continuing from previously captured resume
    /// state. Does not start it.
    fn create_with_resume_data(&self, request: TransferRequest, token: ResumeToken) -> TransferId;

    /// Begin (or continue) moving bytes for a created transfer
    fn start(&self, id: TransferId);

    /// Abort a transfer and discard its partial data
    fn cancel(&self, id: TransferId);

    /// Stop a transfer while capturing resumable state. The reply is
    /// invoked exactly once, with `None` when no state could be saved.
    fn cancel_for_resume(&self, id: TransferId, reply: PauseReply);
}

/// Events flowing from the transport back to the coordinator
#[derive(Debug)]
pub enum TransportEvent {
    /// Bytes moved for a running transfer
    Progress {
        id: TransferId,
        progress: TaskProgress,
    },
    /// Transfer finished; the payload is at `location`
    Finished { id: TransferId, location: PathBuf },
    /// Transfer terminated with an error
    Failed {
        id: TransferId,
        error: TransferError,
    },
}
