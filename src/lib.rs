//! # hydra-dl
//!
//! A download task coordinator where one transfer serves many
//! independent subscribers. Every subscriber holds its own
//! [`DownloadHandle`] with its own progress and state observers, and
//! the shared task runs whenever at least one handle wants it running:
//! handles vote, the coordinator arbitrates, and cancellation from any
//! handle overrides everything else.
//!
//! ```no_run
//! use hydra_dl::DownloadService;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let service = DownloadService::new()?;
//! let handle = service.add_download_task_and_resume(
//!     "https://example.com/large-file.bin",
//!     None,
//! )?;
//! handle.on_progress(|p| println!("{:.1}%", p.percentage()));
//!
//! // A second, independent subscriber to the same transfer
//! let other = handle.new_handle()?;
//! other.suspend()?; // only a vote; the first handle keeps it running
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`DownloadService`]: registry of named [`Container`]s plus a
//!   default one
//! - [`Container`]: concurrency-limited queue and transport for a group
//!   of tasks
//! - [`DownloadHandle`]: one subscriber's voting, observing view of a
//!   shared task
//! - [`Transport`]: pluggable byte-moving layer; [`HttpTransport`] is
//!   the built-in implementation

mod config;
mod container;
mod error;
mod handle;
mod operation;
mod protocol;
mod queue;
mod service;
mod transport;

pub use config::{ContainerConfig, HttpConfig};
pub use container::Container;
pub use error::{ServiceError, TaskError, TransferError};
pub use handle::DownloadHandle;
pub use protocol::{
    DownloadSuccess, ProgressCallback, ResumeToken, StateCallback, TaskProgress, TaskState,
    TransferId, TransferOutcome, TransferRequest,
};
pub use service::DownloadService;
pub use transport::{HttpTransport, PauseReply, Transport, TransportEvent};
