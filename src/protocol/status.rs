//! Progress and completion payloads
//!
//! Types delivered to handle observers.

use crate::error::TransferError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::types::TaskState;

/// One progress event from the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Bytes transferred since the previous event
    pub bytes_written: u64,
    /// Total bytes transferred so far
    pub total_bytes_written: u64,
    /// Expected total size in bytes (may be unknown)
    pub total_bytes_expected: Option<u64>,
}

impl TaskProgress {
    /// Calculate progress percentage (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        match self.total_bytes_expected {
            Some(total) if total > 0 => (self.total_bytes_written as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }
}

/// Successful completion payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSuccess {
    /// Where the transport left the downloaded data
    pub location: PathBuf,
}

/// Terminal result of a transfer: success with a location, or the
/// transport failure that ended it
pub type TransferOutcome = Result<DownloadSuccess, TransferError>;

/// Progress observer callback. Invoked without a thread-affinity
/// guarantee; redispatch yourself if you need a specific thread.
pub type ProgressCallback = Arc<dyn Fn(TaskProgress) + Send + Sync>;

/// State-change observer callback. Same delivery caveats as
/// [`ProgressCallback`].
pub type StateCallback = Arc<dyn Fn(TaskState) + Send + Sync>;
