//! Core protocol types
//!
//! Fundamental types used throughout the coordinator.

use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use url::Url;

/// Unique identifier for one transfer at the transport layer.
///
/// Assigned by the transport when a transfer is created and never reused
/// for the life of the transport. A replacement transfer built from a
/// resume token gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(u64);

impl TransferId {
    /// Create from a raw transport-assigned value
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw transport-assigned value
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a download task
///
/// `Cancelled` and `Completed` are terminal; no transition leaves them.
/// Both success and failure end in `Completed`; which of the two it was
/// is carried in the completion payload, not in this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Voted runnable, waiting for a scheduler slot
    Ready,
    /// Transport actively transferring
    Running,
    /// Paused; a resume token may exist
    Suspended,
    /// Terminated and discarded
    Cancelled,
    /// Terminated (successfully or with an error payload)
    Completed,
}

impl TaskState {
    /// Check if this state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }

    /// Check if the task is runnable or running
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// The original request descriptor for a download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Download URL
    pub url: Url,
    /// Output filename hint (derived from the URL path when absent)
    pub filename: Option<String>,
}

impl TransferRequest {
    /// Parse and validate a URL into a request descriptor
    pub fn parse(url: &str) -> Result<Self, ServiceError> {
        let parsed = Url::parse(url)
            .map_err(|e| ServiceError::invalid_input("url", format!("Invalid URL: {}", e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(ServiceError::invalid_input(
                    "url",
                    format!("Unsupported scheme: {}", scheme),
                ));
            }
        }

        Ok(Self {
            url: parsed,
            filename: None,
        })
    }

    /// Display name for the download: filename hint, else the last URL
    /// path segment, else "download"
    pub fn name(&self) -> String {
        self.filename.clone().unwrap_or_else(|| {
            self.url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "download".to_string())
        })
    }
}

/// Opaque resumable state produced when a started transfer is paused.
///
/// The encoding is private to the transport that produced it; the
/// coordinator only moves it around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken(Vec<u8>);

impl ResumeToken {
    /// Wrap transport-encoded resume data
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the transport-encoded resume data
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
