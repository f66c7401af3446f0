//! Typed error hierarchy for hydra-dl
//!
//! Three families, matching the three surfaces of the crate:
//! [`TaskError`] for handle operations, [`ServiceError`] for the
//! registry and configuration, and [`TransferError`] for transport
//! failures (delivered as completion payloads, never as process faults).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::TaskState;

/// Errors surfaced by handle operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The owning operation no longer exists
    #[error("task is over: the underlying operation no longer exists")]
    TaskOver,

    /// The task was cancelled; no further operations are accepted
    #[error("task has been cancelled")]
    Cancelled,

    /// The task finished; no further operations are accepted
    #[error("task has completed")]
    Completed,

    /// The requested state cannot be set directly by a caller
    #[error("unsupported transition: cannot request '{0}' directly")]
    UnsupportedTransition(TaskState),
}

/// Errors from the service registry and task creation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// No container registered under this name
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// A container with this name is already registered
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// Invalid input from the caller
    #[error("invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },
}

impl ServiceError {
    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Transport-level failure that terminated a transfer.
///
/// `Clone` so one failure can fan out to every attached handle.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransferError {
    /// Network-related failure (connection, timeout, HTTP status, ...)
    #[error("network error: {message}")]
    Network { message: String, retryable: bool },

    /// Local filesystem failure while writing the download
    #[error("storage error: {message}")]
    Storage { message: String },

    /// The transfer was cancelled at the transport layer
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Check if this failure is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { retryable: true, .. })
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout() || err.is_connect();
        Self::Network {
            message: err.to_string(),
            retryable,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}
