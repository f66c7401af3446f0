//! Protocol types for hydra-dl
//!
//! This module contains the types that cross the coordinator boundary:
//! - Task states and transfer identifiers
//! - Request descriptors and resume tokens
//! - Progress and completion payloads delivered to observers
//!
//! These types are serialization-friendly where that makes sense
//! (resume tokens and progress snapshots may be persisted or shipped
//! over IPC by embedding applications).

mod status;
mod types;

pub use status::{
    DownloadSuccess, ProgressCallback, StateCallback, TaskProgress, TransferOutcome,
};
pub use types::{ResumeToken, TaskState, TransferId, TransferRequest};
