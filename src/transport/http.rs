//! HTTP transport backed by reqwest
//!
//! Streams each transfer into a `.part` file next to its final
//! location, renaming on completion. Pausing captures the part path and
//! byte offset into a resume token; a replacement transfer created from
//! that token continues with an HTTP `Range` request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::RANGE;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ContainerConfig;
use crate::error::{ServiceError, TransferError};
use crate::protocol::{ResumeToken, TaskProgress, TransferId, TransferRequest};
use crate::transport::{PauseReply, Transport, TransportEvent};

/// Resumable state for one interrupted HTTP transfer
#[derive(Debug, Serialize, Deserialize)]
struct HttpResumeState {
    url: String,
    part_path: PathBuf,
    bytes_written: u64,
}

struct TransferSlot {
    request: TransferRequest,
    resume: Option<HttpResumeState>,
    cancel: CancellationToken,
    pause_reply: Arc<Mutex<Option<PauseReply>>>,
}

/// HTTP download transport
pub struct HttpTransport {
    client: reqwest::Client,
    download_dir: PathBuf,
    events: UnboundedSender<TransportEvent>,
    next_id: AtomicU64,
    slots: Arc<Mutex<HashMap<TransferId, Arc<TransferSlot>>>>,
}

impl HttpTransport {
    pub fn new(
        config: &ContainerConfig,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(
                config.http.connect_timeout_secs,
            ))
            .user_agent(config.http.user_agent.clone())
            .build()
            .map_err(|e| ServiceError::invalid_input("http", e.to_string()))?;

        Ok(Self {
            client,
            download_dir: config.download_dir.clone(),
            events,
            next_id: AtomicU64::new(1),
            slots: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn register(&self, request: TransferRequest, resume: Option<HttpResumeState>) -> TransferId {
        let id = TransferId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst));
        let slot = Arc::new(TransferSlot {
            request,
            resume,
            cancel: CancellationToken::new(),
            pause_reply: Arc::new(Mutex::new(None)),
        });
        self.slots.lock().insert(id, slot);
        id
    }
}

impl Transport for HttpTransport {
    fn create(&self, request: TransferRequest) -> TransferId {
        self.register(request, None)
    }

    fn create_with_resume_data(&self, request: TransferRequest, token: ResumeToken) -> TransferId {
        let resume = match serde_json::from_slice::<HttpResumeState>(token.as_bytes()) {
            Ok(state) => Some(state),
            Err(e) => {
                // Unreadable token: start the transfer over
                warn!(error = %e, "discarding malformed resume token");
                None
            }
        };
        self.register(request, resume)
    }

    fn start(&self, id: TransferId) {
        let slot = {
            let slots = self.slots.lock();
            slots.get(&id).cloned()
        };
        let Some(slot) = slot else {
            warn!(transfer = %id, "start for unknown transfer");
            return;
        };

        let client = self.client.clone();
        let download_dir = self.download_dir.clone();
        let events = self.events.clone();
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let outcome = run_transfer(&client, &download_dir, id, &slot, &events).await;
            slots.lock().remove(&id);
            match outcome {
                Ok(Some(location)) => {
                    let _ = events.send(TransportEvent::Finished { id, location });
                }
                Ok(None) => {
                    // Cancelled or paused; the reply path already spoke
                }
                Err(error) => {
                    let _ = events.send(TransportEvent::Failed { id, error });
                }
            }
        });
    }

    fn cancel(&self, id: TransferId) {
        let slot = self.slots.lock().remove(&id);
        if let Some(slot) = slot {
            slot.cancel.cancel();
        }
    }

    fn cancel_for_resume(&self, id: TransferId, reply: PauseReply) {
        let slot = self.slots.lock().remove(&id);
        match slot {
            Some(slot) => {
                *slot.pause_reply.lock() = Some(reply);
                slot.cancel.cancel();
            }
            None => reply(None),
        }
    }
}

/// Drive one transfer to its end.
///
/// `Ok(Some(path))` on completion, `Ok(None)` when interrupted by
/// cancel or pause, `Err` on transport failure.
async fn run_transfer(
    client: &reqwest::Client,
    download_dir: &PathBuf,
    id: TransferId,
    slot: &Arc<TransferSlot>,
    events: &UnboundedSender<TransportEvent>,
) -> Result<Option<PathBuf>, TransferError> {
    let name = slot.request.name();
    let part_path = match &slot.resume {
        Some(state) => state.part_path.clone(),
        None => download_dir.join(format!("{}.{}.part", name, id)),
    };

    tokio::fs::create_dir_all(download_dir).await?;

    // The bytes already on disk are authoritative over the token
    let mut offset = match tokio::fs::metadata(&part_path).await {
        Ok(meta) if slot.resume.is_some() => meta.len(),
        _ => 0,
    };

    let mut req = client.get(slot.request.url.clone());
    if offset > 0 {
        req = req.header(RANGE, format!("bytes={}-", offset));
    }

    let response = req.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TransferError::Network {
            message: format!("HTTP status {}", status),
            retryable: status.is_server_error(),
        });
    }

    // A 200 to a ranged request means the server restarted from zero
    if offset > 0 && status != reqwest::StatusCode::PARTIAL_CONTENT {
        debug!(transfer = %id, "server ignored range request, restarting");
        offset = 0;
    }

    let expected = response.content_length().map(|len| len + offset);

    let mut file = if offset > 0 {
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&part_path)
            .await?
    } else {
        tokio::fs::File::create(&part_path).await?
    };

    let mut written = offset;
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = slot.cancel.cancelled() => {
                file.flush().await?;
                drop(file);
                return finish_interrupted(id, slot, &part_path, written).await;
            }
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        let _ = events.send(TransportEvent::Progress {
            id,
            progress: TaskProgress {
                bytes_written: chunk.len() as u64,
                total_bytes_written: written,
                total_bytes_expected: expected,
            },
        });
    }

    file.flush().await?;
    drop(file);

    let location = download_dir.join(&name);
    tokio::fs::rename(&part_path, &location).await?;
    Ok(Some(location))
}

/// The stream was interrupted. With a pause reply waiting this encodes
/// a resume token and keeps the part file; a plain cancel discards it.
async fn finish_interrupted(
    id: TransferId,
    slot: &Arc<TransferSlot>,
    part_path: &PathBuf,
    written: u64,
) -> Result<Option<PathBuf>, TransferError> {
    let reply = slot.pause_reply.lock().take();
    match reply {
        Some(reply) => {
            let state = HttpResumeState {
                url: slot.request.url.to_string(),
                part_path: part_path.clone(),
                bytes_written: written,
            };
            let token = serde_json::to_vec(&state)
                .ok()
                .map(ResumeToken::from_bytes);
            debug!(transfer = %id, bytes = written, "paused with resume state");
            reply(token);
        }
        None => {
            debug!(transfer = %id, "cancelled, discarding partial data");
            let _ = tokio::fs::remove_file(part_path).await;
        }
    }
    Ok(None)
}
