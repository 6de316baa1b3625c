//! IPC client: the child-side half of the supervisor protocol.
//!
//! Child agent implementations (and the in-process fakes the tests inject)
//! use this to connect to `DEVLOOP_IPC_SOCKET`, stream status/progress, and
//! deliver a terminal `code_changes`, `complete`, or `error` message. Write
//! failures are non-fatal: senders report "not sent" and the supervisor's
//! timeout handles the rest.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::models::change_set::ChangeSet;
use crate::domain::models::message::{IpcMessage, MessagePayload};

use super::retry::RetryPolicy;
use super::{ENV_DEBUG, ENV_IPC_SOCKET, ENV_REQUEST_ID, ENV_SESSION_ID};

/// Client connection to one session's supervisor socket.
pub struct IpcClient {
    path: PathBuf,
    session_id: String,
    request_id: String,
    retry: RetryPolicy,
    writer: Option<Arc<tokio::sync::Mutex<OwnedWriteHalf>>>,
    reader: Option<JoinHandle<()>>,
    acks: Arc<AtomicU64>,
}

impl IpcClient {
    pub fn new(
        path: impl Into<PathBuf>,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.into(),
            request_id: request_id.into(),
            retry: RetryPolicy::default(),
            writer: None,
            reader: None,
            acks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Construct from the `DEVLOOP_*` child environment. `None` when the
    /// contract variables are absent.
    pub fn from_env() -> Option<Self> {
        let path = std::env::var(ENV_IPC_SOCKET).ok()?;
        let session_id = std::env::var(ENV_SESSION_ID).ok()?;
        let request_id = std::env::var(ENV_REQUEST_ID).ok()?;
        if std::env::var(ENV_DEBUG).as_deref() == Ok("true") {
            debug!(socket = %path, "child debug logging enabled");
        }
        Some(Self::new(path, session_id, request_id))
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Acks observed from the supervisor.
    pub fn ack_count(&self) -> u64 {
        self.acks.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    /// Connect, retrying `ECONNREFUSED`/`ENOENT` with exponential backoff.
    /// Returns false when every attempt failed; a successful connection
    /// resets the retry accounting.
    pub async fn connect(&mut self) -> bool {
        let mut attempt: u32 = 0;
        loop {
            match UnixStream::connect(&self.path).await {
                Ok(stream) => {
                    self.adopt(stream);
                    return true;
                }
                Err(e) => {
                    let retryable = matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
                    );
                    if !retryable || attempt >= self.retry.max_retries {
                        warn!(path = %self.path.display(), error = %e, "IPC connect failed");
                        return false;
                    }
                    debug!(
                        path = %self.path.display(),
                        attempt = attempt + 1,
                        "IPC connect retry"
                    );
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    fn adopt(&mut self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        self.writer = Some(Arc::new(tokio::sync::Mutex::new(write_half)));

        let acks = self.acks.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let trimmed = line.trim_end_matches(['\r', '\n']);
                        if trimmed.is_empty() {
                            continue;
                        }
                        match IpcMessage::from_line(trimmed) {
                            Ok(message) if message.payload == MessagePayload::Ack => {
                                acks.fetch_add(1, Ordering::SeqCst);
                            }
                            Ok(message) => {
                                debug!(kind = message.payload.kind(), "non-ack from supervisor");
                            }
                            Err(e) => {
                                let head: String = trimmed.chars().take(100).collect();
                                warn!(error = %e, line = %head, "unparseable supervisor line");
                            }
                        }
                    }
                }
            }
        }));
    }

    /// Tear down and connect again.
    pub async fn reconnect(&mut self) -> bool {
        self.close().await;
        self.connect().await
    }

    /// Drop the connection.
    pub async fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            let mut guard = writer.lock().await;
            let _ = guard.shutdown().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    async fn send(&self, payload: MessagePayload) -> bool {
        let Some(ref writer) = self.writer else {
            return false;
        };
        let message = IpcMessage::new(payload, self.session_id.clone(), self.request_id.clone());
        let Ok(mut line) = message.to_line() else {
            return false;
        };
        line.push('\n');
        let mut guard = writer.lock().await;
        if let Err(e) = guard.write_all(line.as_bytes()).await {
            warn!(error = %e, "IPC send failed; message not sent");
            return false;
        }
        guard.flush().await.is_ok()
    }

    pub async fn send_status(&self, status: impl Into<String>) -> bool {
        self.send(MessagePayload::Status {
            status: status.into(),
        })
        .await
    }

    pub async fn send_progress(&self, percent: f64) -> bool {
        self.send(MessagePayload::Progress { percent }).await
    }

    pub async fn send_files_changed(&self, files: Vec<String>) -> bool {
        self.send(MessagePayload::FilesChanged { files }).await
    }

    pub async fn send_code_changes(&self, changes: ChangeSet) -> bool {
        self.send(MessagePayload::CodeChanges { changes }).await
    }

    pub async fn send_error(&self, error: impl Into<String>) -> bool {
        self.send(MessagePayload::Error {
            error: error.into(),
        })
        .await
    }

    pub async fn send_complete(&self, success: bool, summary: Option<String>) -> bool {
        self.send(MessagePayload::Complete { success, summary }).await
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
