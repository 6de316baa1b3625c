//! Stream-socket server supervising one child-agent session.
//!
//! Accepts connections on a per-session Unix socket, frames newline-delimited
//! JSON, acks every non-ack inbound message, caches terminal results per
//! request id, and fans every received message out on a broadcast channel.
//! `wait_for_result` is a select over that channel and a timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::domain::errors::IpcError;
use crate::domain::models::event::{EmitOpts, EventSeverity};
use crate::domain::models::message::{IpcMessage, MessagePayload};
use crate::services::event_bus::{types, EventBus};

use super::pool::ServerPool;
use super::retry::RetryPolicy;
use super::socket_path;

/// Health-check cadence.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Grace between asking a connection to end and destroying it.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Hard backstop on the whole stop sequence.
const STOP_BACKSTOP: Duration = Duration::from_secs(5);

/// Default `wait_for_result` timeout.
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(300);

struct ConnEntry {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    reader: AbortHandle,
}

struct ServerInner {
    session_id: String,
    debug: bool,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
    listening: AtomicBool,
    socket: Mutex<Option<PathBuf>>,
    /// Every live connection, for shutdown.
    conn_list: Mutex<Vec<ConnEntry>>,
    /// Latest connection seen for each request id, for addressing replies.
    by_request: Mutex<HashMap<String, Arc<tokio::sync::Mutex<OwnedWriteHalf>>>>,
    /// Terminal results cached so a late `wait_for_result` returns at once.
    pending_results: Mutex<HashMap<String, IpcMessage>>,
    message_tx: broadcast::Sender<IpcMessage>,
    /// Accept loop + health timer handles.
    background: Mutex<Vec<AbortHandle>>,
}

/// Cloneable handle to one session's IPC server.
#[derive(Clone)]
pub struct IpcServer {
    inner: Arc<ServerInner>,
}

impl IpcServer {
    pub fn new(session_id: impl Into<String>, bus: Arc<EventBus>, debug: bool) -> Self {
        let (message_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(ServerInner {
                session_id: session_id.into(),
                debug,
                bus,
                retry: RetryPolicy::default(),
                listening: AtomicBool::new(false),
                socket: Mutex::new(None),
                conn_list: Mutex::new(Vec::new()),
                by_request: Mutex::new(HashMap::new()),
                pending_results: Mutex::new(HashMap::new()),
                message_tx,
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::SeqCst)
    }

    /// Socket path once started.
    pub fn socket(&self) -> Option<PathBuf> {
        self.inner.socket.lock().expect("socket lock").clone()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conn_list.lock().expect("conn lock").len()
    }

    pub fn pending_result_count(&self) -> usize {
        self.inner.pending_results.lock().expect("pending lock").len()
    }

    /// Fan-out of every message the server receives.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<IpcMessage> {
        self.inner.message_tx.subscribe()
    }

    /// Bind and start serving. On `address in use` (or any other bind
    /// failure) the socket path is regenerated with a fresh random suffix and
    /// the bind retried with exponential backoff; exhaustion emits
    /// `ipc:connection_failed` and errors out. On success the server joins
    /// `pool`, which owns process-termination cleanup.
    pub async fn start(&self, pool: &Arc<ServerPool>) -> Result<PathBuf, IpcError> {
        let inner = &self.inner;
        let mut attempt: u32 = 0;
        let (listener, path) = loop {
            let path = socket_path(&inner.session_id);
            let _ = tokio::fs::remove_file(&path).await;
            match UnixListener::bind(&path) {
                Ok(listener) => break (listener, path),
                Err(e) => {
                    if attempt >= inner.retry.max_retries {
                        inner.bus.emit(
                            types::IPC_CONNECTION_FAILED,
                            json!({
                                "sessionId": inner.session_id,
                                "attempts": attempt + 1,
                                "error": e.to_string(),
                            }),
                            EmitOpts::severity(EventSeverity::Error),
                        );
                        return Err(IpcError::BindFailed {
                            path: path.display().to_string(),
                            reason: e.to_string(),
                        });
                    }
                    inner.bus.emit(
                        types::IPC_CONNECTION_RETRY,
                        json!({
                            "sessionId": inner.session_id,
                            "attempt": attempt + 1,
                            "error": e.to_string(),
                        }),
                        EmitOpts::severity(EventSeverity::Warn),
                    );
                    tokio::time::sleep(inner.retry.backoff(attempt)).await;
                    attempt += 1;
                }
            }
        };

        *inner.socket.lock().expect("socket lock") = Some(path.clone());
        inner.listening.store(true, Ordering::SeqCst);
        info!(session = %inner.session_id, path = %path.display(), "IPC server listening");

        let accept = tokio::spawn(Self::accept_loop(inner.clone(), listener));
        let health = tokio::spawn(Self::health_loop(inner.clone()));
        {
            let mut background = inner.background.lock().expect("background lock");
            background.push(accept.abort_handle());
            background.push(health.abort_handle());
        }

        pool.register(self.clone());
        Ok(path)
    }

    async fn accept_loop(inner: Arc<ServerInner>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    Self::adopt_connection(&inner, stream);
                }
                Err(e) => {
                    if !inner.listening.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(session = %inner.session_id, error = %e, "accept failed");
                }
            }
        }
    }

    fn adopt_connection(inner: &Arc<ServerInner>, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));
        let task = tokio::spawn(Self::read_loop(
            inner.clone(),
            read_half,
            writer.clone(),
        ));
        inner.conn_list.lock().expect("conn lock").push(ConnEntry {
            writer,
            reader: task.abort_handle(),
        });
    }

    /// Per-connection framing loop: buffer bytes, split on `\n`, parse each
    /// complete line as JSON. Parse failures are logged (first 100 chars) and
    /// the stream continues.
    async fn read_loop(
        inner: Arc<ServerInner>,
        read_half: tokio::net::unix::OwnedReadHalf,
        writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    ) {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if trimmed.is_empty() {
                        continue;
                    }
                    match IpcMessage::from_line(trimmed) {
                        Ok(message) => Self::route(&inner, &writer, message).await,
                        Err(e) => {
                            let head: String = trimmed.chars().take(100).collect();
                            warn!(session = %inner.session_id, error = %e, line = %head, "dropping unparseable IPC line");
                        }
                    }
                }
                Err(e) => {
                    debug!(session = %inner.session_id, error = %e, "connection read ended");
                    break;
                }
            }
        }
    }

    async fn route(
        inner: &Arc<ServerInner>,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
        message: IpcMessage,
    ) {
        if inner.debug {
            debug!(
                session = %inner.session_id,
                request = %message.request_id,
                kind = message.payload.kind(),
                "received message"
            );
        }

        // Latest registration wins.
        inner
            .by_request
            .lock()
            .expect("by_request lock")
            .insert(message.request_id.clone(), writer.clone());

        if message.payload != MessagePayload::Ack {
            let ack = message.ack();
            if let Err(e) = write_line(writer, &ack).await {
                warn!(session = %inner.session_id, error = %e, "failed to write ack");
            }
        }

        if matches!(
            message.payload,
            MessagePayload::Complete { .. } | MessagePayload::CodeChanges { .. }
        ) {
            inner
                .pending_results
                .lock()
                .expect("pending lock")
                .insert(message.request_id.clone(), message.clone());
        }

        // One fan-out channel serves both the "any message" and per-type
        // listener roles; receivers filter.
        let _ = inner.message_tx.send(message);
    }

    async fn health_loop(inner: Arc<ServerInner>) {
        let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        interval.tick().await; // consume the immediate first tick
        loop {
            interval.tick().await;
            if !inner.listening.load(Ordering::SeqCst) {
                break;
            }
            let connections = inner.conn_list.lock().expect("conn lock").len();
            let pending = inner.pending_results.lock().expect("pending lock").len();
            inner.bus.emit(
                types::IPC_HEALTH_CHECK,
                json!({
                    "sessionId": inner.session_id,
                    "activeConnections": connections,
                    "pendingResults": pending,
                    "listening": true,
                }),
                EmitOpts::default(),
            );
        }
    }

    /// Wait for the terminal message (`complete`, `code_changes`, or
    /// `error`) of a request. Resolves immediately when the result is already
    /// cached; returns `None` on timeout.
    pub async fn wait_for_result(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Option<IpcMessage> {
        // Subscribe before checking the cache so a result landing in between
        // is not missed.
        let mut rx = self.inner.message_tx.subscribe();
        if let Some(cached) = self
            .inner
            .pending_results
            .lock()
            .expect("pending lock")
            .get(request_id)
            .cloned()
        {
            return Some(cached);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return None,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    // Dropped messages may have included the result; the
                    // terminal ones are cached, so consult the cache.
                    if let Some(cached) = self
                        .inner
                        .pending_results
                        .lock()
                        .expect("pending lock")
                        .get(request_id)
                        .cloned()
                    {
                        return Some(cached);
                    }
                }
                Ok(Ok(message)) => {
                    if message.request_id == request_id && message.payload.is_terminal() {
                        return Some(message);
                    }
                }
            }
        }
    }

    /// Stop serving: graceful close on every connection (end, destroy after
    /// 1 s), clear connections and pending results, close the listener, and
    /// remove the socket file, all bounded by a 5-second backstop.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.listening.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = tokio::time::timeout(STOP_BACKSTOP, async {
            let entries: Vec<ConnEntry> = {
                let mut list = inner.conn_list.lock().expect("conn lock");
                list.drain(..).collect()
            };
            if !entries.is_empty() {
                for entry in &entries {
                    let mut writer = entry.writer.lock().await;
                    let _ = writer.shutdown().await;
                }
                tokio::time::sleep(CLOSE_GRACE).await;
                for entry in &entries {
                    entry.reader.abort();
                }
            }
        })
        .await;

        for handle in inner.background.lock().expect("background lock").drain(..) {
            handle.abort();
        }
        inner.conn_list.lock().expect("conn lock").clear();
        inner.by_request.lock().expect("by_request lock").clear();
        inner.pending_results.lock().expect("pending lock").clear();

        let path = inner.socket.lock().expect("socket lock").take();
        if let Some(path) = path {
            let _ = tokio::fs::remove_file(&path).await;
            info!(session = %inner.session_id, path = %path.display(), "IPC server stopped");
        }
    }
}

async fn write_line(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    message: &IpcMessage,
) -> Result<(), IpcError> {
    let mut line = message
        .to_line()
        .map_err(|e| IpcError::WriteFailed(e.to_string()))?;
    line.push('\n');
    let mut guard = writer.lock().await;
    guard
        .write_all(line.as_bytes())
        .await
        .map_err(|e| IpcError::WriteFailed(e.to_string()))?;
    guard
        .flush()
        .await
        .map_err(|e| IpcError::WriteFailed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_creates_socket_and_stop_removes_it() {
        let bus = Arc::new(EventBus::default());
        let pool = ServerPool::new();
        let server = IpcServer::new("unit-start", bus, false);

        let path = server.start(&pool).await.unwrap();
        assert!(path.exists());
        assert!(server.is_listening());

        server.stop().await;
        assert!(!path.exists());
        assert!(!server.is_listening());
    }

    #[tokio::test]
    async fn test_wait_for_result_times_out_with_none() {
        let bus = Arc::new(EventBus::default());
        let pool = ServerPool::new();
        let server = IpcServer::new("unit-timeout", bus, false);
        server.start(&pool).await.unwrap();

        let result = server
            .wait_for_result("nobody", Duration::from_millis(50))
            .await;
        assert!(result.is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_cached_result_resolves_immediately() {
        let bus = Arc::new(EventBus::default());
        let server = IpcServer::new("unit-cache", bus, false);
        let message = IpcMessage::new(
            MessagePayload::Complete {
                success: true,
                summary: None,
            },
            "unit-cache",
            "req-1",
        );
        server
            .inner
            .pending_results
            .lock()
            .unwrap()
            .insert("req-1".to_string(), message.clone());

        let result = server
            .wait_for_result("req-1", Duration::from_millis(50))
            .await;
        assert_eq!(result, Some(message));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let bus = Arc::new(EventBus::default());
        let pool = ServerPool::new();
        let server = IpcServer::new("unit-idem", bus, false);
        server.start(&pool).await.unwrap();
        server.stop().await;
        server.stop().await;
    }
}
