//! IPC supervisor: local stream-socket transport between the scheduler and
//! the child agent process.
//!
//! Wire format is newline-delimited JSON (`IpcMessage`), UTF-8. One socket
//! per session, path `<tmpdir>/devloop-<sessionId>-<epochMs>-<rand>.sock`.

pub mod client;
pub mod pool;
pub mod retry;
pub mod server;

use std::path::PathBuf;

use rand::Rng;

pub use client::IpcClient;
pub use pool::ServerPool;
pub use retry::RetryPolicy;
pub use server::IpcServer;

/// Environment variable naming the server socket path for the child.
pub const ENV_IPC_SOCKET: &str = "DEVLOOP_IPC_SOCKET";
/// Environment variable carrying the session identifier.
pub const ENV_SESSION_ID: &str = "DEVLOOP_SESSION_ID";
/// Environment variable carrying the per-invocation request identifier; the
/// child must echo it on every message.
pub const ENV_REQUEST_ID: &str = "DEVLOOP_REQUEST_ID";
/// Environment variable enabling verbose child logging when set to "true".
pub const ENV_DEBUG: &str = "DEVLOOP_DEBUG";

/// Generate a fresh socket path for a session. Called again with a new random
/// suffix on every bind retry.
pub fn socket_path(session_id: &str) -> PathBuf {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    std::env::temp_dir().join(format!(
        "devloop-{}-{}-{}.sock",
        session_id,
        chrono::Utc::now().timestamp_millis(),
        suffix
    ))
}

/// The environment a spawned child consumes, per the child-process contract.
#[derive(Debug, Clone)]
pub struct ChildEnv {
    pub socket: PathBuf,
    pub session_id: String,
    pub request_id: String,
    pub debug: bool,
}

impl ChildEnv {
    /// Key/value pairs for `Command::envs`.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_IPC_SOCKET, self.socket.display().to_string()),
            (ENV_SESSION_ID, self.session_id.clone()),
            (ENV_REQUEST_ID, self.request_id.clone()),
            (ENV_DEBUG, self.debug.to_string()),
        ]
    }
}
