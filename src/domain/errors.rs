//! Error types for the development loop.
//!
//! Each enum covers one component family. Transience helpers drive the
//! retry/backoff decisions in the IPC layer and the scheduler's fatal-error
//! classification.

use thiserror::Error;

/// Errors from the task store and other file-backed stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Reading the backing file failed.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The atomic write discipline failed; the temp file has been removed.
    #[error("Atomic write to {path} failed: {reason}")]
    AtomicWrite { path: String, reason: String },

    /// The re-read verification of a freshly written file failed.
    #[error("Verification of {path} after write failed")]
    VerifyFailed { path: String },

    /// A task id was not present in the store.
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// Persistence failures are fatal for the owning scheduler.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AtomicWrite { .. } | Self::VerifyFailed { .. }
        )
    }
}

/// Errors from the IPC supervisor and client.
#[derive(Error, Debug)]
pub enum IpcError {
    /// Binding the listener failed after exhausting retries.
    #[error("Failed to bind socket {path}: {reason}")]
    BindFailed { path: String, reason: String },

    /// Connecting to the server failed after exhausting retries.
    #[error("Failed to connect to {path}: {reason}")]
    ConnectFailed { path: String, reason: String },

    /// The client is not connected.
    #[error("Not connected")]
    NotConnected,

    /// A write to the peer failed; callers treat this as "not sent".
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The server has been stopped.
    #[error("Server stopped")]
    Stopped,

    /// Underlying socket I/O failure.
    #[error("Socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    /// Transient errors are retried with bounded exponential backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BindFailed { .. } | Self::ConnectFailed { .. } | Self::WriteFailed(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::AddrInUse
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Errors that terminate the scheduler for its PRD.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The task store could not be persisted; the loop cannot continue
    /// without losing state.
    #[error("Task store failure: {0}")]
    Store(#[from] StoreError),

    /// The IPC server could not be started after retries.
    #[error("IPC failure: {0}")]
    Ipc(#[from] IpcError),

    /// Change-set application failed at the filesystem level.
    #[error("Failed to apply change-set: {0}")]
    Apply(String),

    /// External command execution failed to launch.
    #[error("Failed to run external command `{command}`: {reason}")]
    Command { command: String, reason: String },
}

/// Errors from explicit checkpoint rollback requests.
#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("Unknown checkpoint: {0}")]
    UnknownCheckpoint(String),

    /// The checkpoint was created without a VCS head (no repository was
    /// available at the time), so there is nothing to restore to.
    #[error("Checkpoint {0} recorded no VCS commit")]
    NoCommit(String),

    #[error("VCS restore failed: {0}")]
    VcsFailed(String),
}

/// Errors from configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid maxRetries: {0}. Cannot be 0")]
    InvalidMaxRetries(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid monitor pollingInterval: {0}. Must be positive")]
    InvalidPollingInterval(u64),

    #[error("tasksPath cannot be empty")]
    EmptyTasksPath,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_fatality() {
        assert!(StoreError::AtomicWrite {
            path: "t.json".to_string(),
            reason: "disk full".to_string()
        }
        .is_fatal());
        assert!(StoreError::VerifyFailed { path: "t.json".to_string() }.is_fatal());
        assert!(!StoreError::UnknownTask("7".to_string()).is_fatal());
    }

    #[test]
    fn test_ipc_error_transience() {
        assert!(IpcError::ConnectFailed {
            path: "/tmp/x.sock".to_string(),
            reason: "refused".to_string()
        }
        .is_transient());
        assert!(!IpcError::Stopped.is_transient());
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(IpcError::Io(refused).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::UnknownTask("42".to_string());
        assert_eq!(err.to_string(), "Unknown task: 42");

        let err = IpcError::WriteFailed("broken pipe".to_string());
        assert_eq!(err.to_string(), "Write failed: broken pipe");
    }
}
