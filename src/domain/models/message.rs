//! IPC wire messages.
//!
//! Messages are newline-delimited JSON objects exchanged between the
//! supervisor and the child agent. Every non-ack message from the child is
//! answered by exactly one ack with the same session and request ids.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::change_set::ChangeSet;

/// Typed payload portion of an IPC message. The `type` field on the wire
/// selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Free-text status line from the child.
    Status { status: String },
    /// Progress percentage, 0..=100.
    Progress { percent: f64 },
    /// Files the child reports having touched so far.
    FilesChanged { files: Vec<String> },
    /// The proposed change-set. Terminal for a request.
    CodeChanges { changes: ChangeSet },
    /// Child-side failure. Terminal for a request.
    Error { error: String },
    /// Completion without a change-set. Terminal for a request.
    Complete {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    /// Supervisor acknowledgement of a child message.
    Ack,
}

impl MessagePayload {
    /// Wire name of this payload's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Progress { .. } => "progress",
            Self::FilesChanged { .. } => "files_changed",
            Self::CodeChanges { .. } => "code_changes",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
            Self::Ack => "ack",
        }
    }

    /// Whether this payload terminates a request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CodeChanges { .. } | Self::Error { .. } | Self::Complete { .. }
        )
    }
}

/// A full IPC message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcMessage {
    #[serde(flatten)]
    pub payload: MessagePayload,
    pub session_id: String,
    pub request_id: String,
    /// Epoch milliseconds at send time.
    pub timestamp: i64,
}

impl IpcMessage {
    /// Build a message stamped with the current time.
    pub fn new(
        payload: MessagePayload,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            payload,
            session_id: session_id.into(),
            request_id: request_id.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Build the ack answering this message.
    pub fn ack(&self) -> Self {
        Self::new(
            MessagePayload::Ack,
            self.session_id.clone(),
            self.request_id.clone(),
        )
    }

    /// Serialize to a single wire line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse one wire line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}
