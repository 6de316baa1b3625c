//! Child-agent session accounting.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One request/response exchange kept in the session history ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub request_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A logical conversation with one child agent process. At most one request
/// is in flight per session at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub session_id: String,
    /// Provider-assigned conversation id, if the child reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub call_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub parse_error_count: u64,
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
}

impl AgentSession {
    /// Default history ring capacity.
    pub const DEFAULT_MAX_HISTORY: usize = 100;

    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            chat_id: None,
            created_at: now,
            last_used: now,
            call_count: 0,
            success_count: 0,
            parse_error_count: 0,
            history: VecDeque::new(),
        }
    }

    /// Record one exchange, evicting the oldest entries past `max_history`.
    pub fn record(&mut self, entry: HistoryEntry, max_history: usize) {
        self.last_used = Utc::now();
        self.call_count += 1;
        if entry.error.is_none() {
            self.success_count += 1;
        }
        self.history.push_back(entry);
        while self.history.len() > max_history {
            self.history.pop_front();
        }
    }

    /// Age of the session since last use.
    pub fn idle_secs(&self) -> i64 {
        (Utc::now() - self.last_used).num_seconds()
    }
}
