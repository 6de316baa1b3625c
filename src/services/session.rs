//! Child-session registry: accounting and age-based pruning.

use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;

use crate::domain::models::config::SessionManagementConfig;
use crate::domain::models::session::{AgentSession, HistoryEntry};

/// In-memory registry of sessions for one process.
pub struct SessionRegistry {
    sessions: HashMap<String, AgentSession>,
    config: SessionManagementConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionManagementConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            config,
        }
    }

    /// Fetch or create a session record.
    pub fn get_or_create(&mut self, session_id: &str) -> &mut AgentSession {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| AgentSession::new(session_id))
    }

    pub fn get(&self, session_id: &str) -> Option<&AgentSession> {
        self.sessions.get(session_id)
    }

    /// Record one request/response exchange against a session.
    pub fn record_exchange(
        &mut self,
        session_id: &str,
        request_id: &str,
        prompt: &str,
        response: Option<String>,
        error: Option<String>,
    ) {
        let max_history = self.config.max_history_items;
        let session = self.get_or_create(session_id);
        session.record(
            HistoryEntry {
                request_id: request_id.to_string(),
                prompt: prompt.to_string(),
                response,
                error,
                timestamp: Utc::now(),
            },
            max_history,
        );
    }

    /// Count a JSON-parse failure against a session.
    pub fn record_parse_error(&mut self, session_id: &str) {
        self.get_or_create(session_id).parse_error_count += 1;
    }

    /// Drop sessions idle longer than `maxSessionAge`. Returns how many were
    /// pruned.
    pub fn prune_stale(&mut self) -> usize {
        let max_age = self.config.max_session_age as i64;
        let before = self.sessions.len();
        self.sessions.retain(|id, s| {
            let keep = s.idle_secs() <= max_age;
            if !keep {
                debug!(session = %id, idle_secs = s.idle_secs(), "pruning stale session");
            }
            keep
        });
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
