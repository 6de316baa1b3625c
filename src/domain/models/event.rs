//! Event envelope for the in-process bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

impl Default for EventSeverity {
    fn default() -> Self {
        Self::Info
    }
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One event on the bus. Identifiers are assigned in emission order by the
/// owning bus; types are dot-namespaced strings such as `task:complete` or
/// `ipc:health_check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopEvent {
    /// Monotone identifier, unique per bus instance until `clear()`.
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: EventSeverity,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_id: Option<String>,
    /// Free-form payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Emission options: severity plus optional task/PRD correlation.
#[derive(Debug, Clone, Default)]
pub struct EmitOpts {
    pub severity: EventSeverity,
    pub task_id: Option<String>,
    pub prd_id: Option<String>,
}

impl EmitOpts {
    pub fn severity(severity: EventSeverity) -> Self {
        Self {
            severity,
            ..Self::default()
        }
    }

    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_prd(mut self, prd_id: impl Into<String>) -> Self {
        self.prd_id = Some(prd_id.into());
        self
    }
}
