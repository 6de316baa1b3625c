//! Checkpoint records created on successful scheduler transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What triggered a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointKind {
    PhaseCompletion,
    TestPass,
    ValidationPass,
    TaskCompletion,
    Manual,
}

impl CheckpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PhaseCompletion => "phase-completion",
            Self::TestPass => "test-pass",
            Self::ValidationPass => "validation-pass",
            Self::TaskCompletion => "task-completion",
            Self::Manual => "manual",
        }
    }
}

/// A recoverable point in a PRD's execution. Consumed only by explicit
/// rollback requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// `{prdId}-phase-{phaseId}-{epochMs}`.
    pub id: String,
    pub prd_id: String,
    pub phase_id: String,
    pub kind: CheckpointKind,
    /// VCS commit hash when a repository was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(prd_id: &str, phase_id: &str, kind: CheckpointKind) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}-phase-{}-{}", prd_id, phase_id, now.timestamp_millis()),
            prd_id: prd_id.to_string(),
            phase_id: phase_id.to_string(),
            kind,
            commit: None,
            snapshot_path: None,
            created_at: now,
        }
    }
}
