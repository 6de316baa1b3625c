//! Error pattern records for the pattern memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recognized failure signature: a regex over error text plus the guidance
/// injected into future prompts when the pattern is relevant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPattern {
    /// Stable identifier, e.g. `removed-helpers` or `learned-1700000000000`.
    pub id: String,
    /// Regular-expression body matched against error text.
    pub regex: String,
    /// Preventive guidance for the child's system prompt.
    pub guidance: String,
    #[serde(default)]
    pub occurrences: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Files this pattern has been observed against.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Built-in patterns are seeded at startup and survive a `clear`; learned
    /// patterns are appended at runtime.
    #[serde(default)]
    pub builtin: bool,
}

impl ErrorPattern {
    /// Create a built-in pattern.
    pub fn builtin(id: &str, regex: &str, guidance: &str) -> Self {
        Self {
            id: id.to_string(),
            regex: regex.to_string(),
            guidance: guidance.to_string(),
            occurrences: 0,
            last_seen: None,
            files: Vec::new(),
            builtin: true,
        }
    }

    /// Record one observation, optionally against a file.
    pub fn observe(&mut self, file: Option<&str>) {
        self.occurrences += 1;
        self.last_seen = Some(Utc::now());
        if let Some(file) = file {
            if !self.files.iter().any(|f| f == file) {
                self.files.push(file.to_string());
            }
        }
    }
}
