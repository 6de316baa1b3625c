//! Recovery suggestions attached to validation errors.
//!
//! Suggestions travel with the error back into the next fix-task prompt, so
//! the description is written for the child agent, not for a human log.

use serde::{Deserialize, Serialize};

use super::ErrorCategory;

/// What the child (or operator) should do about a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    /// Rework the change and resend.
    Fix,
    /// Re-read state and try the same change again.
    Retry,
    /// Drop this operation and continue with the rest.
    Skip,
    /// Needs a human decision.
    Manual,
}

/// Structured remediation advice for one validation error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySuggestion {
    pub action: RecoveryAction,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Build the suggestion for an error category against a file.
pub fn suggestion_for(
    category: ErrorCategory,
    file: &str,
    detail: Option<&str>,
) -> RecoverySuggestion {
    match category {
        ErrorCategory::Boundary => RecoverySuggestion {
            action: RecoveryAction::Manual,
            description: format!(
                "{file} is outside the task's declared module boundary. Either \
                 limit the change to the declared files or widen the task's \
                 target file list."
            ),
            code_template: None,
            reference: Some("module boundary policy".to_string()),
        },
        ErrorCategory::Destructive => RecoverySuggestion {
            action: RecoveryAction::Fix,
            description: format!(
                "The update to {file} would discard most of its content. Resend \
                 the change as targeted patch operations against the current file."
            ),
            code_template: Some(
                r#"{"path": "<file>", "operation": "patch", "patches": [{"search": "<verbatim existing text>", "replace": "<replacement>"}]}"#
                    .to_string(),
            ),
            reference: None,
        },
        ErrorCategory::FileNotFound => RecoverySuggestion {
            action: RecoveryAction::Fix,
            description: format!(
                "{file} does not exist, so it cannot be patched. Create it first \
                 or correct the path."
            ),
            code_template: Some(
                r#"{"path": "<file>", "operation": "create", "content": "<full file content>"}"#
                    .to_string(),
            ),
            reference: None,
        },
        ErrorCategory::PatchNotFound => RecoverySuggestion {
            action: RecoveryAction::Retry,
            description: format!(
                "The search string was not found in {file}. Re-read the file and \
                 copy the anchor text verbatim, including whitespace."
            ),
            code_template: None,
            reference: detail.map(ToString::to_string),
        },
        ErrorCategory::Syntax => RecoverySuggestion {
            action: RecoveryAction::Fix,
            description: format!(
                "The proposed content of {file} does not parse. Balance braces \
                 and parentheses and emit complete declarations."
            ),
            code_template: None,
            reference: detail.map(ToString::to_string),
        },
    }
}
