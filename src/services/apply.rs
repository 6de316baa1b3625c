//! Change-set application.
//!
//! Runs after the validation gate has passed: create/update/patch/delete
//! semantics exactly as declared, with patch operations applying the
//! possibly-fuzz-corrected search strings. Application stops at the first
//! failing operation; the scheduler treats that as a failed outcome.

use std::path::Path;

use tracing::debug;

use crate::domain::errors::SchedulerError;
use crate::domain::models::change_set::{ChangeSet, FileOp};

/// Apply every operation in order. Returns the list of paths touched.
pub async fn apply_change_set(
    root: &Path,
    changes: &ChangeSet,
) -> Result<Vec<String>, SchedulerError> {
    let mut touched = Vec::with_capacity(changes.operations.len());

    for operation in &changes.operations {
        let absolute = root.join(&operation.path);
        match &operation.op {
            FileOp::Create { content } | FileOp::Update { content } => {
                if let Some(parent) = absolute.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        SchedulerError::Apply(format!(
                            "create parent dirs for {}: {e}",
                            operation.path
                        ))
                    })?;
                }
                tokio::fs::write(&absolute, content).await.map_err(|e| {
                    SchedulerError::Apply(format!("write {}: {e}", operation.path))
                })?;
            }
            FileOp::Patch { patches } => {
                let mut content =
                    tokio::fs::read_to_string(&absolute).await.map_err(|e| {
                        SchedulerError::Apply(format!("read {}: {e}", operation.path))
                    })?;
                for hunk in patches {
                    if !content.contains(&hunk.search) {
                        return Err(SchedulerError::Apply(format!(
                            "patch anchor vanished from {} between validation and apply",
                            operation.path
                        )));
                    }
                    content = content.replacen(&hunk.search, &hunk.replace, 1);
                }
                tokio::fs::write(&absolute, content).await.map_err(|e| {
                    SchedulerError::Apply(format!("write {}: {e}", operation.path))
                })?;
            }
            FileOp::Delete => {
                tokio::fs::remove_file(&absolute).await.map_err(|e| {
                    SchedulerError::Apply(format!("delete {}: {e}", operation.path))
                })?;
            }
        }
        debug!(path = %operation.path, kind = operation.op.kind(), "applied operation");
        touched.push(operation.path.clone());
    }

    Ok(touched)
}
