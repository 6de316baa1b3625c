//! Atomic file persistence.
//!
//! Every on-disk store (tasks, patterns, metrics, checkpoints) writes through
//! the same discipline: serialize to `<path>.tmp`, re-read and verify the
//! JSON round-trips to the caller's canonical shape, then rename over the
//! target. On any failure the temp file is removed and the error surfaces to
//! the caller; no reader ever observes a partial file.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::debug;

use crate::domain::errors::StoreError;

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Serialize `value` and atomically replace `path` with it.
///
/// `verify` receives the re-parsed JSON of the temp file and must return true
/// for the write to be committed; it is where each store asserts its own
/// canonical shape (e.g. `master.tasks` being a list).
pub async fn atomic_write_json<T, F>(path: &Path, value: &T, verify: F) -> Result<(), StoreError>
where
    T: Serialize,
    F: Fn(&serde_json::Value) -> bool,
{
    let serialized = serde_json::to_string_pretty(value)?;
    let tmp = tmp_path(path);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(|e| StoreError::AtomicWrite {
                path: path.display().to_string(),
                reason: format!("create parent dir: {e}"),
            })?;
        }
    }

    if let Err(e) = fs::write(&tmp, &serialized).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::AtomicWrite {
            path: path.display().to_string(),
            reason: format!("write temp file: {e}"),
        });
    }

    // Re-read and verify before the rename makes the write visible.
    let round_trip = match fs::read_to_string(&tmp).await {
        Ok(contents) => serde_json::from_str::<serde_json::Value>(&contents).ok(),
        Err(_) => None,
    };
    let ok = round_trip.as_ref().map(&verify).unwrap_or(false);
    if !ok {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::VerifyFailed {
            path: path.display().to_string(),
        });
    }

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::AtomicWrite {
            path: path.display().to_string(),
            reason: format!("rename: {e}"),
        });
    }

    debug!(path = %path.display(), bytes = serialized.len(), "atomic write committed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        atomic_write_json(&path, &json!({"k": 1}), |v| v.get("k").is_some())
            .await
            .unwrap();

        let contents = fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["k"], 1);
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_failed_verification_removes_temp_and_keeps_old() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        atomic_write_json(&path, &json!({"k": 1}), |_| true).await.unwrap();

        // Verification rejects the new content: old file must survive.
        let err = atomic_write_json(&path, &json!({"other": 2}), |v| v.get("k").is_some())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VerifyFailed { .. }));
        assert!(!tmp_path(&path).exists());

        let contents = fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["k"], 1);
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/data.json");
        atomic_write_json(&path, &json!([1, 2]), |v| v.is_array())
            .await
            .unwrap();
        assert!(path.exists());
    }
}
