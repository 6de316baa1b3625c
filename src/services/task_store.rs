//! Task store: atomic load/save of the hierarchical task list, scheduling
//! order, retry accounting, and fix-task synthesis.
//!
//! The store exclusively owns its on-disk file. Reads accept any of the three
//! historical shapes and flatten subtasks; writes always restore nesting and
//! produce the canonical `master` shape through the atomic writer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use tracing::warn;

use crate::domain::errors::StoreError;
use crate::domain::models::task::{base_task_id, Task, TaskPriority, TaskStatus, TasksFile};
use crate::infrastructure::persistence::atomic_write_json;

/// Line-number extraction regexes applied to error text, in order.
static LINE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)line\s+(\d+)").expect("line regex"),
        Regex::new(r":(\d+):").expect("colon-line regex"),
        Regex::new(r"at\s+\S+:(\d+)").expect("at-line regex"),
    ]
});

/// Generic `name.ext:N` path extraction.
static GENERIC_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_@./-]+\.[A-Za-z0-9_]+):\d+").expect("path regex")
});

/// Error signatures that earn extra guidance in fix-task descriptions.
static GUIDANCE_SIGNATURES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)search\s+(?:string|text)\s+not\s+found|patch.{0,20}(?:failed|not\s+applied)")
                .expect("patch regex"),
            "The previous patch did not apply. Re-read the file and copy the \
             search string verbatim from its current content.",
        ),
        (
            Regex::new(r"(?i)undefined\s+(?:method|function|variable|name)|is\s+not\s+defined|not\s+a\s+function")
                .expect("undefined regex"),
            "A referenced symbol does not exist. Define it or fix the reference \
             before any other change.",
        ),
        (
            Regex::new(r"(?i)syntax\s*error|unexpected\s+token").expect("syntax regex"),
            "The file no longer parses. Emit the complete corrected file section \
             with balanced delimiters.",
        ),
        (
            Regex::new(r"(?i)type\s*error|mismatched\s+types").expect("type regex"),
            "Types do not line up. Check the declared signatures of everything \
             the change touches.",
        ),
    ]
});

/// Cap on test output carried into a fix-task description.
const MAX_TEST_OUTPUT_CHARS: usize = 2000;

/// File-backed task store for one PRD.
pub struct TaskStore {
    path: PathBuf,
    tasks: Vec<Task>,
    /// Process-local retry counters keyed by base task id. Saturates at
    /// `max_retries + 1`.
    retry_counts: HashMap<String, u32>,
    max_retries: u32,
    /// Config-driven path extraction patterns (first capture group is the
    /// path), applied alongside the generic `name.ext:N` form.
    error_path_patterns: Vec<Regex>,
    /// Extra guidance keyed by an error-text substring (config-driven).
    error_guidance: Vec<(String, String)>,
}

impl TaskStore {
    /// Load the store from `path`. A missing file yields an empty list; a
    /// corrupt file yields an empty list with a warning, per the recovery
    /// policy (scheduling continues, nothing is overwritten until the first
    /// successful save).
    pub async fn load(path: impl Into<PathBuf>, max_retries: u32) -> Self {
        let path = path.into();
        let tasks = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<TasksFile>(&contents) {
                Ok(file) => file.flatten(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "tasks file unparseable; starting with empty list");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            tasks,
            retry_counts: HashMap::new(),
            max_retries,
            error_path_patterns: Vec::new(),
            error_guidance: Vec::new(),
        }
    }

    /// Install config-driven error-path patterns; invalid regexes are skipped
    /// with a warning.
    pub fn with_error_path_patterns(mut self, patterns: &[String]) -> Self {
        self.error_path_patterns = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "skipping invalid errorPathPattern");
                    None
                }
            })
            .collect();
        self
    }

    /// Install config-driven guidance, keyed by error-text substring.
    pub fn with_error_guidance(mut self, guidance: &HashMap<String, String>) -> Self {
        self.error_guidance = guidance
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self
    }

    /// All flattened tasks in insertion order.
    pub fn all_tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Look up one task.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Schedulable tasks in dispatch order: in-progress first (to resume),
    /// then originals before fix tasks, then by priority, stable on insertion
    /// order. Tasks whose base id has exhausted the retry budget are
    /// excluded, whatever their own counter says.
    pub fn pending(&self) -> Vec<&Task> {
        let mut pending: Vec<(usize, &Task)> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status.is_schedulable())
            .filter(|(_, t)| !self.has_exceeded_max_retries(&t.id))
            .collect();
        pending.sort_by_key(|(idx, t)| {
            (
                t.status != TaskStatus::InProgress,
                t.is_fix(),
                t.priority.rank(),
                *idx,
            )
        });
        pending.into_iter().map(|(_, t)| t).collect()
    }

    /// Mutate one task's status and persist.
    pub async fn update_status(&mut self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StoreError::UnknownTask(id.to_string()))?;
        task.status = status;
        self.save().await
    }

    /// Append a task and persist.
    pub async fn create_task(&mut self, task: Task) -> Result<(), StoreError> {
        self.tasks.push(task);
        self.save().await
    }

    /// Retry count for a task's base id.
    pub fn retry_count(&self, id: &str) -> u32 {
        self.retry_counts
            .get(&base_task_id(id))
            .copied()
            .unwrap_or(0)
    }

    /// Whether the base id's counter has passed the cap.
    pub fn has_exceeded_max_retries(&self, id: &str) -> bool {
        self.retry_count(id) > self.max_retries
    }

    /// Reset the counter for a base id.
    pub fn reset_retries(&mut self, id: &str) {
        self.retry_counts.remove(&base_task_id(id));
    }

    /// Record a failure of `original_id` and synthesize a fix task.
    ///
    /// Increments the base id's retry counter. When the new count exceeds the
    /// cap, the original task is marked blocked, no fix task is produced, and
    /// `Ok(None)` is returned (a normal terminal state, not an error). The
    /// counter saturates at `max_retries + 1`.
    pub async fn create_fix_task(
        &mut self,
        original_id: &str,
        error_description: &str,
        test_output: &str,
    ) -> Result<Option<Task>, StoreError> {
        let base = base_task_id(original_id);
        let count = self
            .retry_counts
            .get(&base)
            .copied()
            .unwrap_or(0)
            .saturating_add(1)
            .min(self.max_retries + 1);
        self.retry_counts.insert(base.clone(), count);

        if count > self.max_retries {
            // The base task is the one that exhausted its budget.
            let block_target = if self.get(&base).is_some() {
                base
            } else {
                original_id.to_string()
            };
            if self.get(&block_target).is_some() {
                self.update_status(&block_target, TaskStatus::Blocked).await?;
            }
            return Ok(None);
        }

        let original_title = self
            .get(original_id)
            .map(|t| t.title.clone())
            .unwrap_or_else(|| format!("task {original_id}"));
        let fix_id = format!("fix-{}-{}", original_id, Utc::now().timestamp_millis());
        let description = self.build_fix_description(original_id, error_description, test_output);

        let fix = Task::new(fix_id, format!("Fix: {original_title}"))
            .with_description(description)
            .with_priority(TaskPriority::Critical)
            .with_dependency(original_id.to_string())
            .with_target_files(
                self.get(original_id)
                    .map(|t| t.target_files.clone())
                    .unwrap_or_default(),
            );
        self.tasks.push(fix.clone());
        self.save().await?;
        Ok(Some(fix))
    }

    fn build_fix_description(
        &self,
        original_id: &str,
        error_description: &str,
        test_output: &str,
    ) -> String {
        let mut description = format!(
            "Fix the failure of task {original_id}.\n\nError:\n{error_description}\n"
        );

        if !test_output.is_empty() {
            let truncated: String = test_output.chars().take(MAX_TEST_OUTPUT_CHARS).collect();
            description.push_str("\nTest output:\n");
            description.push_str(&truncated);
            if test_output.chars().count() > MAX_TEST_OUTPUT_CHARS {
                description.push_str("\n[truncated]");
            }
            description.push('\n');
        }

        let combined = format!("{error_description}\n{test_output}");

        let lines = extract_line_numbers(&combined);
        if !lines.is_empty() {
            description.push_str(&format!(
                "\nRelevant lines: {}\n",
                lines
                    .iter()
                    .map(u64::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        let files = self.extract_file_paths(&combined);
        if !files.is_empty() {
            description.push_str(&format!("\nRelevant files: {}\n", files.join(", ")));
        }

        let guidance = self.collect_guidance(&combined);
        if !guidance.is_empty() {
            description.push_str("\nGuidance:\n");
            for g in guidance {
                description.push_str(&format!("- {g}\n"));
            }
        }

        description
    }

    fn extract_file_paths(&self, text: &str) -> Vec<String> {
        let mut files = Vec::new();
        for re in &self.error_path_patterns {
            for caps in re.captures_iter(text) {
                if let Some(m) = caps.get(1) {
                    push_unique(&mut files, m.as_str());
                }
            }
        }
        for caps in GENERIC_PATH_RE.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                push_unique(&mut files, m.as_str());
            }
        }
        files.truncate(10);
        files
    }

    fn collect_guidance(&self, text: &str) -> Vec<String> {
        let mut guidance: Vec<String> = GUIDANCE_SIGNATURES
            .iter()
            .filter(|(re, _)| re.is_match(text))
            .map(|(_, g)| (*g).to_string())
            .collect();
        for (needle, advice) in &self.error_guidance {
            if text.contains(needle.as_str()) && !guidance.contains(advice) {
                guidance.push(advice.clone());
            }
        }
        guidance
    }

    /// Persist the current list as the canonical master shape. Serializes to
    /// `<path>.tmp`, verifies `master.tasks` round-trips as a list, then
    /// renames over the target.
    pub async fn save(&self) -> Result<(), StoreError> {
        let file = TasksFile::master(TasksFile::nest(&self.tasks));
        atomic_write_json(&self.path, &file, |v| {
            v.pointer("/master/tasks")
                .map(serde_json::Value::is_array)
                .unwrap_or(false)
        })
        .await
    }
}

fn extract_line_numbers(text: &str) -> Vec<u64> {
    let mut lines = Vec::new();
    for re in LINE_RES.iter() {
        for caps in re.captures_iter(text) {
            if let Some(n) = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok()) {
                if !lines.contains(&n) {
                    lines.push(n);
                }
            }
        }
    }
    lines.truncate(10);
    lines
}

fn push_unique(files: &mut Vec<String>, candidate: &str) {
    if !files.iter().any(|f| f == candidate) {
        files.push(candidate.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(tasks_json: &str, max_retries: u32) -> (TaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        tokio::fs::write(&path, tasks_json).await.unwrap();
        (TaskStore::load(&path, max_retries).await, dir)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::load(dir.path().join("absent.json"), 3).await;
        assert!(store.all_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_empty_list() {
        let (store, _dir) = store_with("{not json", 3).await;
        assert!(store.all_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_load_any_shape_save_master_reload_identical() {
        let (store, dir) = store_with(
            r#"[{"id": 1, "title": "a", "subtasks": [{"id": 2, "title": "b"}]},
                {"id": 3, "title": "c", "priority": "high"}]"#,
            3,
        )
        .await;
        let flat_before = store.all_tasks().to_vec();
        store.save().await.unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join("tasks.json"))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.pointer("/master/tasks").unwrap().is_array());
        assert!(value.pointer("/master/metadata/updated").is_some());

        let reloaded = TaskStore::load(dir.path().join("tasks.json"), 3).await;
        assert_eq!(reloaded.all_tasks(), flat_before.as_slice());
    }

    #[tokio::test]
    async fn test_pending_ordering() {
        let (mut store, _dir) = store_with("[]", 3).await;
        store
            .create_task(Task::new("1", "low original").with_priority(TaskPriority::Low))
            .await
            .unwrap();
        store
            .create_task(
                Task::new("fix-9-1700000000000", "fix").with_priority(TaskPriority::Critical),
            )
            .await
            .unwrap();
        store
            .create_task(Task::new("2", "medium original"))
            .await
            .unwrap();
        store
            .create_task(
                Task::new("3", "resumed").with_status(TaskStatus::InProgress),
            )
            .await
            .unwrap();
        store
            .create_task(Task::new("4", "done").with_status(TaskStatus::Done))
            .await
            .unwrap();

        let order: Vec<&str> = store.pending().iter().map(|t| t.id.as_str()).collect();
        // In-progress resumes first; originals by priority before any fix
        // task, despite the fix task's critical priority.
        assert_eq!(order, vec!["3", "2", "1", "fix-9-1700000000000"]);
    }

    #[tokio::test]
    async fn test_update_status_persists() {
        let (mut store, dir) = store_with(r#"[{"id": "1", "title": "a"}]"#, 3).await;
        store.update_status("1", TaskStatus::Done).await.unwrap();
        let reloaded = TaskStore::load(dir.path().join("tasks.json"), 3).await;
        assert_eq!(reloaded.get("1").unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_update_status_unknown_task() {
        let (mut store, _dir) = store_with("[]", 3).await;
        let err = store.update_status("404", TaskStatus::Done).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownTask(_)));
    }

    #[tokio::test]
    async fn test_create_fix_task_shape() {
        let (mut store, _dir) = store_with(
            r#"[{"id": "7", "title": "build the parser", "targetFiles": ["src/parser.rs"]}]"#,
            3,
        )
        .await;
        let fix = store
            .create_fix_task("7", "syntax error at src/parser.rs:42: unexpected token", "")
            .await
            .unwrap()
            .unwrap();
        assert!(fix.id.starts_with("fix-7-"));
        assert_eq!(fix.title, "Fix: build the parser");
        assert_eq!(fix.priority, TaskPriority::Critical);
        assert_eq!(fix.dependencies, vec!["7".to_string()]);
        assert_eq!(fix.target_files, vec!["src/parser.rs".to_string()]);
        assert!(fix.description.contains("Relevant lines: 42"));
        assert!(fix.description.contains("src/parser.rs"));
        assert!(fix.description.contains("balanced delimiters"));
        assert_eq!(store.retry_count("7"), 1);
    }

    #[tokio::test]
    async fn test_retry_cap_blocks_original() {
        let (mut store, _dir) = store_with(r#"[{"id": "7", "title": "t"}]"#, 2).await;

        assert!(store.create_fix_task("7", "fail 1", "").await.unwrap().is_some());
        assert!(store
            .create_fix_task("fix-7-1700000000000", "fail 2", "")
            .await
            .unwrap()
            .is_some());
        // Third failure exceeds maxRetries=2: blocked, no fix task.
        let third = store
            .create_fix_task("fix-fix-7-1700000000000-1700000000001", "fail 3", "")
            .await
            .unwrap();
        assert!(third.is_none());
        assert_eq!(store.retry_count("7"), 3);
        assert_eq!(store.get("7").unwrap().status, TaskStatus::Blocked);

        // A fourth request produces nothing and the counter saturates.
        assert!(store.create_fix_task("7", "fail 4", "").await.unwrap().is_none());
        assert_eq!(store.retry_count("7"), 3);
    }

    #[tokio::test]
    async fn test_capped_base_filtered_from_pending() {
        let (mut store, _dir) = store_with(r#"[{"id": "7", "title": "t"}]"#, 0).await;
        assert!(store.create_fix_task("7", "fail", "").await.unwrap().is_none());

        // A fix task descended from the capped base never schedules, even
        // though its own id has no counter.
        store
            .create_task(Task::new("fix-7-1700000000099", "stale fix"))
            .await
            .unwrap();
        assert!(store.pending().is_empty());
    }

    #[tokio::test]
    async fn test_reset_retries() {
        let (mut store, _dir) = store_with(r#"[{"id": "7", "title": "t"}]"#, 1).await;
        store.create_fix_task("7", "fail", "").await.unwrap();
        assert_eq!(store.retry_count("fix-7-123"), 1);
        store.reset_retries("fix-7-123");
        assert_eq!(store.retry_count("7"), 0);
    }

    #[tokio::test]
    async fn test_config_driven_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        tokio::fs::write(&path, r#"[{"id": "1", "title": "t"}]"#)
            .await
            .unwrap();
        let mut guidance = HashMap::new();
        guidance.insert(
            "ECONNREFUSED".to_string(),
            "Start the dev server before the tests.".to_string(),
        );
        let mut store = TaskStore::load(&path, 3)
            .await
            .with_error_path_patterns(&[r"FAIL\s+(\S+)".to_string()])
            .with_error_guidance(&guidance);

        let fix = store
            .create_fix_task("1", "FAIL tests/app.test.ts", "connect ECONNREFUSED 127.0.0.1:3000")
            .await
            .unwrap()
            .unwrap();
        assert!(fix.description.contains("tests/app.test.ts"));
        assert!(fix.description.contains("Start the dev server"));
    }

    #[test]
    fn test_extract_line_numbers_dedup() {
        let lines = extract_line_numbers("line 12 ... src/a.ts:12: ... at foo.js:40");
        assert_eq!(lines, vec![12, 40]);
    }
}
