//! Hierarchical metrics: task → phase → PRD → PRD-set accumulators.
//!
//! Each level is persisted to its own file through the atomic writer and
//! indexed by a composite key (`{prdId}-{phaseId}` for phases). Derived
//! fields are recomputed on every update; the per-task history is bounded
//! with oldest-first eviction.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::StoreError;
use crate::infrastructure::persistence::atomic_write_json;

/// Bound on stored per-task history entries.
pub const MAX_TASK_HISTORY: usize = 10_000;

/// One finished task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub prd_id: String,
    pub phase_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_id: Option<String>,
    pub succeeded: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub tests_passed: u32,
    #[serde(default)]
    pub tests_failed: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate statistics at one level (phase, PRD, or PRD-set).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelStats {
    pub task_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tests_passed: u64,
    pub tests_failed: u64,
    pub success_rate: f64,
}

impl LevelStats {
    fn absorb(&mut self, record: &TaskRecord) {
        self.task_count += 1;
        if record.succeeded {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.total_duration_ms += record.duration_ms;
        self.input_tokens += record.input_tokens;
        self.output_tokens += record.output_tokens;
        self.tests_passed += u64::from(record.tests_passed);
        self.tests_failed += u64::from(record.tests_failed);
        // Derived fields recomputed on every update.
        self.avg_duration_ms = self.total_duration_ms as f64 / self.task_count as f64;
        self.success_rate = self.success_count as f64 / self.task_count as f64;
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TasksHistoryFile {
    tasks: VecDeque<TaskRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LevelFile {
    entries: HashMap<String, LevelStats>,
}

/// Metrics store for one scheduler, rooted at a directory.
pub struct MetricsStore {
    dir: PathBuf,
    tasks: VecDeque<TaskRecord>,
    phases: HashMap<String, LevelStats>,
    prds: HashMap<String, LevelStats>,
    sets: HashMap<String, LevelStats>,
}

impl MetricsStore {
    /// Load existing metrics from `dir` (missing files start empty).
    pub async fn load(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let tasks = read_json::<TasksHistoryFile>(&dir.join("tasks.json"))
            .await
            .map(|f| f.tasks)
            .unwrap_or_default();
        let phases = read_level(&dir.join("phases.json")).await;
        let prds = read_level(&dir.join("prds.json")).await;
        let sets = read_level(&dir.join("sets.json")).await;
        Self {
            dir,
            tasks,
            phases,
            prds,
            sets,
        }
    }

    /// Record one task execution at every level and persist.
    pub async fn record(&mut self, record: TaskRecord) -> Result<(), StoreError> {
        let phase_key = format!("{}-{}", record.prd_id, record.phase_id);
        self.phases.entry(phase_key).or_default().absorb(&record);
        self.prds
            .entry(record.prd_id.clone())
            .or_default()
            .absorb(&record);
        if let Some(ref set_id) = record.set_id {
            self.sets.entry(set_id.clone()).or_default().absorb(&record);
        }

        self.tasks.push_back(record);
        while self.tasks.len() > MAX_TASK_HISTORY {
            self.tasks.pop_front();
        }

        self.save().await
    }

    /// Persist every level independently.
    pub async fn save(&self) -> Result<(), StoreError> {
        atomic_write_json(
            &self.dir.join("tasks.json"),
            &TasksHistoryFile {
                tasks: self.tasks.clone(),
            },
            |v| v.get("tasks").map(serde_json::Value::is_array).unwrap_or(false),
        )
        .await?;
        for (name, entries) in [
            ("phases.json", &self.phases),
            ("prds.json", &self.prds),
            ("sets.json", &self.sets),
        ] {
            atomic_write_json(
                &self.dir.join(name),
                &LevelFile {
                    entries: entries.clone(),
                },
                |v| v.get("entries").map(serde_json::Value::is_object).unwrap_or(false),
            )
            .await?;
        }
        Ok(())
    }

    pub fn task_history(&self) -> &VecDeque<TaskRecord> {
        &self.tasks
    }

    pub fn phase(&self, prd_id: &str, phase_id: &str) -> Option<&LevelStats> {
        self.phases.get(&format!("{prd_id}-{phase_id}"))
    }

    pub fn prd(&self, prd_id: &str) -> Option<&LevelStats> {
        self.prds.get(prd_id)
    }

    pub fn set(&self, set_id: &str) -> Option<&LevelStats> {
        self.sets.get(set_id)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Option<T> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    serde_json::from_str(&contents).ok()
}

async fn read_level(path: &std::path::Path) -> HashMap<String, LevelStats> {
    read_json::<LevelFile>(path)
        .await
        .map(|f| f.entries)
        .unwrap_or_default()
}
