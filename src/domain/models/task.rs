//! Task domain model and the historical tasks-file shapes.
//!
//! Tasks are the smallest unit of scheduler work. On disk they may carry
//! nested subtasks; in memory the scheduler only ever sees the flattened
//! form, where a subtask becomes a top-level entry with a synthetic
//! `<parentId>.<subtaskId>` identifier.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

/// Status of a task in the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Task is waiting to be scheduled
    Pending,
    /// Task has been dispatched to the agent (resumed first after restart)
    InProgress,
    /// Task completed successfully
    Done,
    /// Task exhausted its retry budget or is held by a failed dependency
    Blocked,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in-progress" | "in_progress" => Some(Self::InProgress),
            "done" | "complete" | "completed" => Some(Self::Done),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Blocked)
    }

    /// Check if the scheduler may still pick this task up.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// Priority level for tasks. Lower rank schedules first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" | "normal" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Scheduling rank: critical sorts before high before medium before low.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

/// Accept task identifiers written either as JSON strings or bare integers.
fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Int(i64),
    }
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Str(s) => s,
        RawId::Int(n) => n.to_string(),
    })
}

fn de_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Int(i64),
    }
    let raw = Vec::<RawId>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|r| match r {
            RawId::Str(s) => s,
            RawId::Int(n) => n.to_string(),
        })
        .collect())
}

/// A task as the scheduler sees it: flattened, no nested subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable identifier: string form of an integer, `<parent>.<sub>` for
    /// flattened subtasks, or `fix-<parentId>-<epochMs>` for fix tasks.
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, deserialize_with = "de_ids")]
    pub dependencies: Vec<String>,
    /// Free-form implementation notes carried through from the PRD parser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Set on subtasks after flattening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Repo-relative files this task is expected to touch; used as the
    /// validation gate's module boundary.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_files: Vec<String>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::default(),
            priority: TaskPriority::default(),
            dependencies: Vec::new(),
            details: None,
            parent_id: None,
            target_files: Vec::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Add a dependency.
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if id != self.id && !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    /// Set the expected target files.
    pub fn with_target_files(mut self, files: Vec<String>) -> Self {
        self.target_files = files;
        self
    }

    /// Whether this is a synthesized fix task.
    pub fn is_fix(&self) -> bool {
        is_fix_id(&self.id)
    }

    /// The base identifier used for retry accounting.
    pub fn base_id(&self) -> String {
        base_task_id(&self.id)
    }
}

static FIX_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^fix-(.+)-\d+$").expect("fix id regex"));

/// Whether an identifier carries at least one `fix-…-<epochMs>` wrapper.
pub fn is_fix_id(id: &str) -> bool {
    FIX_ID_RE.is_match(id)
}

/// Strip `fix-…-<digits>` wrappers recursively to recover the base id that
/// keys the retry counter.
pub fn base_task_id(id: &str) -> String {
    let mut current = id.to_string();
    while let Some(caps) = FIX_ID_RE.captures(&current) {
        current = caps[1].to_string();
    }
    current
}

/// Remove a single `fix-…-<digits>` wrapper, yielding the immediate
/// predecessor in the retry lineage. `None` for non-fix identifiers.
pub fn strip_fix_wrapper(id: &str) -> Option<String> {
    FIX_ID_RE.captures(id).map(|caps| caps[1].to_string())
}

/// A task as persisted: may nest one level of subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTask {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, deserialize_with = "de_ids")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Retained only for orphaned flattened subtasks whose parent vanished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<StoredTask>>,
}

impl StoredTask {
    fn from_flat(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            priority: task.priority,
            dependencies: task.dependencies.clone(),
            details: task.details.clone(),
            parent_id: None,
            target_files: task.target_files.clone(),
            subtasks: None,
        }
    }
}

/// Tasks-file metadata; only `updated` is maintained by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TasksMetadata {
    pub updated: DateTime<Utc>,
}

/// The canonical `master` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterDoc {
    pub tasks: Vec<StoredTask>,
    pub metadata: TasksMetadata,
}

/// The three historical on-disk shapes. Reads accept any of them; writes
/// always produce [`TasksFile::Master`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TasksFile {
    /// `{ "master": { "tasks": [...], "metadata": {...} } }`
    Master { master: MasterDoc },
    /// `{ "tasks": [...] }`
    Tagged {
        tasks: Vec<StoredTask>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<TasksMetadata>,
    },
    /// `[ Task, ... ]`
    Array(Vec<StoredTask>),
}

impl TasksFile {
    /// Build the canonical master shape around a nested task list.
    pub fn master(tasks: Vec<StoredTask>) -> Self {
        Self::Master {
            master: MasterDoc {
                tasks,
                metadata: TasksMetadata { updated: Utc::now() },
            },
        }
    }

    /// The nested task list, whatever shape the file was in.
    pub fn into_tasks(self) -> Vec<StoredTask> {
        match self {
            Self::Master { master } => master.tasks,
            Self::Tagged { tasks, .. } => tasks,
            Self::Array(tasks) => tasks,
        }
    }

    /// Flatten nested subtasks into top-level entries with synthetic
    /// `<parentId>.<subtaskId>` identifiers and `parent_id` set.
    pub fn flatten(self) -> Vec<Task> {
        let mut flat = Vec::new();
        for stored in self.into_tasks() {
            let parent_id = stored.id.clone();
            let subtasks = stored.subtasks.clone();
            flat.push(Task {
                id: stored.id,
                title: stored.title,
                description: stored.description,
                status: stored.status,
                priority: stored.priority,
                dependencies: stored.dependencies,
                details: stored.details,
                parent_id: stored.parent_id,
                target_files: stored.target_files,
            });
            for sub in subtasks.into_iter().flatten() {
                flat.push(Task {
                    id: format!("{}.{}", parent_id, sub.id),
                    title: sub.title,
                    description: sub.description,
                    status: sub.status,
                    priority: sub.priority,
                    dependencies: sub.dependencies,
                    details: sub.details,
                    parent_id: Some(parent_id.clone()),
                    target_files: sub.target_files,
                });
            }
        }
        flat
    }

    /// Rebuild the nested representation from a flattened list, restoring
    /// subtasks under their parents. Orphans (parent no longer present) stay
    /// top-level with their `parent_id` preserved.
    pub fn nest(flat: &[Task]) -> Vec<StoredTask> {
        let mut nested: Vec<StoredTask> = Vec::new();
        for task in flat.iter().filter(|t| t.parent_id.is_none()) {
            nested.push(StoredTask::from_flat(task));
        }
        for task in flat.iter().filter(|t| t.parent_id.is_some()) {
            let parent_id = task.parent_id.as_deref().unwrap_or_default();
            let bare_id = task
                .id
                .strip_prefix(&format!("{parent_id}."))
                .unwrap_or(&task.id)
                .to_string();
            match nested.iter_mut().find(|p| p.id == parent_id) {
                Some(parent) => {
                    let mut sub = StoredTask::from_flat(task);
                    sub.id = bare_id;
                    parent.subtasks.get_or_insert_with(Vec::new).push(sub);
                }
                None => {
                    let mut orphan = StoredTask::from_flat(task);
                    orphan.parent_id = task.parent_id.clone();
                    nested.push(orphan);
                }
            }
        }
        nested
    }
}
