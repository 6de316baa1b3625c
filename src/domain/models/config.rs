//! Configuration model.
//!
//! Field names are camelCase on disk to stay compatible with the historical
//! config files (`taskMaster.tasksPath`, `sessionManagement.maxSessionAge`,
//! ...). Defaults here are the base of the figment merge in
//! `infrastructure::config`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Task-file location settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMasterConfig {
    pub tasks_path: PathBuf,
}

impl Default for TaskMasterConfig {
    fn default() -> Self {
        Self {
            tasks_path: PathBuf::from(".devloop/tasks.json"),
        }
    }
}

/// Metrics persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    pub path: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".devloop/metrics"),
        }
    }
}

/// Child-session lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionManagementConfig {
    /// Seconds before an idle session is pruned.
    pub max_session_age: u64,
    /// History ring capacity per session.
    pub max_history_items: usize,
}

impl Default for SessionManagementConfig {
    fn default() -> Self {
        Self {
            max_session_age: 3600,
            max_history_items: 100,
        }
    }
}

/// Framework-level rules and error heuristics, unioned across the overlay
/// chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameworkConfig {
    #[serde(default)]
    pub rules: Vec<String>,
    /// Regex patterns (with one capture group) for extracting file paths from
    /// error output.
    #[serde(default)]
    pub error_path_patterns: Vec<String>,
    /// Extra guidance keyed by an error-text substring.
    #[serde(default)]
    pub error_guidance: HashMap<String, String>,
}

/// Codebase scanning settings, unioned across the overlay chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodebaseConfig {
    #[serde(default)]
    pub search_dirs: Vec<String>,
    #[serde(default)]
    pub exclude_dirs: Vec<String>,
    #[serde(default)]
    pub ignore_globs: Vec<String>,
}

/// Hook command lists, unioned across the overlay chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HooksConfig {
    #[serde(default)]
    pub pre_test: Vec<String>,
    #[serde(default)]
    pub post_apply: Vec<String>,
}

/// One monitor threshold: trip when `count` matching events occur within
/// `window_ms`, or the event rate exceeds `rate` per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueThreshold {
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub rate: Option<f64>,
    pub window_ms: u64,
    /// Confidence attached to the proposed remediation, 0..=1.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Apply the fix without approval when confidence clears the bar.
    #[serde(default)]
    pub auto_action: bool,
}

fn default_confidence() -> f64 {
    0.5
}

/// Monitor / intervention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Bus polling interval in seconds.
    pub polling_interval: u64,
    /// Thresholds keyed by issue type (an event-type string).
    #[serde(default)]
    pub thresholds: HashMap<String, IssueThreshold>,
    /// Remediation action names keyed by issue type.
    #[serde(default)]
    pub actions: HashMap<String, String>,
    /// Cap on interventions per hour.
    pub max_interventions_per_hour: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            polling_interval: 5,
            thresholds: HashMap::new(),
            actions: HashMap::new(),
            max_interventions_per_hour: 10,
        }
    }
}

/// IPC supervisor tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcConfig {
    /// `wait_for_result` timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 300_000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error.
    pub level: String,
    /// One of json, pretty.
    pub format: String,
    /// Optional log file directory; stderr when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            dir: None,
        }
    }
}

/// Top-level configuration consumed at scheduler entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub max_retries: u32,
    #[serde(default)]
    pub task_master: TaskMasterConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub session_management: SessionManagementConfig,
    #[serde(default)]
    pub framework: FrameworkConfig,
    #[serde(default)]
    pub codebase: CodebaseConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// External test command, run from the repo root; exit code plus merged
    /// output form the test outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    /// Test command timeout in seconds.
    pub test_timeout_secs: u64,
    /// Optional external compiler command for syntax screening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler_check_command: Option<String>,
    /// Compiler check timeout in seconds.
    pub compiler_check_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 3,
            task_master: TaskMasterConfig::default(),
            metrics: MetricsConfig::default(),
            session_management: SessionManagementConfig::default(),
            framework: FrameworkConfig::default(),
            codebase: CodebaseConfig::default(),
            hooks: HooksConfig::default(),
            monitor: MonitorConfig::default(),
            ipc: IpcConfig::default(),
            logging: LoggingConfig::default(),
            test_command: None,
            test_timeout_secs: 300,
            compiler_check_command: None,
            compiler_check_timeout_secs: 30,
        }
    }
}
