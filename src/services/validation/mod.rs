//! Validation gate: pre-apply screening of a change-set.
//!
//! Every proposed change-set passes through here before anything touches the
//! filesystem. Checks: module boundary enforcement, destructive-update
//! detection, patch anchor verification with fuzzy recovery (which rewrites
//! the hunk's search string to the literal file substring), and best-effort
//! syntax screening with an optional out-of-process compiler check.

pub mod patch;
pub mod suggestions;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::domain::models::change_set::{ChangeSet, FileOp};
use crate::domain::models::event::{EmitOpts, EventSeverity};
use crate::services::event_bus::{types, EventBus};

pub use patch::{match_anchor, AnchorMatch};
pub use suggestions::{suggestion_for, RecoveryAction, RecoverySuggestion};

/// Validation error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Boundary,
    Destructive,
    FileNotFound,
    PatchNotFound,
    Syntax,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boundary => "boundary",
            Self::Destructive => "destructive",
            Self::FileNotFound => "file_not_found",
            Self::PatchNotFound => "patch_not_found",
            Self::Syntax => "syntax",
        }
    }
}

/// Severity class of a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Fails the task immediately.
    Blocking,
    /// Flows back to the child as guidance on the next attempt.
    Recoverable,
}

/// One validation error with its remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub category: ErrorCategory,
    pub class: ErrorClass,
    pub file: String,
    pub message: String,
    pub suggestion: RecoverySuggestion,
}

/// A non-fatal observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationWarning {
    pub file: String,
    pub message: String,
}

/// Outcome of validating one change-set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    /// Whether any error fails the task immediately.
    pub fn has_blocking(&self) -> bool {
        self.errors.iter().any(|e| e.class == ErrorClass::Blocking)
    }

    /// One-line-per-error summary used as a fix task's error description.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("[{}] {}: {}", e.category.as_str(), e.file, e.message))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Destructive-update rule thresholds.
const DESTRUCTIVE_MIN_LINES: usize = 100;
const DESTRUCTIVE_RATIO: f64 = 0.5;
const LARGE_FILE_LINES: usize = 500;

static ANON_FUNCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bfunction\s*\(").expect("anon function regex"));
static TRIPLE_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\}\s*\}\s*\}\s*$").expect("triple close regex"));
static IMPORT_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)cannot find module|module not found|unresolved import|cannot resolve")
        .expect("import error regex")
});

/// The gate. One instance per scheduler; the histogram is internal state
/// exported on request.
pub struct ValidationGate {
    root: PathBuf,
    bus: Arc<EventBus>,
    compiler_command: Option<String>,
    compiler_timeout: Duration,
    /// `{category}:{extension}` counts for periodic export.
    histogram: Mutex<HashMap<String, u64>>,
}

impl ValidationGate {
    pub fn new(root: impl Into<PathBuf>, bus: Arc<EventBus>) -> Self {
        Self {
            root: root.into(),
            bus,
            compiler_command: None,
            compiler_timeout: Duration::from_secs(30),
            histogram: Mutex::new(HashMap::new()),
        }
    }

    /// Enable the out-of-process compiler check.
    pub fn with_compiler_check(mut self, command: impl Into<String>, timeout: Duration) -> Self {
        self.compiler_command = Some(command.into());
        self.compiler_timeout = timeout;
        self
    }

    /// Validate a change-set against the filesystem and, when provided, the
    /// task's allowed-path boundary. Patch hunks recovered fuzzily are
    /// rewritten in place so their search text is a literal file substring.
    pub async fn validate(
        &self,
        changes: &mut ChangeSet,
        allowed_paths: Option<&[String]>,
    ) -> ValidationReport {
        let mut report = ValidationReport {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        for operation in &mut changes.operations {
            let path = operation.path.clone();
            let absolute = self.root.join(&path);
            let existing = tokio::fs::read_to_string(&absolute).await.ok();

            // Module boundary: non-create operations must stay inside the
            // declared target set.
            if !matches!(operation.op, FileOp::Create { .. }) {
                if let Some(allowed) = allowed_paths {
                    if !path_allowed(&path, allowed) {
                        self.push_error(
                            &mut report,
                            ErrorCategory::Boundary,
                            ErrorClass::Blocking,
                            &path,
                            format!("{path} is not among the task's declared target files"),
                            None,
                        );
                        continue;
                    }
                }
            }

            match &mut operation.op {
                FileOp::Create { content } => {
                    if existing.is_some() {
                        report.warnings.push(ValidationWarning {
                            file: path.clone(),
                            message: "create target already exists; treating as update".to_string(),
                        });
                        self.check_destructive(&mut report, &path, existing.as_deref(), content);
                    }
                    self.check_syntax(&mut report, &path, content).await;
                }
                FileOp::Update { content } => {
                    match existing.as_deref() {
                        Some(old) => {
                            if old.lines().count() > LARGE_FILE_LINES {
                                report.warnings.push(ValidationWarning {
                                    file: path.clone(),
                                    message: format!(
                                        "updating a large file ({} lines); prefer patches",
                                        old.lines().count()
                                    ),
                                });
                            }
                            self.check_destructive(&mut report, &path, Some(old), content);
                        }
                        None => {
                            report.warnings.push(ValidationWarning {
                                file: path.clone(),
                                message: "update target does not exist; it will be created"
                                    .to_string(),
                            });
                        }
                    }
                    self.check_syntax(&mut report, &path, content).await;
                }
                FileOp::Patch { patches } => match existing.as_deref() {
                    None => {
                        self.push_error(
                            &mut report,
                            ErrorCategory::FileNotFound,
                            ErrorClass::Recoverable,
                            &path,
                            format!("{path} does not exist; patch requires an existing file"),
                            None,
                        );
                    }
                    Some(content) => {
                        for hunk in patches.iter_mut() {
                            match match_anchor(content, &hunk.search) {
                                AnchorMatch::Exact => {}
                                AnchorMatch::Fuzzy { rewritten } => {
                                    debug!(file = %path, "patch anchor recovered fuzzily");
                                    hunk.search = rewritten;
                                }
                                AnchorMatch::NotFound { similar } => {
                                    let detail = similar.map(|(line, text)| {
                                        format!("similar content at line {line}: {}", text.trim())
                                    });
                                    self.push_error(
                                        &mut report,
                                        ErrorCategory::PatchNotFound,
                                        ErrorClass::Recoverable,
                                        &path,
                                        "patch search string not found in target file".to_string(),
                                        detail,
                                    );
                                }
                            }
                        }
                    }
                },
                FileOp::Delete => {
                    if existing.is_none() {
                        report.warnings.push(ValidationWarning {
                            file: path.clone(),
                            message: "delete target does not exist".to_string(),
                        });
                    }
                }
            }
        }

        report.valid = report.errors.is_empty();
        report
    }

    fn check_destructive(
        &self,
        report: &mut ValidationReport,
        path: &str,
        existing: Option<&str>,
        new_content: &str,
    ) {
        let Some(existing) = existing else { return };

        if is_test_file(path) {
            self.push_error(
                report,
                ErrorCategory::Destructive,
                ErrorClass::Recoverable,
                path,
                "full update of a test file is always treated as destructive".to_string(),
                None,
            );
            return;
        }

        let existing_lines = existing.lines().count();
        let new_lines = new_content.lines().count();
        if existing_lines >= DESTRUCTIVE_MIN_LINES
            && (new_lines as f64) < (existing_lines as f64) * DESTRUCTIVE_RATIO
        {
            self.push_error(
                report,
                ErrorCategory::Destructive,
                ErrorClass::Blocking,
                path,
                format!(
                    "update shrinks {path} from {existing_lines} to {new_lines} lines"
                ),
                None,
            );
        }
    }

    async fn check_syntax(&self, report: &mut ValidationReport, path: &str, content: &str) {
        // Regex heuristics: recoverable.
        let mut heuristics = Vec::new();
        if ANON_FUNCTION_RE.is_match(content) {
            heuristics.push("anonymous function expression (use a named declaration)");
        }
        if TRIPLE_CLOSE_RE.is_match(content) {
            heuristics.push("suspicious run of closing braces");
        }
        let opens = content.matches('{').count();
        let closes = content.matches('}').count();
        if opens != closes {
            heuristics.push("mismatched brace counts");
        }
        for finding in heuristics {
            self.push_error(
                report,
                ErrorCategory::Syntax,
                ErrorClass::Recoverable,
                path,
                finding.to_string(),
                None,
            );
        }

        // Out-of-process compiler check: blocking, unless every reported
        // error is an import-resolution failure.
        if let Some(ref command) = self.compiler_command {
            match self.run_compiler_check(command, path, content).await {
                Ok(Some(output)) => {
                    self.push_error(
                        report,
                        ErrorCategory::Syntax,
                        ErrorClass::Blocking,
                        path,
                        format!("compiler check failed: {output}"),
                        None,
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(file = %path, error = %e, "compiler check could not run; skipping");
                }
            }
        }
    }

    /// Run the configured compiler command against a scratch copy of the
    /// proposed content. Returns Ok(Some(summary)) when it reports errors
    /// beyond import resolution.
    async fn run_compiler_check(
        &self,
        command: &str,
        path: &str,
        content: &str,
    ) -> std::io::Result<Option<String>> {
        let extension = Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "txt".to_string());
        let scratch = std::env::temp_dir().join(format!(
            "devloop-syntax-{}-{:x}.{extension}",
            std::process::id(),
            rand::random::<u64>()
        ));
        tokio::fs::write(&scratch, content).await?;

        let invocation = format!("{command} {}", scratch.display());
        let result = tokio::time::timeout(
            self.compiler_timeout,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&invocation)
                .output(),
        )
        .await;
        let _ = tokio::fs::remove_file(&scratch).await;

        let output = match result {
            Ok(output) => output?,
            Err(_) => {
                warn!(command = %command, "compiler check timed out");
                return Ok(None);
            }
        };
        if output.status.success() {
            return Ok(None);
        }
        let merged = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let real_errors: Vec<&str> = merged
            .lines()
            .filter(|l| l.to_lowercase().contains("error"))
            .filter(|l| !IMPORT_ERROR_RE.is_match(l))
            .collect();
        if real_errors.is_empty() {
            Ok(None)
        } else {
            Ok(Some(real_errors.join("; ")))
        }
    }

    fn push_error(
        &self,
        report: &mut ValidationReport,
        category: ErrorCategory,
        class: ErrorClass,
        file: &str,
        message: String,
        detail: Option<String>,
    ) {
        let suggestion = suggestion_for(category, file, detail.as_deref());
        let issue = ValidationIssue {
            category,
            class,
            file: file.to_string(),
            message,
            suggestion,
        };

        let key = format!("{}:{}", category.as_str(), extension_of(file));
        *self.histogram.lock().expect("histogram lock").entry(key).or_insert(0) += 1;

        let severity = match class {
            ErrorClass::Blocking => EventSeverity::Error,
            ErrorClass::Recoverable => EventSeverity::Warn,
        };
        self.bus.emit(
            types::VALIDATION_ERROR,
            json!({
                "file": issue.file,
                "category": issue.category.as_str(),
                "message": issue.message,
                "suggestion": issue.suggestion,
            }),
            EmitOpts::severity(severity),
        );

        report.errors.push(issue);
    }

    /// Snapshot of the `{category}:{extension}` error histogram.
    pub fn error_histogram(&self) -> HashMap<String, u64> {
        self.histogram.lock().expect("histogram lock").clone()
    }
}

fn is_test_file(path: &str) -> bool {
    path.contains(".spec.") || path.contains(".test.")
}

fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "none".to_string())
}

/// A path is inside the boundary when it equals an allowed entry, sits under
/// an allowed entry's directory, or shares a basename with one.
fn path_allowed(path: &str, allowed: &[String]) -> bool {
    let candidate = Path::new(path);
    let candidate_base = candidate.file_name();
    allowed.iter().any(|entry| {
        if path == entry {
            return true;
        }
        let entry_path = Path::new(entry);
        if let Some(dir) = entry_path.parent() {
            if !dir.as_os_str().is_empty() && candidate.starts_with(dir) {
                return true;
            }
        }
        candidate_base.is_some() && candidate_base == entry_path.file_name()
    })
}
