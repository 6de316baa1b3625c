//! Pattern memory: persistent mapping from error signatures to guidance.
//!
//! A fixed set of built-in patterns is installed at construction; patterns
//! saved to disk are merged on top, with the saved occurrence count and
//! last-seen timestamp winning ties. Matched occurrences feed scoring, and
//! the top-ranked patterns are folded into the child's system prompt as
//! preventive guidance.

use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::errors::StoreError;
use crate::domain::models::pattern::ErrorPattern;
use crate::domain::models::task::Task;
use crate::infrastructure::persistence::atomic_write_json;

/// Persisted form of the memory.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PatternsFile {
    patterns: Vec<ErrorPattern>,
}

struct Entry {
    pattern: ErrorPattern,
    regex: Regex,
}

/// A pattern with its relevance score for a particular task.
#[derive(Debug, Clone)]
pub struct ScoredPattern {
    pub score: f64,
    pub pattern: ErrorPattern,
}

/// Maximum patterns folded into one guidance prompt.
const MAX_PROMPT_PATTERNS: usize = 5;

/// Occurrence contribution cap.
const MAX_OCCURRENCE_SCORE: f64 = 0.3;

/// In-memory pattern store with optional file persistence.
pub struct PatternMemory {
    entries: Vec<Entry>,
    path: Option<PathBuf>,
}

fn builtin_patterns() -> Vec<ErrorPattern> {
    vec![
        ErrorPattern::builtin(
            "removed-helpers",
            r"(?i)removed\s+(?:helper|utility)\s+functions?|helper\s+functions?\s+(?:was|were)\s+removed",
            "Never delete existing helper functions while editing a file; \
             keep all exports that other modules import.",
        ),
        ErrorPattern::builtin(
            "patch-search-not-found",
            r"(?i)(?:patch\s+)?search\s+(?:string|text)\s+not\s+found|patch_not_found",
            "Copy patch search strings verbatim from the current file content, \
             including whitespace; re-read the file before patching.",
        ),
        ErrorPattern::builtin(
            "full-file-rewrite",
            r"(?i)rewrote\s+(?:the\s+)?entire\s+file|replaced\s+the\s+whole\s+file|destructive\s+update",
            "Prefer patch operations over full-file updates for existing files; \
             a full rewrite that shrinks a file is rejected as destructive.",
        ),
        ErrorPattern::builtin(
            "missing-module",
            r"(?i)cannot\s+find\s+(?:module|name)\s+|module\s+not\s+found",
            "Verify import paths against the repository layout before referencing \
             a module; create the module first when it does not exist yet.",
        ),
        ErrorPattern::builtin(
            "syntax-error",
            r"(?i)syntax\s*error|unexpected\s+token|unexpected\s+end\s+of\s+(?:file|input)",
            "Balance braces and parentheses in every emitted file; emit complete \
             top-level declarations only.",
        ),
        ErrorPattern::builtin(
            "test-assertion-failure",
            r"(?i)assertion\s+failed|\d+\s+(?:tests?|specs?)\s+failed",
            "Run the affected tests mentally against the new code before proposing \
             it; keep test helper utilities intact.",
        ),
    ]
}

impl Default for PatternMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternMemory {
    /// Built-ins only, no persistence.
    pub fn new() -> Self {
        let entries = builtin_patterns()
            .into_iter()
            .filter_map(|pattern| {
                let regex = Regex::new(&pattern.regex).ok()?;
                Some(Entry { pattern, regex })
            })
            .collect();
        Self {
            entries,
            path: None,
        }
    }

    /// Built-ins merged with the patterns persisted at `path` (if present).
    /// Saved occurrence counts and last-seen timestamps win ties on id.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut memory = Self::new();
        memory.path = Some(path.clone());

        let saved: PatternsFile = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "pattern file unreadable; starting from built-ins");
                    PatternsFile::default()
                }
            },
            Err(_) => PatternsFile::default(),
        };

        for pattern in saved.patterns {
            memory.merge_saved(pattern);
        }
        memory
    }

    fn merge_saved(&mut self, saved: ErrorPattern) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.pattern.id == saved.id) {
            entry.pattern.occurrences = saved.occurrences;
            entry.pattern.last_seen = saved.last_seen;
            entry.pattern.files = saved.files;
            return;
        }
        match Regex::new(&saved.regex) {
            Ok(regex) => self.entries.push(Entry {
                pattern: saved,
                regex,
            }),
            Err(e) => warn!(id = %saved.id, error = %e, "skipping saved pattern with invalid regex"),
        }
    }

    /// Record an error observation. Returns the id of the matched pattern, or
    /// of a newly learned one when no pattern matched and `guidance` was
    /// supplied.
    pub fn record(
        &mut self,
        error_text: &str,
        file: Option<&str>,
        guidance: Option<&str>,
    ) -> Option<String> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.regex.is_match(error_text)) {
            entry.pattern.observe(file);
            return Some(entry.pattern.id.clone());
        }

        let guidance = guidance?;
        let snippet: String = error_text.chars().take(100).collect();
        let body = regex::escape(&snippet);
        let regex = Regex::new(&body).ok()?;

        let mut id = format!("learned-{}", Utc::now().timestamp_millis());
        let mut bump = 0;
        while self.entries.iter().any(|e| e.pattern.id == id) {
            bump += 1;
            id = format!("learned-{}-{}", Utc::now().timestamp_millis(), bump);
        }

        let mut pattern = ErrorPattern {
            id: id.clone(),
            regex: body,
            guidance: guidance.to_string(),
            occurrences: 0,
            last_seen: None,
            files: Vec::new(),
            builtin: false,
        };
        pattern.observe(file);
        self.entries.push(Entry { pattern, regex });
        Some(id)
    }

    /// Score every pattern for a task and its expected target files.
    /// Built-ins are always included; learned patterns only with a positive
    /// score. Sorted highest first.
    pub fn relevant_for(&self, task: &Task, target_files: &[String]) -> Vec<ScoredPattern> {
        let task_text = format!("{} {}", task.title, task.description).to_lowercase();
        let test_task = ["test", "spec"].iter().any(|k| task_text.contains(k));
        let modify_task = ["modify", "update", "refactor", "change", "fix"]
            .iter()
            .any(|k| task_text.contains(k));

        let target_basenames: Vec<String> = target_files
            .iter()
            .filter_map(|f| basename(f))
            .collect();

        let mut scored: Vec<ScoredPattern> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let p = &entry.pattern;
                let mut score = (f64::from(p.occurrences) * 0.1).min(MAX_OCCURRENCE_SCORE);

                let shares_file = p.files.iter().filter_map(|f| basename(f)).any(|b| {
                    target_basenames.iter().any(|t| *t == b)
                });
                if shares_file {
                    score += 0.3;
                }

                let pattern_text = format!("{} {}", p.id, p.guidance).to_lowercase();
                if test_task && (pattern_text.contains("test") || pattern_text.contains("helper")) {
                    score += 0.2;
                }
                if modify_task && pattern_text.contains("patch") {
                    score += 0.2;
                }

                if !p.builtin && score <= 0.0 {
                    return None;
                }
                Some(ScoredPattern {
                    score,
                    pattern: p.clone(),
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }

    /// Prompt fragment with the top-ranked patterns, suitable for injection
    /// into the child's system prompt. Empty string when nothing applies.
    pub fn guidance_prompt(&self, task: &Task, target_files: &[String]) -> String {
        let relevant = self.relevant_for(task, target_files);
        let top: Vec<&ScoredPattern> = relevant.iter().take(MAX_PROMPT_PATTERNS).collect();
        if top.is_empty() {
            return String::new();
        }

        let mut prompt = String::from("## Known failure patterns in this project\n\n");
        prompt.push_str("Avoid repeating these mistakes:\n");
        for (i, scored) in top.iter().enumerate() {
            let p = &scored.pattern;
            prompt.push_str(&format!("{}. {}", i + 1, p.guidance));
            if p.occurrences > 0 {
                prompt.push_str(&format!(" (seen {} time(s))", p.occurrences));
            }
            prompt.push('\n');
        }
        prompt
    }

    /// Persist patterns that carry state: every learned pattern plus any
    /// built-in that has been observed.
    pub async fn save(&self) -> Result<(), StoreError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let file = PatternsFile {
            patterns: self
                .entries
                .iter()
                .filter(|e| !e.pattern.builtin || e.pattern.occurrences > 0)
                .map(|e| e.pattern.clone())
                .collect(),
        };
        atomic_write_json(path.as_path(), &file, |v| {
            v.get("patterns").map(serde_json::Value::is_array).unwrap_or(false)
        })
        .await
    }

    /// All patterns, built-ins first (insertion order).
    pub fn patterns(&self) -> Vec<&ErrorPattern> {
        self.entries.iter().map(|e| &e.pattern).collect()
    }

    /// Look up one pattern by id.
    pub fn get(&self, id: &str) -> Option<&ErrorPattern> {
        self.entries
            .iter()
            .map(|e| &e.pattern)
            .find(|p| p.id == id)
    }
}

fn basename(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}
