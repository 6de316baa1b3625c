//! Scheduler / retry engine.
//!
//! One scheduler coordinates one PRD: it pulls the next pending task,
//! dispatches it to the child agent over IPC, screens the proposed
//! change-set through the validation gate, applies it, runs the external
//! test command, classifies the outcome, and synthesizes fix tasks until
//! every task is terminal or capped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::SchedulerError;
use crate::domain::models::checkpoint::CheckpointKind;
use crate::domain::models::config::Config;
use crate::domain::models::event::{EmitOpts, EventSeverity};
use crate::domain::models::message::MessagePayload;
use crate::domain::models::task::{Task, TaskStatus};
use crate::infrastructure::ipc::{ChildEnv, IpcServer, ServerPool};
use crate::services::apply::apply_change_set;
use crate::services::checkpoint::CheckpointService;
use crate::services::event_bus::{types, EventBus};
use crate::services::metrics::{MetricsStore, TaskRecord};
use crate::services::pattern_memory::PatternMemory;
use crate::services::session::SessionRegistry;
use crate::services::task_store::TaskStore;
use crate::services::validation::ValidationGate;

/// Launches (or reuses) the child agent process for one request. The child
/// is any executable that connects to `DEVLOOP_IPC_SOCKET`, echoes
/// `DEVLOOP_REQUEST_ID`, and eventually sends a terminal message.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, env: &ChildEnv, prompt: &str) -> Result<(), String>;
}

/// Spawns the configured agent command with the child-contract environment;
/// the prompt is fed on stdin.
pub struct ProcessLauncher {
    pub command: String,
    pub workdir: PathBuf,
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self, env: &ChildEnv, prompt: &str) -> Result<(), String> {
        use tokio::io::AsyncWriteExt;

        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workdir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        for (key, value) in env.to_env() {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| e.to_string())?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| e.to_string())?;
        }
        // The child runs independently and reports over the socket; reap it
        // in the background.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }
}

/// Result of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSummary {
    pub completed: u32,
    pub blocked: u32,
    pub failed_attempts: u32,
    pub iterations: u32,
}

enum Outcome {
    Success { tests_ran: bool },
    Failure { error: String, test_output: String },
}

/// The engine. Owns its task store, pattern memory, gate, metrics, and
/// checkpoint log; shares only the event bus and server pool.
pub struct Scheduler {
    prd_id: String,
    phase_id: String,
    session_id: String,
    root: PathBuf,
    config: Config,
    bus: Arc<EventBus>,
    store: TaskStore,
    patterns: PatternMemory,
    gate: ValidationGate,
    launcher: Arc<dyn AgentLauncher>,
    pool: Arc<ServerPool>,
    metrics: MetricsStore,
    checkpoints: CheckpointService,
    sessions: SessionRegistry,
    debug: bool,
}

impl Scheduler {
    /// Wire a scheduler for one PRD rooted at `root`.
    pub async fn new(
        prd_id: impl Into<String>,
        root: impl Into<PathBuf>,
        config: Config,
        bus: Arc<EventBus>,
        launcher: Arc<dyn AgentLauncher>,
        pool: Arc<ServerPool>,
    ) -> Self {
        let prd_id = prd_id.into();
        let root = root.into();
        let session_id = format!("{}-{}", prd_id, Uuid::new_v4().simple());

        let store = TaskStore::load(root.join(&config.task_master.tasks_path), config.max_retries)
            .await
            .with_error_path_patterns(&config.framework.error_path_patterns)
            .with_error_guidance(&config.framework.error_guidance);
        let patterns = PatternMemory::load(root.join(".devloop/patterns.json")).await;
        let mut gate = ValidationGate::new(root.clone(), bus.clone());
        if let Some(ref command) = config.compiler_check_command {
            gate = gate.with_compiler_check(
                command.clone(),
                Duration::from_secs(config.compiler_check_timeout_secs.clamp(10, 300)),
            );
        }
        let metrics = MetricsStore::load(root.join(&config.metrics.path)).await;
        let checkpoints =
            CheckpointService::load(root.join(".devloop/checkpoints.json"), root.clone(), bus.clone())
                .await;
        let sessions = SessionRegistry::new(config.session_management.clone());

        Self {
            prd_id,
            phase_id: "1".to_string(),
            session_id,
            root,
            config,
            bus,
            store,
            patterns,
            gate,
            launcher,
            pool,
            metrics,
            checkpoints,
            sessions,
            debug: false,
        }
    }

    /// Set the phase this scheduler is executing (used in metrics and
    /// checkpoint keys).
    pub fn with_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = phase_id.into();
        self
    }

    /// Enable verbose child logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Run iterations until no schedulable task remains.
    ///
    /// Fatal failures (task-store persistence, IPC server start) abort the
    /// run with the error preserved; per-task failures feed the retry
    /// machinery instead.
    pub async fn run(&mut self) -> Result<SchedulerSummary, SchedulerError> {
        let server = IpcServer::new(self.session_id.clone(), self.bus.clone(), self.debug);
        let socket = server.start(&self.pool).await?;
        info!(prd = %self.prd_id, session = %self.session_id, "scheduler started");

        let mut summary = SchedulerSummary::default();
        let run_result = self.run_loop(&server, &socket, &mut summary).await;

        server.stop().await;
        self.pool.deregister(&self.session_id);
        self.patterns.save().await?;
        self.sessions.prune_stale();

        let result = run_result.map(|()| summary);
        if let Ok(ref summary) = result {
            info!(
                prd = %self.prd_id,
                completed = summary.completed,
                blocked = summary.blocked,
                "scheduler finished"
            );
        }
        result
    }

    async fn run_loop(
        &mut self,
        server: &IpcServer,
        socket: &std::path::Path,
        summary: &mut SchedulerSummary,
    ) -> Result<(), SchedulerError> {
        loop {
            let Some(task) = self.store.pending().first().map(|t| (*t).clone()) else {
                break;
            };
            summary.iterations += 1;

            let guidance = self.patterns.guidance_prompt(&task, &task.target_files);
            self.store
                .update_status(&task.id, TaskStatus::InProgress)
                .await?;

            let request_id = format!("{}-{}", task.id, Utc::now().timestamp_millis());
            let env = ChildEnv {
                socket: socket.to_path_buf(),
                session_id: self.session_id.clone(),
                request_id: request_id.clone(),
                debug: self.debug,
            };
            let prompt = build_prompt(&task, &guidance);
            let started = std::time::Instant::now();

            let outcome = self.execute(server, &task, &env, &prompt).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Outcome::Success { tests_ran } => {
                    self.store.update_status(&task.id, TaskStatus::Done).await?;
                    self.resolve_fix_lineage(&task).await?;
                    self.sessions.record_exchange(
                        &self.session_id,
                        &request_id,
                        &prompt,
                        Some("complete".to_string()),
                        None,
                    );
                    self.bus.emit(
                        types::TASK_COMPLETE,
                        json!({ "durationMs": duration_ms, "testsRan": tests_ran }),
                        EmitOpts::for_task(task.id.clone()).with_prd(self.prd_id.clone()),
                    );
                    self.record_metrics(&task, true, duration_ms, tests_ran).await?;
                    self.checkpoints
                        .create(
                            &self.prd_id.clone(),
                            &self.phase_id.clone(),
                            CheckpointKind::TaskCompletion,
                        )
                        .await?;
                    summary.completed += 1;
                }
                Outcome::Failure { error, test_output } => {
                    summary.failed_attempts += 1;
                    self.sessions.record_exchange(
                        &self.session_id,
                        &request_id,
                        &prompt,
                        None,
                        Some(error.clone()),
                    );
                    self.patterns
                        .record(&error, task.target_files.first().map(String::as_str), None);
                    self.patterns.save().await?;
                    self.record_metrics(&task, false, duration_ms, false).await?;
                    self.bus.emit(
                        types::TASK_FAILED,
                        json!({
                            "error": error,
                            "retryCount": self.store.retry_count(&task.id),
                        }),
                        EmitOpts::for_task(task.id.clone())
                            .with_severity(EventSeverity::Error)
                            .with_prd(self.prd_id.clone()),
                    );

                    match self
                        .store
                        .create_fix_task(&task.id, &error, &test_output)
                        .await?
                    {
                        Some(fix) => {
                            // The fix task is the retry vehicle; the failed
                            // task leaves the schedulable set until its fix
                            // lineage resolves.
                            self.store
                                .update_status(&task.id, TaskStatus::Blocked)
                                .await?;
                            self.bus.emit(
                                types::TASK_FIX_CREATED,
                                json!({ "fixTaskId": fix.id, "originalTaskId": task.id }),
                                EmitOpts::for_task(task.id.clone()).with_prd(self.prd_id.clone()),
                            );
                        }
                        None => {
                            summary.blocked += 1;
                            self.bus.emit(
                                types::TASK_BLOCKED,
                                json!({
                                    "reason": "retry budget exhausted",
                                    "retryCount": self.store.retry_count(&task.id),
                                    "lastError": error,
                                }),
                                EmitOpts::for_task(task.base_id())
                                    .with_severity(EventSeverity::Critical)
                                    .with_prd(self.prd_id.clone()),
                            );
                        }
                    }
                }
            }
        }

        // Every task terminal and none blocked: the phase is complete.
        if !self.store.all_tasks().is_empty()
            && self
                .store
                .all_tasks()
                .iter()
                .all(|t| t.status == TaskStatus::Done)
        {
            self.checkpoints
                .create(
                    &self.prd_id.clone(),
                    &self.phase_id.clone(),
                    CheckpointKind::PhaseCompletion,
                )
                .await?;
        }
        Ok(())
    }

    /// A completed fix task resolves every blocked ancestor in its lineage:
    /// each is marked done and a `task:unblocked` event supersedes the
    /// earlier failure.
    async fn resolve_fix_lineage(&mut self, task: &Task) -> Result<(), SchedulerError> {
        let mut ancestor = task.id.clone();
        while let Some(previous) = crate::domain::models::task::strip_fix_wrapper(&ancestor) {
            ancestor = previous;
            let Some(status) = self.store.get(&ancestor).map(|t| t.status) else {
                continue;
            };
            if status != TaskStatus::Done {
                self.store.update_status(&ancestor, TaskStatus::Done).await?;
                self.bus.emit(
                    types::TASK_UNBLOCKED,
                    json!({ "resolvedBy": task.id }),
                    EmitOpts::for_task(ancestor.clone()).with_prd(self.prd_id.clone()),
                );
            }
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        server: &IpcServer,
        task: &Task,
        env: &ChildEnv,
        prompt: &str,
    ) -> Outcome {
        if let Err(e) = self.launcher.launch(env, prompt).await {
            return Outcome::Failure {
                error: format!("agent launch failed: {e}"),
                test_output: String::new(),
            };
        }

        let timeout = Duration::from_millis(self.config.ipc.request_timeout_ms);
        let Some(message) = server.wait_for_result(&env.request_id, timeout).await else {
            return Outcome::Failure {
                error: "timeout".to_string(),
                test_output: String::new(),
            };
        };

        match message.payload {
            MessagePayload::Error { error } => Outcome::Failure {
                error,
                test_output: String::new(),
            },
            MessagePayload::Complete { success: false, summary } => Outcome::Failure {
                error: summary.unwrap_or_else(|| "agent reported failure".to_string()),
                test_output: String::new(),
            },
            // Completion without changes: the agent believes the tree is
            // already correct; the tests decide.
            MessagePayload::Complete { success: true, .. } => self.test_and_classify().await,
            MessagePayload::CodeChanges { changes } => {
                let mut changes = changes;
                let allowed = (!task.target_files.is_empty()).then_some(task.target_files.as_slice());
                let report = self.gate.validate(&mut changes, allowed).await;
                if !report.valid {
                    return Outcome::Failure {
                        error: report.summary(),
                        test_output: String::new(),
                    };
                }

                match apply_change_set(&self.root, &changes).await {
                    Err(e) => Outcome::Failure {
                        error: e.to_string(),
                        test_output: String::new(),
                    },
                    Ok(touched) => {
                        info!(task = %task.id, files = touched.len(), "change-set applied");
                        self.run_hooks(&self.config.hooks.post_apply.clone()).await;
                        self.test_and_classify().await
                    }
                }
            }
            // wait_for_result only yields terminal payloads.
            _ => Outcome::Failure {
                error: "unexpected non-terminal message".to_string(),
                test_output: String::new(),
            },
        }
    }

    /// Run the external test command and classify the task outcome.
    async fn test_and_classify(&self) -> Outcome {
        self.run_hooks(&self.config.hooks.pre_test).await;

        let Some(ref command) = self.config.test_command else {
            return Outcome::Success { tests_ran: false };
        };

        let timeout = Duration::from_secs(self.config.test_timeout_secs.clamp(10, 300));
        match run_command(command, &self.root, timeout).await {
            Ok((true, _)) => Outcome::Success { tests_ran: true },
            Ok((false, output)) => Outcome::Failure {
                error: "tests failed".to_string(),
                test_output: output,
            },
            Err(e) => Outcome::Failure {
                error: format!("test command failed to run: {e}"),
                test_output: String::new(),
            },
        }
    }

    async fn run_hooks(&self, hooks: &[String]) {
        for hook in hooks {
            match run_command(hook, &self.root, Duration::from_secs(60)).await {
                Ok((true, _)) => {}
                Ok((false, output)) => {
                    warn!(hook = %hook, output = %output.chars().take(200).collect::<String>(), "hook failed");
                }
                Err(e) => warn!(hook = %hook, error = %e, "hook did not run"),
            }
        }
    }

    async fn record_metrics(
        &mut self,
        task: &Task,
        succeeded: bool,
        duration_ms: u64,
        tests_ran: bool,
    ) -> Result<(), SchedulerError> {
        self.metrics
            .record(TaskRecord {
                task_id: task.id.clone(),
                prd_id: self.prd_id.clone(),
                phase_id: self.phase_id.clone(),
                set_id: None,
                succeeded,
                duration_ms,
                input_tokens: 0,
                output_tokens: 0,
                tests_passed: u32::from(succeeded && tests_ran),
                tests_failed: u32::from(!succeeded && tests_ran),
                recorded_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

/// Assemble the child's prompt: task identity, description, details, and the
/// pattern memory's preventive guidance.
fn build_prompt(task: &Task, guidance: &str) -> String {
    let mut prompt = format!("# Task {}: {}\n\n{}\n", task.id, task.title, task.description);
    if let Some(ref details) = task.details {
        prompt.push_str(&format!("\n## Details\n{details}\n"));
    }
    if !task.target_files.is_empty() {
        prompt.push_str(&format!(
            "\n## Target files\n{}\n",
            task.target_files.join("\n")
        ));
    }
    if !guidance.is_empty() {
        prompt.push('\n');
        prompt.push_str(guidance);
    }
    prompt
}

/// Run a shell command in `dir`, bounded by `timeout`. Returns (success,
/// merged stdout/stderr).
async fn run_command(
    command: &str,
    dir: &std::path::Path,
    timeout: Duration,
) -> Result<(bool, String), SchedulerError> {
    let result = tokio::time::timeout(
        timeout,
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .output(),
    )
    .await;

    match result {
        Err(_) => Ok((false, format!("command timed out after {}s", timeout.as_secs()))),
        Ok(Err(e)) => Err(SchedulerError::Command {
            command: command.to_string(),
            reason: e.to_string(),
        }),
        Ok(Ok(output)) => {
            let merged = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            Ok((output.status.success(), merged))
        }
    }
}
