//! Devloop CLI entry point.
//!
//! Thin surface over the core: `run` drives one PRD's scheduler, `tasks`
//! shows the dispatch order, `validate` screens a change-set file without
//! applying it, and `events` polls the event history a run left behind.
//! Report rendering and PRD parsing live outside this binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use devloop::domain::models::change_set::ChangeSet;
use devloop::domain::models::event::EventSeverity;
use devloop::infrastructure::config::ConfigLoader;
use devloop::infrastructure::ipc::ServerPool;
use devloop::infrastructure::logging;
use devloop::infrastructure::persistence::atomic_write_json;
use devloop::services::event_bus::{EventsFile, PollQuery};
use devloop::services::monitor::Monitor;
use devloop::services::scheduler::{ProcessLauncher, Scheduler};
use devloop::services::task_store::TaskStore;
use devloop::services::validation::ValidationGate;
use devloop::EventBus;

/// Where `run` dumps the bus history for offline `events` consumption.
const EVENTS_DUMP_PATH: &str = ".devloop/events.json";

#[derive(Parser)]
#[command(name = "devloop", version, about = "Autonomous development loop")]
struct Cli {
    /// Repository root the loop operates on.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Explicit config file (defaults to .devloop/config.yaml discovery).
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler for one PRD until all tasks are terminal.
    Run {
        /// PRD identifier (used in events, metrics, and checkpoints).
        #[arg(long)]
        prd: String,

        /// Phase identifier within the PRD.
        #[arg(long, default_value = "1")]
        phase: String,

        /// Command that launches the child agent (receives the DEVLOOP_*
        /// environment and the prompt on stdin).
        #[arg(long)]
        agent_cmd: String,

        /// Enable verbose child logging.
        #[arg(long)]
        debug: bool,
    },

    /// Print the flattened task list in dispatch order.
    Tasks,

    /// Validate a change-set JSON file against the tree without applying it.
    Validate {
        /// Path to the change-set JSON.
        changes: PathBuf,

        /// Allowed target files (module boundary), comma separated.
        #[arg(long, value_delimiter = ',')]
        allowed: Vec<String>,
    },

    /// Poll the event history of the last run, one JSON object per line.
    Events {
        /// Only events with id strictly greater than this.
        #[arg(long, default_value_t = 0)]
        since: u64,

        /// Event types to match, comma separated (e.g. task:complete).
        #[arg(long = "type", value_delimiter = ',')]
        types: Vec<String>,

        /// Severities to match, comma separated (info, warn, error, critical).
        #[arg(long, value_delimiter = ',')]
        severity: Vec<String>,

        /// Maximum number of events to print.
        #[arg(long)]
        limit: Option<usize>,

        /// Show only tasks still blocked (task:blocked without a later
        /// task:unblocked).
        #[arg(long)]
        blocked: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    let _log_guard = logging::init(&config.logging)?;

    match cli.command {
        Commands::Run {
            prd,
            phase,
            agent_cmd,
            debug,
        } => {
            let bus = Arc::new(EventBus::default());
            let pool = ServerPool::new();
            let launcher = Arc::new(ProcessLauncher {
                command: agent_cmd,
                workdir: cli.root.clone(),
            });

            // Monitor runs alongside the scheduler when thresholds are set.
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let monitor_task = if config.monitor.thresholds.is_empty() {
                None
            } else {
                let monitor = Monitor::new(bus.clone(), config.monitor.clone());
                Some(tokio::spawn(async move { monitor.run(shutdown_rx).await }))
            };

            let mut scheduler = Scheduler::new(
                prd,
                cli.root.clone(),
                config,
                bus.clone(),
                launcher,
                pool,
            )
            .await
            .with_phase(phase)
            .with_debug(debug);
            let summary = scheduler.run().await.context("scheduler run failed")?;

            let _ = shutdown_tx.send(true);
            if let Some(task) = monitor_task {
                let _ = task.await;
            }

            // Leave the bus history behind for `devloop events`.
            atomic_write_json(
                &cli.root.join(EVENTS_DUMP_PATH),
                &EventsFile {
                    events: bus.snapshot(),
                },
                |v| v.get("events").map(serde_json::Value::is_array).unwrap_or(false),
            )
            .await
            .context("persist event history")?;

            println!(
                "completed {} task(s), blocked {}, {} failed attempt(s) over {} iteration(s)",
                summary.completed, summary.blocked, summary.failed_attempts, summary.iterations
            );
        }

        Commands::Tasks => {
            let store = TaskStore::load(
                cli.root.join(&config.task_master.tasks_path),
                config.max_retries,
            )
            .await;
            for task in store.pending() {
                println!(
                    "{}\t[{}] {} ({})",
                    task.id,
                    task.priority.as_str(),
                    task.title,
                    task.status.as_str()
                );
            }
        }

        Commands::Validate { changes, allowed } => {
            let raw = tokio::fs::read_to_string(&changes)
                .await
                .with_context(|| format!("read {}", changes.display()))?;
            let mut change_set: ChangeSet =
                serde_json::from_str(&raw).context("parse change-set JSON")?;

            let bus = Arc::new(EventBus::default());
            let mut gate = ValidationGate::new(&cli.root, bus);
            if let Some(ref command) = config.compiler_check_command {
                gate = gate.with_compiler_check(
                    command.clone(),
                    Duration::from_secs(config.compiler_check_timeout_secs.clamp(10, 300)),
                );
            }
            let allowed = (!allowed.is_empty()).then_some(allowed.as_slice());
            let report = gate.validate(&mut change_set, allowed).await;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                std::process::exit(1);
            }
        }

        Commands::Events {
            since,
            types,
            severity,
            limit,
            blocked,
        } => {
            let dump_path = cli.root.join(EVENTS_DUMP_PATH);
            let history: EventsFile = match tokio::fs::read_to_string(&dump_path).await {
                Ok(raw) => serde_json::from_str(&raw)
                    .with_context(|| format!("parse {}", dump_path.display()))?,
                // No run has left a history behind yet.
                Err(_) => EventsFile::default(),
            };
            let bus = EventBus::from_history(history.events);

            if blocked {
                for event in bus.blocked_tasks() {
                    println!("{}", serde_json::to_string(&event)?);
                }
                return Ok(());
            }

            let mut query = PollQuery::since(since);
            if !types.is_empty() {
                query.types = Some(types);
            }
            if !severity.is_empty() {
                let parsed = severity
                    .iter()
                    .map(|s| {
                        EventSeverity::from_str(s)
                            .ok_or_else(|| anyhow::anyhow!("unknown severity: {s}"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                query.severity = Some(parsed);
            }
            query.limit = limit;

            for event in bus.poll(&query) {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    Ok(())
}
