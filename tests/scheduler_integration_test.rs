//! Scheduler end-to-end: a fake agent launcher connects back over the real
//! IPC socket and plays scripted responses, driving the full
//! propose-validate-apply-test-retry cycle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use devloop::domain::models::change_set::{ChangeSet, FileOp, FileOperation};
use devloop::domain::models::config::Config;
use devloop::domain::models::task::TaskStatus;
use devloop::infrastructure::ipc::{ChildEnv, IpcClient, ServerPool};
use devloop::services::event_bus::{types, PollQuery};
use devloop::services::scheduler::{AgentLauncher, Scheduler};
use devloop::EventBus;

#[derive(Clone)]
enum FakeResponse {
    CodeChanges(ChangeSet),
    Error(String),
    Complete { success: bool },
    Silent,
}

/// Plays one scripted response per launch by connecting the real IPC client
/// back to the supervisor socket.
struct FakeAgent {
    script: std::sync::Mutex<VecDeque<FakeResponse>>,
}

impl FakeAgent {
    fn new(responses: Vec<FakeResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: std::sync::Mutex::new(responses.into()),
        })
    }
}

#[async_trait]
impl AgentLauncher for FakeAgent {
    async fn launch(&self, env: &ChildEnv, _prompt: &str) -> Result<(), String> {
        let response = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FakeResponse::Error("script exhausted".to_string()));
        let env = env.clone();
        tokio::spawn(async move {
            if matches!(response, FakeResponse::Silent) {
                return;
            }
            let mut client = IpcClient::new(&env.socket, &env.session_id, &env.request_id);
            if !client.connect().await {
                return;
            }
            // Terminal errors are not cached server-side; give the
            // supervisor a beat to start waiting before sending.
            tokio::time::sleep(Duration::from_millis(20)).await;
            match response {
                FakeResponse::CodeChanges(changes) => {
                    client.send_status("working").await;
                    client.send_code_changes(changes).await;
                }
                FakeResponse::Error(error) => {
                    client.send_error(error).await;
                }
                FakeResponse::Complete { success } => {
                    client.send_complete(success, None).await;
                }
                FakeResponse::Silent => {}
            }
            // Let acks drain before dropping the connection.
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.close().await;
        });
        Ok(())
    }
}

fn test_config(max_retries: u32) -> Config {
    let mut config = Config::default();
    config.max_retries = max_retries;
    config.task_master.tasks_path = "tasks.json".into();
    config.metrics.path = "metrics".into();
    config.ipc.request_timeout_ms = 3_000;
    config
}

async fn write_tasks(root: &std::path::Path, json: &str) {
    tokio::fs::write(root.join("tasks.json"), json).await.unwrap();
}

fn create_op(path: &str, content: &str) -> ChangeSet {
    ChangeSet {
        operations: vec![FileOperation {
            path: path.to_string(),
            op: FileOp::Create {
                content: content.to_string(),
            },
        }],
    }
}

#[tokio::test]
async fn test_happy_path_single_task() {
    let dir = tempfile::tempdir().unwrap();
    write_tasks(
        dir.path(),
        r#"[{"id": 1, "title": "create the widget", "priority": "medium"}]"#,
    )
    .await;

    let bus = Arc::new(EventBus::default());
    let agent = FakeAgent::new(vec![FakeResponse::CodeChanges(create_op(
        "src/widget.rs",
        "pub fn widget() {}\n",
    ))]);

    let mut scheduler = Scheduler::new(
        "prd-happy",
        dir.path(),
        test_config(3),
        bus.clone(),
        agent,
        ServerPool::new(),
    )
    .await;
    let summary = scheduler.run().await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.blocked, 0);
    assert_eq!(summary.iterations, 1);

    // The file landed and the task is done.
    assert!(dir.path().join("src/widget.rs").exists());
    assert_eq!(
        scheduler.store().get("1").unwrap().status,
        TaskStatus::Done
    );

    // Exactly one task:complete event for task 1, and no fix tasks.
    let completes = bus.poll(&PollQuery::since(0).with_types(&[types::TASK_COMPLETE]));
    assert_eq!(completes.len(), 1);
    assert_eq!(completes[0].task_id.as_deref(), Some("1"));
    assert!(scheduler.store().all_tasks().iter().all(|t| !t.is_fix()));
}

#[tokio::test]
async fn test_destructive_update_produces_fix_task() {
    let dir = tempfile::tempdir().unwrap();
    let big: String = (0..400).map(|i| format!("line {i}\n")).collect();
    tokio::fs::write(dir.path().join("module.ts"), &big).await.unwrap();
    write_tasks(
        dir.path(),
        r#"[{"id": 1, "title": "trim the module", "targetFiles": ["module.ts"]}]"#,
    )
    .await;

    let shrunk: String = (0..100).map(|i| format!("line {i}\n")).collect();
    let agent = FakeAgent::new(vec![
        FakeResponse::CodeChanges(ChangeSet {
            operations: vec![FileOperation {
                path: "module.ts".to_string(),
                op: FileOp::Update { content: shrunk },
            }],
        }),
        FakeResponse::Complete { success: true },
    ]);

    let bus = Arc::new(EventBus::default());
    let mut scheduler = Scheduler::new(
        "prd-destructive",
        dir.path(),
        test_config(3),
        bus.clone(),
        agent,
        ServerPool::new(),
    )
    .await;
    let summary = scheduler.run().await.unwrap();

    // First attempt failed validation, the fix attempt succeeded.
    assert_eq!(summary.failed_attempts, 1);
    assert_eq!(summary.completed, 1);

    let fix = scheduler
        .store()
        .all_tasks()
        .iter()
        .find(|t| t.is_fix())
        .expect("fix task synthesized");
    assert!(fix.id.starts_with("fix-1-"));
    assert_eq!(fix.dependencies, vec!["1".to_string()]);
    assert!(fix.description.contains("destructive"));
    assert_eq!(scheduler.store().retry_count("1"), 1);

    // The original file was never shrunk.
    let content = tokio::fs::read_to_string(dir.path().join("module.ts"))
        .await
        .unwrap();
    assert_eq!(content, big);

    let validation_events =
        bus.poll(&PollQuery::since(0).with_types(&[types::VALIDATION_ERROR]));
    assert_eq!(validation_events.len(), 1);
}

#[tokio::test]
async fn test_cap_exceeded_blocks_task() {
    let dir = tempfile::tempdir().unwrap();
    write_tasks(dir.path(), r#"[{"id": 7, "title": "doomed task"}]"#).await;

    // Every attempt errors; maxRetries=2 allows two fix tasks, the third
    // failure blocks.
    let agent = FakeAgent::new(vec![
        FakeResponse::Error("failure one".to_string()),
        FakeResponse::Error("failure two".to_string()),
        FakeResponse::Error("failure three".to_string()),
    ]);

    let bus = Arc::new(EventBus::default());
    let mut scheduler = Scheduler::new(
        "prd-capped",
        dir.path(),
        test_config(2),
        bus.clone(),
        agent,
        ServerPool::new(),
    )
    .await;
    let summary = scheduler.run().await.unwrap();

    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.completed, 0);
    assert_eq!(
        scheduler.store().get("7").unwrap().status,
        TaskStatus::Blocked
    );
    assert_eq!(scheduler.store().retry_count("7"), 3);

    let blocked = bus.poll(&PollQuery::since(0).with_types(&[types::TASK_BLOCKED]));
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].task_id.as_deref(), Some("7"));
    assert_eq!(blocked[0].payload["retryCount"], 3);
    assert_eq!(blocked[0].payload["lastError"], "failure three");

    // Nothing schedulable remains for base 7.
    assert!(scheduler.store().pending().is_empty());
}

#[tokio::test]
async fn test_timeout_is_a_failure_outcome() {
    let dir = tempfile::tempdir().unwrap();
    write_tasks(dir.path(), r#"[{"id": 1, "title": "quiet agent"}]"#).await;

    let agent = FakeAgent::new(vec![
        FakeResponse::Silent,
        FakeResponse::Complete { success: true },
    ]);

    let mut config = test_config(3);
    config.ipc.request_timeout_ms = 200;

    let bus = Arc::new(EventBus::default());
    let mut scheduler = Scheduler::new(
        "prd-timeout",
        dir.path(),
        config,
        bus.clone(),
        agent,
        ServerPool::new(),
    )
    .await;
    let summary = scheduler.run().await.unwrap();

    assert_eq!(summary.failed_attempts, 1);
    assert_eq!(summary.completed, 1);

    let failed = bus.poll(&PollQuery::since(0).with_types(&[types::TASK_FAILED]));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload["error"], "timeout");
}

#[tokio::test]
async fn test_failing_tests_feed_fix_task_description() {
    let dir = tempfile::tempdir().unwrap();
    write_tasks(dir.path(), r#"[{"id": 1, "title": "make tests pass"}]"#).await;

    let agent = FakeAgent::new(vec![
        FakeResponse::CodeChanges(create_op("src/thing.rs", "pub fn thing() {}\n")),
        FakeResponse::Complete { success: true },
    ]);

    let mut config = test_config(3);
    // First run: the test command fails; the fix attempt runs no changes and
    // the same command... use a marker file to flip the outcome.
    config.test_command = Some(
        "if [ -f .tests-fixed ]; then exit 0; else echo 'assertion failed at src/thing.rs:12' >&2; touch .tests-fixed; exit 1; fi"
            .to_string(),
    );

    let bus = Arc::new(EventBus::default());
    let mut scheduler = Scheduler::new(
        "prd-tests",
        dir.path(),
        config,
        bus,
        agent,
        ServerPool::new(),
    )
    .await;
    let summary = scheduler.run().await.unwrap();

    assert_eq!(summary.failed_attempts, 1);
    assert_eq!(summary.completed, 1);

    let fix = scheduler
        .store()
        .all_tasks()
        .iter()
        .find(|t| t.is_fix())
        .expect("fix task");
    assert!(fix.description.contains("assertion failed"));
    assert!(fix.description.contains("Relevant lines: 12"));
    assert!(fix.description.contains("src/thing.rs"));
}
