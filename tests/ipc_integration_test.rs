//! IPC supervisor integration: real server and real client over a Unix
//! socket in one process.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use devloop::domain::models::change_set::{ChangeSet, FileOp, FileOperation};
use devloop::domain::models::message::MessagePayload;
use devloop::infrastructure::ipc::{IpcClient, IpcServer, ServerPool};
use devloop::services::event_bus::{types, PollQuery};
use devloop::EventBus;

async fn started_server(session: &str) -> (IpcServer, std::path::PathBuf, Arc<EventBus>) {
    let bus = Arc::new(EventBus::default());
    let pool = ServerPool::new();
    let server = IpcServer::new(session, bus.clone(), false);
    let path = server.start(&pool).await.expect("server start");
    (server, path, bus)
}

#[tokio::test]
async fn test_client_messages_are_acked_in_order() {
    let (server, path, _bus) = started_server("ack-order").await;

    let mut client = IpcClient::new(&path, "ack-order", "req-1");
    assert!(client.connect().await);

    assert!(client.send_status("reading repo").await);
    assert!(client.send_progress(25.0).await);
    assert!(client.send_files_changed(vec!["src/a.rs".to_string()]).await);

    // One ack per non-ack message.
    tokio::time::timeout(Duration::from_secs(2), async {
        while client.ack_count() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("acks arrive");
    assert_eq!(client.ack_count(), 3);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_wait_for_result_sees_code_changes() {
    let (server, path, _bus) = started_server("result-flow").await;

    let waiter = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .wait_for_result("req-42", Duration::from_secs(5))
                .await
        })
    };

    let mut client = IpcClient::new(&path, "result-flow", "req-42");
    assert!(client.connect().await);
    client.send_status("thinking").await;
    let changes = ChangeSet {
        operations: vec![FileOperation {
            path: "src/new.rs".to_string(),
            op: FileOp::Create {
                content: "pub fn hello() {}\n".to_string(),
            },
        }],
    };
    assert!(client.send_code_changes(changes.clone()).await);

    let result = waiter.await.unwrap().expect("result before timeout");
    assert_eq!(result.request_id, "req-42");
    match result.payload {
        MessagePayload::CodeChanges { changes: received } => assert_eq!(received, changes),
        other => panic!("expected code changes, got {other:?}"),
    }

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_late_wait_returns_cached_result() {
    let (server, path, _bus) = started_server("late-wait").await;

    let mut client = IpcClient::new(&path, "late-wait", "req-9");
    assert!(client.connect().await);
    assert!(client.send_complete(true, Some("all done".to_string())).await);

    // Give the server a beat to route the message into the cache.
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.pending_result_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("result cached");

    // The request already finished: the wait resolves immediately.
    let result = server
        .wait_for_result("req-9", Duration::from_millis(10))
        .await
        .expect("cached result");
    assert!(matches!(
        result.payload,
        MessagePayload::Complete { success: true, .. }
    ));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_lines_are_dropped_not_fatal() {
    let (server, path, _bus) = started_server("garbage").await;

    // Raw connection: one garbage line, then a valid message.
    let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
    stream
        .write_all(b"this is { not json at all\n")
        .await
        .unwrap();
    let valid = devloop::domain::models::message::IpcMessage::new(
        MessagePayload::Complete {
            success: true,
            summary: None,
        },
        "garbage",
        "req-ok",
    );
    let mut line = valid.to_line().unwrap();
    line.push('\n');
    stream.write_all(line.as_bytes()).await.unwrap();

    // The valid message still lands despite the preceding garbage.
    let result = server
        .wait_for_result("req-ok", Duration::from_secs(2))
        .await;
    assert!(result.is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_two_sessions_bind_distinct_paths_and_pool_registers_both() {
    let bus = Arc::new(EventBus::default());
    let pool = ServerPool::new();
    let a = IpcServer::new("same-sess", bus.clone(), false);
    let b = IpcServer::new("same-sess", bus.clone(), false);

    let path_a = a.start(&pool).await.unwrap();
    let path_b = b.start(&pool).await.unwrap();

    assert_ne!(path_a, path_b, "random suffix keeps paths distinct");
    assert!(a.is_listening() && b.is_listening());
    assert_eq!(pool.len(), 2);

    pool.stop_all().await;
}

#[tokio::test]
async fn test_graceful_shutdown_with_active_connections() {
    let (server, path, _bus) = started_server("shutdown").await;

    let mut c1 = IpcClient::new(&path, "shutdown", "req-a");
    let mut c2 = IpcClient::new(&path, "shutdown", "req-b");
    assert!(c1.connect().await);
    assert!(c2.connect().await);
    c1.send_status("busy").await;
    c2.send_status("busy").await;

    let started = std::time::Instant::now();
    server.stop().await;
    assert!(started.elapsed() <= Duration::from_secs(6));
    assert!(!path.exists(), "socket file removed");

    // Writes after close are non-fatal: the client reports "not sent".
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!c1.send_status("after close").await || !c1.send_status("after close 2").await);

    c1.close().await;
    c2.close().await;
}

#[tokio::test]
async fn test_bind_retry_emits_events_on_failure() {
    // Point the temp dir at a path that cannot host sockets to force bind
    // failures and observe the retry/failed events.
    let bus = Arc::new(EventBus::default());
    let pool = ServerPool::new();
    let server = IpcServer::new("bind-fail/../nope", bus.clone(), false);
    // A session id with a path separator lands outside any existing
    // directory, so every bind attempt fails.
    let result = server.start(&pool).await;
    assert!(result.is_err());

    let retries = bus.poll(&PollQuery::since(0).with_types(&[types::IPC_CONNECTION_RETRY]));
    assert_eq!(retries.len(), 3, "three retries before giving up");
    let failed = bus.poll(&PollQuery::since(0).with_types(&[types::IPC_CONNECTION_FAILED]));
    assert_eq!(failed.len(), 1);
}
