//! Process handle tests against an in-process backend stub: connect
//! backoff, submit semantics, channel loss, and close behavior.

mod test_harness;

use std::collections::HashMap;
use std::time::Duration;

use notegrid::error::NotegridError;
use notegrid::process::{ExecuteStatus, ProcessHandle};
use uuid::Uuid;

use test_harness::spawn_backend_stub;

fn discovered(port: u16, connect_timeout_ms: u64) -> ProcessHandle {
    ProcessHandle::discovered("g-test", "127.0.0.1", port, connect_timeout_ms, false, None)
}

#[tokio::test]
async fn connect_then_submit_round_trips() {
    let (port, _stub) = spawn_backend_stub().await;
    let handle = discovered(port, 2_000);

    handle.connect().await.expect("stub is reachable");
    // Idempotent
    handle.connect().await.expect("second connect is a no-op");

    let resp = handle
        .submit(Uuid::new_v4(), "print(1)", HashMap::new())
        .await
        .unwrap();
    assert_eq!(resp.status, ExecuteStatus::Success);
    assert_eq!(resp.output.as_deref(), Some("ok: print(1)"));
}

#[tokio::test]
async fn connect_times_out_against_dead_port() {
    // Nothing listens here
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let handle = discovered(port, 300);

    let start = tokio::time::Instant::now();
    let err = handle.connect().await.unwrap_err();
    assert!(matches!(err, NotegridError::ConnectTimeout(300)));
    assert!(
        start.elapsed() < Duration::from_secs(3),
        "timeout must be bounded"
    );
}

#[tokio::test]
async fn error_results_pass_through() {
    let (port, _stub) = spawn_backend_stub().await;
    let handle = discovered(port, 2_000);

    let resp = handle
        .submit(Uuid::new_v4(), "this will fail", HashMap::new())
        .await
        .unwrap();
    assert_eq!(resp.status, ExecuteStatus::Error);
    assert_eq!(resp.message.as_deref(), Some("deliberate failure"));
}

#[tokio::test]
async fn submit_context_reaches_the_backend() {
    let (port, _stub) = spawn_backend_stub().await;
    let handle = discovered(port, 2_000);

    let mut context = HashMap::new();
    context.insert("region".to_string(), "eu".to_string());
    let resp = handle
        .submit(Uuid::new_v4(), "params", context)
        .await
        .unwrap();
    assert!(resp.output.unwrap().contains("\"region\":\"eu\""));
}

#[tokio::test]
async fn broken_channel_surfaces_backend_unreachable() {
    let (port, stub) = spawn_backend_stub().await;
    let handle = discovered(port, 2_000);
    handle.connect().await.unwrap();

    // Kill the backend out from under the handle
    stub.abort();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = handle
        .submit(Uuid::new_v4(), "print(1)", HashMap::new())
        .await
        .unwrap_err();
    assert!(
        matches!(err, NotegridError::BackendUnreachable(_)),
        "expected BackendUnreachable, got {:?}",
        err
    );
}

#[tokio::test]
async fn cancel_is_acknowledged_within_grace() {
    let (port, _stub) = spawn_backend_stub().await;
    let handle = discovered(port, 2_000);
    handle.connect().await.unwrap();

    assert!(handle.cancel(Uuid::new_v4(), Duration::from_millis(500)).await);
}

#[tokio::test]
async fn cancel_against_dead_backend_is_not_acknowledged() {
    let (port, stub) = spawn_backend_stub().await;
    let handle = discovered(port, 2_000);
    handle.connect().await.unwrap();
    stub.abort();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!handle.cancel(Uuid::new_v4(), Duration::from_millis(300)).await);
}

#[tokio::test]
async fn discovered_close_only_drops_the_reference() {
    let (port, stub) = spawn_backend_stub().await;
    let handle = discovered(port, 2_000);
    handle.connect().await.unwrap();

    let session = handle.acquire().await;
    assert_eq!(handle.refs().await, 2);

    session.close().await.unwrap();
    handle.close().await.unwrap();
    assert!(handle.is_closed().await);

    // The backend itself is untouched by a Discovered close
    assert!(!stub.is_finished(), "no teardown of the remote process");

    // A closed handle refuses new work
    let err = handle
        .submit(Uuid::new_v4(), "print(1)", HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, NotegridError::BackendUnreachable(_)));
}
