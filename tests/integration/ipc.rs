//! FIFO daemon tests with a real client on the other end.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kiln::core::{Task, TaskExt, CANCELLED_RETURNCODE};
use kiln::ipc::{encode_frame, ExitCommand, FifoLock, IpcClient, IpcDaemon, IpcRequest};
use serde_json::json;

use crate::fixtures::{background, wait_until, write_and_hold, write_raw, FifoDir};

const SETTLE: Duration = Duration::from_secs(3);

fn echo_daemon(fifos: &FifoDir) -> Arc<IpcDaemon> {
    let daemon = IpcDaemon::in_dir("ipc", fifos.path())
        .with_command("echo", |request: &IpcRequest| json!({ "args": request.args }));
    start(daemon)
}

fn start(daemon: IpcDaemon) -> Arc<IpcDaemon> {
    let daemon = Arc::new(daemon);
    daemon.core().set_scheduler(background());
    daemon.start().unwrap();
    daemon
}

fn client(fifos: &FifoDir) -> IpcClient {
    IpcClient::in_dir(fifos.path()).with_timeout(Duration::from_secs(5))
}

async fn stop(daemon: &Arc<IpcDaemon>) {
    daemon.cancel().unwrap();
    assert_eq!(daemon.wait().await, CANCELLED_RETURNCODE);
    assert!(!daemon.is_registered());
}

/// Test: Request is dispatched and its reply delivered
#[tokio::test(flavor = "multi_thread")]
async fn test_echo_round_trip() {
    let fifos = FifoDir::new();
    let daemon = echo_daemon(&fifos);

    let reply = client(&fifos)
        .send(&IpcRequest::new("echo", "/").with_args(["a", "b"]))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "args": ["a", "b"] }));

    assert_eq!(daemon.requests_handled(), 1);
    assert_eq!(daemon.replies_sent(), 1);
    stop(&daemon).await;
}

/// Test: Sequential clients each get exactly one reply
#[tokio::test(flavor = "multi_thread")]
async fn test_one_reply_per_request() {
    let fifos = FifoDir::new();
    let daemon = echo_daemon(&fifos);
    let client = client(&fifos);

    for i in 0..3 {
        let arg = i.to_string();
        let reply = client
            .send(&IpcRequest::new("echo", "/").with_args([arg.as_str()]))
            .await
            .unwrap();
        assert_eq!(reply, json!({ "args": [arg] }));
    }
    assert_eq!(daemon.requests_handled(), 3);
    assert_eq!(daemon.replies_sent(), 3);
    stop(&daemon).await;
}

/// Test: Unknown commands get an error reply
#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_command() {
    let fifos = FifoDir::new();
    let daemon = echo_daemon(&fifos);

    let reply = client(&fifos)
        .send(&IpcRequest::new("frobnicate", "/"))
        .await
        .unwrap();
    assert_eq!(reply["returncode"], json!(1));
    assert!(reply["stderr"].as_str().unwrap().contains("frobnicate"));
    stop(&daemon).await;
}

/// Test: Malformed input is dropped and the daemon keeps serving
/// Given a well-framed payload that is not a request, then a bad header
/// When each writer hangs up
/// Then nothing is dispatched or replied, and the next real request works
#[tokio::test(flavor = "multi_thread")]
async fn test_garbage_is_discarded() {
    let fifos = FifoDir::new();
    let daemon = echo_daemon(&fifos);

    write_raw(fifos.input(), b"\x00\x00\x00\x05hello".to_vec()).await;
    assert!(wait_until(SETTLE, || daemon.discarded() == 1).await);

    write_raw(fifos.input(), vec![0xff, 0xff, 0xff, 0xff, b'{']).await;
    assert!(wait_until(SETTLE, || daemon.discarded() >= 2).await);
    assert_eq!(daemon.requests_handled(), 0);
    assert_eq!(daemon.replies_sent(), 0);
    assert!(daemon.is_alive());

    let reply = client(&fifos)
        .send(&IpcRequest::new("echo", "/").with_args(["still-here"]))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "args": ["still-here"] }));
    stop(&daemon).await;
}

/// Test: A raw, well-formed request written without the client still works
#[tokio::test(flavor = "multi_thread")]
async fn test_raw_request_without_reader_is_tolerated() {
    let fifos = FifoDir::new();
    let daemon = echo_daemon(&fifos);

    // Nobody has the reply FIFO open, so the reply cannot be delivered.
    let frame = encode_frame(br#"["echo","/","x"]"#).unwrap();
    write_raw(fifos.input(), frame).await;

    assert!(wait_until(SETTLE, || daemon.requests_handled() == 1).await);
    assert_eq!(daemon.replies_sent(), 0);
    assert!(daemon.is_alive());
    stop(&daemon).await;
}

/// Test: Reopen waits for the writer's lock
/// Given a writer holding the lock that opens and closes the input FIFO
/// When the daemon sees end of file
/// Then it does not reopen until the lock is released
#[tokio::test(flavor = "multi_thread")]
async fn test_reopen_waits_for_lock() {
    let fifos = FifoDir::new();
    let daemon = echo_daemon(&fifos);

    let held = FifoLock::acquire(daemon.lock_path()).unwrap();
    write_raw(fifos.input(), Vec::new()).await;

    tokio::time::timeout(SETTLE, tokio::time::sleep(Duration::from_millis(300)))
        .await
        .expect("runtime stalled while the reopen was deferred");
    assert_eq!(daemon.reopen_count(), 0);
    // One attempt at end of file, then one per retry tick.
    let deferred = daemon.reopens_deferred();
    assert!((1..=10).contains(&deferred), "{} deferred reopens", deferred);

    drop(held);
    assert!(wait_until(SETTLE, || daemon.reopen_count() == 1).await);

    let reply = client(&fifos)
        .send(&IpcRequest::new("echo", "/"))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "args": [] }));
    stop(&daemon).await;
}

/// Test: A request written while the reopen is deferred is still handled
/// Given a writer holding the lock after the input hung up
/// When another request arrives on the old descriptor
/// Then it is dispatched and the input is reopened without the lock
#[tokio::test(flavor = "multi_thread")]
async fn test_request_during_deferred_reopen() {
    let fifos = FifoDir::new();
    let daemon = echo_daemon(&fifos);

    let _held = FifoLock::acquire(daemon.lock_path()).unwrap();
    write_raw(fifos.input(), Vec::new()).await;
    assert!(wait_until(SETTLE, || daemon.reopens_deferred() >= 1).await);

    let frame = IpcRequest::new("echo", "/").to_frame().unwrap();
    write_raw(fifos.input(), frame).await;
    assert!(wait_until(SETTLE, || daemon.requests_handled() == 1).await);
    assert_eq!(daemon.reopen_count(), 1);
    stop(&daemon).await;
}

/// Test: A truncated frame from a peer that stays connected is dropped
/// Given a peer that announces 64 bytes, sends 3, and keeps the FIFO open
/// When a well-formed request follows
/// Then the truncated frame is discarded and the request is answered
#[tokio::test(flavor = "multi_thread")]
async fn test_truncated_frame_does_not_swallow_next_request() {
    let fifos = FifoDir::new();
    let daemon = echo_daemon(&fifos);

    let peer = write_and_hold(fifos.input(), b"\x00\x00\x00\x40abc".to_vec()).await;
    assert!(wait_until(SETTLE, || daemon.discarded() == 1).await);

    let reply = client(&fifos)
        .send(&IpcRequest::new("echo", "/").with_args(["after"]))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "args": ["after"] }));
    assert_eq!(daemon.requests_handled(), 1);

    drop(peer);
    stop(&daemon).await;
}

/// Test: Exit command records the code and runs its hook after replying
#[tokio::test(flavor = "multi_thread")]
async fn test_exit_command() {
    let fifos = FifoDir::new();
    let seen = Arc::new(AtomicI32::new(-1));
    let hook_seen = Arc::clone(&seen);
    let exit = Arc::new(ExitCommand::with_hook(move |code| {
        hook_seen.store(code, Ordering::SeqCst);
    }));
    let daemon =
        start(IpcDaemon::in_dir("ipc", fifos.path()).with_shared_command("exit", exit.clone()));

    let reply = client(&fifos)
        .send(&IpcRequest::new("exit", "/").with_args(["3"]))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "stdout": "", "stderr": "", "returncode": 0 }));
    assert!(wait_until(SETTLE, || seen.load(Ordering::SeqCst) == 3).await);
    assert_eq!(exit.exitcode(), Some(3));

    // Later exit codes are acknowledged but ignored.
    client(&fifos)
        .send(&IpcRequest::new("exit", "/").with_args(["9"]))
        .await
        .unwrap();
    assert_eq!(exit.exitcode(), Some(3));
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    stop(&daemon).await;
}
