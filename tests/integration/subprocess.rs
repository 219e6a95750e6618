//! Subprocess task tests against real child processes.

use std::sync::Arc;
use std::time::Duration;

use kiln::core::subprocess::COMMAND_NOT_FOUND;
use kiln::core::{ProcessSpec, SubprocessTask, Task, TaskExt};
use kiln::Error;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tempfile::TempDir;

use crate::fixtures::background;

fn sh(script: &str) -> ProcessSpec {
    ProcessSpec::new("sh").arg("-c").arg(script)
}

fn spawn(task: SubprocessTask) -> Arc<SubprocessTask> {
    let task = Arc::new(task);
    task.core().set_scheduler(background());
    task.start().unwrap();
    task
}

fn gone(_: Pid, _: Signal) -> nix::Result<()> {
    Err(Errno::ESRCH)
}

fn forbidden(_: Pid, _: Signal) -> nix::Result<()> {
    Err(Errno::EPERM)
}

fn broken(_: Pid, _: Signal) -> nix::Result<()> {
    Err(Errno::EINVAL)
}

/// Test: Exit status becomes the returncode
#[tokio::test]
async fn test_exit_code() {
    let task = spawn(SubprocessTask::new("exit 3", sh("exit 3")));
    assert_eq!(task.wait().await, 3);
    assert!(task.pid().is_none());
    assert!(!task.is_alive());
    assert!(!task.is_registered());
}

/// Test: A process that is already gone when signalled
/// Given a signaller that reports "no such process"
/// When the task is cancelled while its process still runs
/// Then cancel succeeds and the real exit status is kept
#[tokio::test]
async fn test_cancel_race_with_exit() {
    let task = spawn(
        SubprocessTask::new("racer", sh("sleep 0.3; exit 3"))
            .with_signaller(gone)
            .with_cancel_grace(Duration::from_secs(30)),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    task.cancel().unwrap();
    assert_eq!(task.wait().await, 3);
    assert!(task.core().is_cancelled());
}

/// Test: Permission denied on signal is not fatal
#[tokio::test]
async fn test_cancel_permission_denied_is_tolerated() {
    let task = spawn(
        SubprocessTask::new("foreign", sh("sleep 0.2; exit 0"))
            .with_signaller(forbidden)
            .with_cancel_grace(Duration::from_secs(30)),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    task.cancel().unwrap();
    assert_eq!(task.wait().await, 0);
}

/// Test: Any other signalling error is reported
#[tokio::test]
async fn test_cancel_other_errors_propagate() {
    let task = spawn(
        SubprocessTask::new("odd", sh("sleep 0.2"))
            .with_signaller(broken)
            .with_cancel_grace(Duration::from_secs(30)),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(task.cancel(), Err(Error::Os(Errno::EINVAL))));
    assert_eq!(task.wait().await, 0);
}

/// Test: SIGTERM ends a running process
#[tokio::test]
async fn test_cancel_terminates() {
    let task = spawn(SubprocessTask::new("sleeper", ProcessSpec::new("sleep").arg("30")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(task.is_alive());

    task.cancel().unwrap();
    let code = tokio::time::timeout(Duration::from_secs(5), task.wait())
        .await
        .expect("process did not exit");
    assert_eq!(code, 128 + Signal::SIGTERM as i32);
}

/// Test: SIGKILL follows when SIGTERM is ignored
#[tokio::test]
async fn test_cancel_escalates_to_kill() {
    let task = spawn(
        SubprocessTask::new("stubborn", sh("trap '' TERM; sleep 5"))
            .with_cancel_grace(Duration::from_millis(200)),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    task.cancel().unwrap();
    let code = tokio::time::timeout(Duration::from_secs(3), task.wait())
        .await
        .expect("process survived SIGKILL");
    assert_eq!(code, 128 + Signal::SIGKILL as i32);
}

/// Test: Missing program finishes with 127
#[tokio::test]
async fn test_missing_program() {
    let task = spawn(SubprocessTask::new(
        "missing",
        ProcessSpec::new("kiln-test-no-such-program"),
    ));
    assert_eq!(task.wait().await, COMMAND_NOT_FOUND);
}

/// Test: stdout and stderr both land in the log file
#[tokio::test]
async fn test_output_goes_to_log() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("logs").join("build.log");
    let task = spawn(SubprocessTask::new(
        "chatty",
        sh("echo to-stdout; echo to-stderr >&2").logfile(&log),
    ));
    assert_eq!(task.wait().await, 0);

    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("to-stdout"));
    assert!(contents.contains("to-stderr"));
}
