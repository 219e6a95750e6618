//! Task state machine and composite pipeline tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln::core::{ReturnCodeTask, Task, TaskExt, TaskSequence, CANCELLED_RETURNCODE};
use kiln::Error;

use crate::fixtures::{background, Gauge, SlowTask};

fn stage(name: &str, code: i32) -> Arc<ReturnCodeTask> {
    Arc::new(ReturnCodeTask::new(name, code))
}

/// Test: Pipeline halts at the first failing stage
/// Given stages returning 0, 2, 0
/// When the sequence runs
/// Then it returns 2 and the third stage never starts
#[tokio::test]
async fn test_pipeline_halts_on_failure() {
    let (a, b, c) = (stage("a", 0), stage("b", 2), stage("c", 0));
    let seq = Arc::new(TaskSequence::with_tasks(
        "pipeline",
        vec![
            a.clone() as Arc<dyn Task>,
            b.clone() as Arc<dyn Task>,
            c.clone() as Arc<dyn Task>,
        ],
    ));
    seq.core().set_scheduler(background());

    seq.start().unwrap();
    assert_eq!(seq.wait().await, 2);
    assert!(a.core().is_started());
    assert!(b.core().is_started());
    assert!(!c.core().is_started(), "stage after the failure must not start");
}

/// Test: Final stage result is the pipeline result
#[tokio::test]
async fn test_pipeline_returns_last_code() {
    let gauge = Gauge::new();
    let seq = Arc::new(TaskSequence::with_tasks(
        "pipeline",
        vec![
            SlowTask::new("fetch", Duration::from_millis(20), 0, &gauge) as Arc<dyn Task>,
            SlowTask::new("build", Duration::from_millis(20), 0, &gauge) as Arc<dyn Task>,
            stage("install", 5) as Arc<dyn Task>,
        ],
    ));
    seq.core().set_scheduler(background());

    seq.start().unwrap();
    assert_eq!(seq.wait().await, 5);
    assert_eq!(gauge.peak(), 1, "stages run one at a time");
}

/// Test: Exit listeners fire once, newest first
#[tokio::test]
async fn test_listeners_fire_once_in_reverse_order() {
    let task = stage("job", 0);
    let order = Arc::new(Mutex::new(Vec::new()));
    for label in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        task.core().add_exit_listener(Box::new(move |_| {
            order.lock().unwrap().push(label);
        }));
    }
    task.core().set_scheduler(background());

    task.start().unwrap();
    assert_eq!(task.wait().await, 0);
    assert_eq!(task.wait().await, 0);
    assert_eq!(task.poll(), Some(0));
    assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
}

/// Test: Waiting from many places at once observes one result
#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_waiters_see_same_code() {
    let gauge = Gauge::new();
    let task = SlowTask::new("job", Duration::from_millis(50), 7, &gauge);
    task.core().set_scheduler(background());

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    task.core().add_exit_listener(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    task.start().unwrap();
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.wait().await })
        })
        .collect();
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), 7);
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// Test: Cancelling before start yields the cancelled code without running
#[tokio::test]
async fn test_cancel_before_start() {
    let gauge = Gauge::new();
    let task = SlowTask::new("never", Duration::from_secs(5), 0, &gauge);
    task.cancel().unwrap();

    assert_eq!(task.wait().await, CANCELLED_RETURNCODE);
    assert!(task.core().is_cancelled());

    // A later start is a no-op; the work never runs.
    task.start().unwrap();
    assert_eq!(gauge.finished(), 0);
    assert_eq!(task.core().returncode(), Some(CANCELLED_RETURNCODE));
}

/// Test: A task starts at most once
#[tokio::test]
async fn test_double_start_is_rejected() {
    let task = stage("once", 0);
    task.core().set_scheduler(background());
    task.start().unwrap();
    assert!(matches!(task.start(), Err(Error::InvalidState(_))));
}

/// Test: Cancelling a running pipeline cancels the current stage
#[tokio::test]
async fn test_cancel_running_pipeline() {
    let gauge = Gauge::new();
    let slow = SlowTask::new("slow", Duration::from_secs(5), 0, &gauge);
    let after = stage("after", 0);
    let seq = Arc::new(TaskSequence::with_tasks(
        "pipeline",
        vec![slow.clone() as Arc<dyn Task>, after.clone() as Arc<dyn Task>],
    ));
    seq.core().set_scheduler(background());

    seq.start().unwrap();
    seq.cancel().unwrap();

    assert_eq!(seq.wait().await, CANCELLED_RETURNCODE);
    assert!(seq.core().is_cancelled());
    assert!(slow.core().is_cancelled());
    assert!(!after.core().is_started());
}
