//! Scheduler admission and termination tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use kiln::core::{ReturnCodeTask, Task};
use kiln::orchestration::{JobLimit, Scheduler, SchedulerConfig, SchedulerEvent};
use tokio::sync::mpsc;

use crate::fixtures::{BrokenLoad, FixedLoad, Gauge, SlowTask};

fn slow_jobs(count: usize, delay: Duration, gauge: &Arc<Gauge>) -> VecDeque<Arc<dyn Task>> {
    (0..count)
        .map(|i| SlowTask::new(&format!("job-{}", i), delay, 0, gauge) as Arc<dyn Task>)
        .collect()
}

fn config(max_jobs: usize, max_load: Option<f64>) -> SchedulerConfig {
    SchedulerConfig {
        max_jobs: JobLimit::from(max_jobs),
        max_load,
        loadavg_latency: Duration::from_millis(20),
        background: true,
    }
}

/// Test: Job ceiling is respected
/// Given 5 slow jobs and max_jobs = 2
/// When the scheduler runs
/// Then at most 2 run at once and all 5 complete
#[tokio::test]
async fn test_job_ceiling() {
    let gauge = Gauge::new();
    let jobs = slow_jobs(5, Duration::from_millis(30), &gauge);

    let summary = Scheduler::new(jobs, config(2, None))
        .with_load_sampler(FixedLoad(0.0))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.completed, 5);
    assert!(gauge.peak() <= 2, "peak was {}", gauge.peak());
    assert_eq!(summary.peak_running, 2);
    assert_eq!(summary.returncode(), 0);
}

/// Test: Unlimited jobs start everything at once
#[tokio::test]
async fn test_unlimited_jobs() {
    let gauge = Gauge::new();
    let jobs = slow_jobs(4, Duration::from_millis(30), &gauge);

    let summary = Scheduler::new(jobs, config(0, None)).run().await.unwrap();
    assert_eq!(summary.completed, 4);
    assert_eq!(gauge.peak(), 4);
}

/// Test: A failing load sample throttles to one job
/// Given a sampler that always fails and max_jobs = 3
/// When the scheduler runs
/// Then jobs run one at a time but all of them still complete
#[tokio::test]
async fn test_sample_failure_is_fail_safe() {
    let gauge = Gauge::new();
    let jobs = slow_jobs(3, Duration::from_millis(20), &gauge);

    let summary = Scheduler::new(jobs, config(3, Some(4.0)))
        .with_load_sampler(BrokenLoad)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.completed, 3);
    assert_eq!(gauge.peak(), 1);
}

/// Test: High load never blocks the first job
#[tokio::test]
async fn test_high_load_still_makes_progress() {
    let gauge = Gauge::new();
    let jobs = slow_jobs(2, Duration::from_millis(20), &gauge);

    let summary = Scheduler::new(jobs, config(4, Some(1.0)))
        .with_load_sampler(FixedLoad(50.0))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(gauge.peak(), 1);
}

/// Test: Failures are reported and fail the run
#[tokio::test]
async fn test_failures_in_summary() {
    let jobs: VecDeque<Arc<dyn Task>> = VecDeque::from(vec![
        Arc::new(ReturnCodeTask::ok("good")) as Arc<dyn Task>,
        Arc::new(ReturnCodeTask::new("bad", 3)) as Arc<dyn Task>,
    ]);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let summary = Scheduler::new(jobs, config(1, None))
        .with_events(tx)
        .run()
        .await
        .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].name, "bad");
    assert_eq!(summary.failed[0].returncode, 3);
    assert_eq!(summary.returncode(), 1);

    let mut failed = 0;
    let mut finished = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            SchedulerEvent::JobFailed { returncode, .. } => {
                assert_eq!(returncode, 3);
                failed += 1;
            }
            SchedulerEvent::AllJobsComplete => finished = true,
            _ => {}
        }
    }
    assert_eq!(failed, 1);
    assert!(finished);
}

/// Test: Termination cancels running jobs and admits nothing more
#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_stops_everything() {
    let gauge = Gauge::new();
    let jobs = slow_jobs(6, Duration::from_secs(10), &gauge);
    let scheduler = Scheduler::new(jobs, config(2, None));
    let stop = scheduler.terminate_handle();

    let run = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.terminate();
    stop.terminate();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("scheduler did not stop")
        .unwrap()
        .unwrap();

    assert!(summary.terminated);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed.len(), 2, "only the two running jobs were started");
    assert_eq!(summary.returncode(), 1);
}
