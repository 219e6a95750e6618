//! Build plans run end to end through the scheduler.

use std::sync::Arc;
use std::time::Duration;

use kiln::merge::{MergeList, MergeListItem, NoBlockers};
use kiln::orchestration::{JobLimit, Scheduler, SchedulerConfig};
use kiln::plan::BuildPlan;
use tempfile::TempDir;

const PLAN: &str = r#"
[[package]]
package = "sys-libs/zlib-1.3"
priority = "hard"
fetch = ["sh", "-c", "sleep 0.05"]
phases = [["sh", "-c", "echo compile zlib"], ["sh", "-c", "echo install zlib"]]

[[package]]
package = "app-misc/broken-1"
fetch = ["sh", "-c", "sleep 0.05"]
phases = [["sh", "-c", "exit 2"], ["sh", "-c", "echo never"]]

[[package]]
package = "app-misc/blocked-1"
phases = [["sh", "-c", "echo never"]]

[[package]]
package = "app-misc/plain-1"
phases = [["true"]]

[blockers]
"app-misc/blocked-1" = ["app-misc/blocker-0"]
"#;

fn run_config(jobs: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_jobs: JobLimit::from(jobs),
        max_load: None,
        loadavg_latency: Duration::from_millis(50),
        background: true,
    }
}

/// Test: A plan with failures and blockers
/// Given four packages, one failing a phase and one blocked
/// When the plan runs with two jobs
/// Then two succeed, two fail, and failed packages stop early
#[tokio::test(flavor = "multi_thread")]
async fn test_plan_runs_to_completion() {
    let logs = TempDir::new().unwrap();
    let plan = BuildPlan::from_toml(PLAN).unwrap();
    let blockers = Arc::new(plan.blocker_query());
    let source = MergeList::new(plan.packages, blockers, JobLimit::from(1))
        .with_log_dir(logs.path());

    let summary = Scheduler::new(source, run_config(2)).run().await.unwrap();

    assert_eq!(summary.completed, 2);
    let mut failed: Vec<(&str, i32)> = summary
        .failed
        .iter()
        .map(|f| (f.name.as_str(), f.returncode))
        .collect();
    failed.sort();
    assert_eq!(
        failed,
        vec![("app-misc/blocked-1", 1), ("app-misc/broken-1", 2)]
    );
    assert_eq!(summary.returncode(), 1);

    let zlib = std::fs::read_to_string(logs.path().join("sys-libs_zlib-1.3.log")).unwrap();
    assert_eq!(zlib, "compile zlib\ninstall zlib\n");
    let broken = std::fs::read_to_string(logs.path().join("app-misc_broken-1.log"))
        .unwrap_or_default();
    assert!(!broken.contains("never"));
    assert!(!logs.path().join("app-misc_blocked-1.log").exists());
}

/// Test: Terminating a plan cancels queued fetches and running builds
#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_plan() {
    let plan = BuildPlan::from_toml(
        r#"
[[package]]
package = "a"
fetch = ["sleep", "10"]
phases = [["true"]]

[[package]]
package = "b"
fetch = ["sleep", "10"]
phases = [["true"]]
"#,
    )
    .unwrap();
    let blockers = Arc::new(plan.blocker_query());
    let source = MergeList::new(plan.packages, blockers, JobLimit::from(1))
        .with_cancel_grace(Duration::from_millis(200));

    let scheduler = Scheduler::new(source, run_config(2));
    let stop = scheduler.terminate_handle();
    let run = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    stop.terminate();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("plan did not stop")
        .unwrap()
        .unwrap();
    assert!(summary.terminated);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.failed.len(), 2);
}

/// Test: Phases report their own exit code through `kiln ipc`
/// Given a phase that reports exit 3 but exits 0, and one that reports 0
///   but exits 5
/// When the plan runs with a build directory
/// Then the reported codes decide each build's result
#[tokio::test(flavor = "multi_thread")]
async fn test_phase_reports_exit_over_ipc() {
    let build_dir = TempDir::new().unwrap();
    let logs = TempDir::new().unwrap();
    let kiln = env!("CARGO_BIN_EXE_kiln");
    let report_then_fail = format!("'{}' ipc exit 0; exit 5", kiln);
    let packages = vec![
        MergeListItem::new("app-misc/reports-failure")
            .with_phase([kiln, "ipc", "exit", "3"])
            .with_phase(["sh", "-c", "echo never"]),
        MergeListItem::new("app-misc/reports-success")
            .with_phase(["sh", "-c", report_then_fail.as_str()]),
    ];
    let source = MergeList::new(packages, Arc::new(NoBlockers), JobLimit::from(1))
        .with_log_dir(logs.path())
        .with_build_dir(build_dir.path());

    let summary = tokio::time::timeout(
        Duration::from_secs(30),
        Scheduler::new(source, run_config(2)).run(),
    )
    .await
    .expect("plan did not finish")
    .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].name, "app-misc/reports-failure");
    assert_eq!(summary.failed[0].returncode, 3);

    let log = std::fs::read_to_string(logs.path().join("app-misc_reports-failure.log"))
        .unwrap_or_default();
    assert!(!log.contains("never"));
    assert!(build_dir
        .path()
        .join("app-misc_reports-failure")
        .join(".ipc")
        .join("in")
        .exists());
}
