use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use kiln::config::Config;
use kiln::ipc::{IpcClient, IpcRequest, DEFAULT_REPLY_TIMEOUT};
use kiln::log::LogLevel;
use kiln::merge::MergeList;
use kiln::orchestration::{JobLimit, ScheduleSummary, Scheduler, SchedulerEvent};
use kiln::phase::IPC_DIR_ENV;
use kiln::plan::BuildPlan;
use kiln::{klog, klog_debug, klog_warn, Result};

/// How long shutdown waits for blocking FIFO opens still parked on a thread.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Kiln - build pipeline runner with job and load-average throttling
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:
    KILN_DEBUG=1     Enable debug logging (alternative to --debug)
    KILN_IPC_DIR     FIFO directory for `kiln ipc` (set for build phases)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.kiln/kiln.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Build every package in a plan
    Run {
        /// Path to the build plan (TOML)
        plan: PathBuf,

        /// Concurrent build jobs (0 = unlimited)
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Do not start new jobs while the load average is at or above this
        #[arg(short = 'l', long = "load-average")]
        load_average: Option<f64>,

        /// Concurrent fetches
        #[arg(long)]
        fetch_jobs: Option<usize>,

        /// Send build output only to log files
        #[arg(long)]
        background: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Send one request to a running IPC daemon and print the reply
    Ipc {
        /// Directory holding the daemon's FIFOs
        #[arg(long, env = IPC_DIR_ENV)]
        dir: PathBuf,

        /// Root filesystem the command applies to
        #[arg(long, default_value = "/")]
        root: PathBuf,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = DEFAULT_REPLY_TIMEOUT.as_secs())]
        timeout_secs: u64,

        /// Command name
        command: String,

        /// Command arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Command::Ipc { .. }) {
        // Runs inside a build phase; the engine owns the log file.
        kiln::log::set_level(if cli.debug {
            LogLevel::Debug
        } else {
            LogLevel::Info
        });
    } else {
        kiln::log::init_with_debug(cli.debug);
    }
    kiln::log::mirror_to_stderr(true);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let code = match cli.command {
        Command::Run {
            plan,
            jobs,
            load_average,
            fetch_jobs,
            background,
            json,
        } => {
            let mut config = Config::load()?;
            if jobs.is_some() {
                config.jobs = jobs;
            }
            if load_average.is_some() {
                config.load_average = load_average;
            }
            if let Some(fetch_jobs) = fetch_jobs {
                config.fetch_jobs = fetch_jobs;
            }
            config.background |= background;
            config.validate()?;
            runtime.block_on(run_plan(&plan, config, json))
        }
        Command::Ipc {
            dir,
            root,
            timeout_secs,
            command,
            args,
        } => {
            let request = IpcRequest::new(command, root).with_args(args);
            let client = IpcClient::in_dir(&dir).with_timeout(Duration::from_secs(timeout_secs));
            runtime.block_on(send_ipc(client, request))
        }
    };

    // A client stuck opening a FIFO sits in a blocking thread that cannot be
    // interrupted; do not wait for it forever.
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    std::process::exit(code?);
}

async fn run_plan(path: &std::path::Path, config: Config, json: bool) -> Result<i32> {
    let plan = BuildPlan::load(path)?;
    klog!(
        "Running plan {} ({} packages, jobs={}, load_average={:?})",
        path.display(),
        plan.packages.len(),
        config.job_limit(),
        config.load_average
    );

    let blockers = Arc::new(plan.blocker_query());
    let source = MergeList::new(plan.packages, blockers, JobLimit::from(config.fetch_jobs))
        .with_log_dir(config.log_dir()?)
        .with_build_dir(config.build_dir()?)
        .with_cancel_grace(config.cancel_grace());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(source, config.scheduler_config()).with_events(events_tx);

    let stop = scheduler.terminate_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            klog_warn!("Interrupted, stopping running builds");
            stop.terminate();
        }
    });

    let progress = tokio::spawn(report_progress(events_rx, json));
    let summary = scheduler.run().await?;
    // The scheduler drops its sender when it returns, which ends the reporter.
    let _ = progress.await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(summary.returncode())
}

async fn report_progress(mut events: mpsc::UnboundedReceiver<SchedulerEvent>, quiet: bool) {
    while let Some(event) = events.recv().await {
        klog_debug!("scheduler event: {:?}", event);
        if quiet {
            continue;
        }
        match event {
            SchedulerEvent::JobStarted { name, running, .. } => {
                println!(">>> Building {} ({} running)", name, running);
            }
            SchedulerEvent::JobCompleted { name, .. } => {
                println!(">>> Completed {}", name);
            }
            SchedulerEvent::JobFailed {
                name, returncode, ..
            } => {
                println!("!!! Failed {} (returncode {})", name, returncode);
            }
            SchedulerEvent::Terminating => println!("!!! Terminating"),
            SchedulerEvent::AllJobsComplete => {}
        }
    }
}

fn print_summary(summary: &ScheduleSummary) {
    println!();
    println!("  Completed:   {}", summary.completed);
    println!("  Failed:      {}", summary.failed.len());
    for failure in &summary.failed {
        println!("    {} (returncode {})", failure.name, failure.returncode);
    }
    println!("  Peak jobs:   {}", summary.peak_running);
    if summary.terminated {
        println!("  Terminated before completion");
    }
    if let Some(finished) = summary.finished_at {
        let elapsed = finished - summary.started_at;
        println!("  Elapsed:     {}s", elapsed.num_seconds());
    }
}

async fn send_ipc(client: IpcClient, request: IpcRequest) -> Result<i32> {
    let reply = client.send(&request).await?;
    println!("{}", serde_json::to_string(&reply)?);
    let code = reply
        .get("returncode")
        .and_then(|rc| rc.as_i64())
        .map(|rc| rc as i32)
        .unwrap_or(0);
    Ok(code)
}
