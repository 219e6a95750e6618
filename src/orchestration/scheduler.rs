//! Job scheduler gated by job count and system load.
//!
//! The Scheduler pulls jobs from a [`JobSource`], starts as many as the job
//! ceiling and load average allow, and starts more whenever one exits. A
//! termination request cancels the running jobs exactly once and stops
//! admission; `run` returns once nothing is left running.

use super::guard::PassGuard;
use super::limits::JobLimit;
use super::loadavg::{LoadSampler, ProcLoadAvg};
use super::pool::RunningSet;
use crate::core::{SchedulerInterface, Task, TaskCore, TaskExt, TaskId, EX_FAILURE, EX_OK};
use crate::error::Result;
use crate::util::lock;
use crate::{klog, klog_debug, klog_error, klog_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Default interval between load samples while admission is throttled.
pub const DEFAULT_LOADAVG_LATENCY: Duration = Duration::from_secs(30);

/// Events emitted by the scheduler for job lifecycle changes.
///
/// These events allow external components (like the CLI) to report
/// progress without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A job was admitted and started.
    JobStarted {
        /// The job that was started.
        task_id: TaskId,
        /// Display name of the job.
        name: String,
        /// Jobs running after this one was admitted.
        running: usize,
    },
    /// A job exited with returncode 0.
    JobCompleted {
        /// The job that completed.
        task_id: TaskId,
        /// Display name of the job.
        name: String,
    },
    /// A job exited with a non-zero returncode.
    JobFailed {
        /// The job that failed.
        task_id: TaskId,
        /// Display name of the job.
        name: String,
        /// The returncode it exited with.
        returncode: i32,
    },
    /// Termination was requested; running jobs are being cancelled.
    Terminating,
    /// Nothing is running and nothing more will be admitted.
    AllJobsComplete,
}

/// Admission decision for one more job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// The job ceiling is reached.
    JobLimit,
    /// The 1-minute load average is at or above the limit.
    LoadLimit,
    /// The load average could not be read; treated as over the limit.
    SampleFailed,
}

/// Decide whether one more job may start.
///
/// The load average only matters when a limit is set, more than one job can
/// run at once, and at least one job is already running; otherwise a job
/// is always admitted while the ceiling allows, so progress is guaranteed.
pub fn admission(
    max_jobs: JobLimit,
    max_load: Option<f64>,
    running: usize,
    sampler: &dyn LoadSampler,
) -> Admission {
    if !max_jobs.allows(running) {
        return Admission::JobLimit;
    }
    let Some(max_load) = max_load else {
        return Admission::Admit;
    };
    if !max_jobs.is_parallel() || running == 0 {
        return Admission::Admit;
    }
    match sampler.sample() {
        Ok(load) if load.one < max_load => Admission::Admit,
        Ok(load) => {
            klog_debug!("load average {:.2} >= {:.2}, holding jobs", load.one, max_load);
            Admission::LoadLimit
        }
        Err(e) => {
            klog_warn!("cannot read load average: {}", e);
            Admission::SampleFailed
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Ceiling on concurrently running jobs.
    pub max_jobs: JobLimit,
    /// Do not admit jobs while the 1-minute load average is at or above this.
    pub max_load: Option<f64>,
    /// How often to re-sample the load average while throttled.
    pub loadavg_latency: Duration,
    /// Run jobs without terminal I/O.
    pub background: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jobs: JobLimit::default(),
            max_load: None,
            loadavg_latency: DEFAULT_LOADAVG_LATENCY,
            background: false,
        }
    }
}

/// Supplies jobs to the scheduler.
pub trait JobSource: Send + 'static {
    /// The next job to run, or `None` once the source is exhausted.
    fn next_job(&mut self) -> Option<Arc<dyn Task>>;

    /// Stop the given running jobs. Called at most once, on termination.
    fn terminate_tasks(&mut self, running: &[Arc<dyn Task>]) {
        for task in running {
            if let Err(e) = task.cancel() {
                klog_error!("cancel of {} failed: {}", task.core().name(), e);
            }
        }
    }
}

impl JobSource for std::collections::VecDeque<Arc<dyn Task>> {
    fn next_job(&mut self) -> Option<Arc<dyn Task>> {
        self.pop_front()
    }
}

/// Requests scheduler termination. Cheap to clone and safe to use from any
/// thread or task.
#[derive(Debug, Clone, Default)]
pub struct TerminateHandle {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl TerminateHandle {
    pub fn terminate(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// A job that exited non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub task_id: TaskId,
    pub name: String,
    pub returncode: i32,
}

/// Outcome of a scheduler run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSummary {
    /// Jobs that exited with returncode 0.
    pub completed: usize,
    /// Jobs that exited non-zero.
    pub failed: Vec<JobFailure>,
    /// Highest number of jobs running at once.
    pub peak_running: usize,
    /// Whether termination was requested.
    pub terminated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for ScheduleSummary {
    fn default() -> Self {
        Self {
            completed: 0,
            failed: Vec::new(),
            peak_running: 0,
            terminated: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

impl ScheduleSummary {
    /// 0 if every job succeeded and the run was not terminated, else 1.
    pub fn returncode(&self) -> i32 {
        if self.failed.is_empty() && !self.terminated {
            EX_OK
        } else {
            EX_FAILURE
        }
    }
}

/// Scheduler for parallel job execution.
///
/// # Example
///
/// ```ignore
/// use std::collections::VecDeque;
/// use kiln::orchestration::{Scheduler, SchedulerConfig, JobLimit};
///
/// let jobs: VecDeque<Arc<dyn Task>> = plan_jobs();
/// let config = SchedulerConfig { max_jobs: JobLimit::from(4), ..Default::default() };
/// let scheduler = Scheduler::new(jobs, config);
/// let stop = scheduler.terminate_handle();
/// let summary = scheduler.run().await?;
/// ```
pub struct Scheduler<S: JobSource> {
    config: SchedulerConfig,
    source: S,
    sampler: Box<dyn LoadSampler>,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    terminate: TerminateHandle,
}

impl<S: JobSource> Scheduler<S> {
    /// Create a scheduler that samples `/proc/loadavg`.
    ///
    /// # Arguments
    ///
    /// * `source` - Where jobs come from, in admission order
    /// * `config` - Job ceiling, load limit and sampling interval
    pub fn new(source: S, config: SchedulerConfig) -> Self {
        Self {
            config,
            source,
            sampler: Box::new(ProcLoadAvg::default()),
            events: None,
            terminate: TerminateHandle::default(),
        }
    }

    pub fn with_load_sampler(mut self, sampler: impl LoadSampler + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    /// Emit [`SchedulerEvent`]s on `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn terminate_handle(&self) -> TerminateHandle {
        self.terminate.clone()
    }

    /// Run until every admitted job has exited and the source is exhausted,
    /// or until termination has stopped every running job.
    pub async fn run(self) -> Result<ScheduleSummary> {
        let iface = SchedulerInterface::current(self.config.background)?;
        let shared = Arc::new(Shared {
            config: self.config,
            source: Mutex::new(self.source),
            sampler: self.sampler,
            running: Mutex::new(RunningSet::new()),
            guard: PassGuard::default(),
            terminate: self.terminate,
            terminated_tasks: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            load_throttled: AtomicBool::new(false),
            wake: Notify::new(),
            summary: Mutex::new(ScheduleSummary::default()),
            events: self.events,
            iface,
        });
        shared.run().await
    }
}

struct Shared<S: JobSource> {
    config: SchedulerConfig,
    source: Mutex<S>,
    sampler: Box<dyn LoadSampler>,
    running: Mutex<RunningSet>,
    guard: PassGuard,
    terminate: TerminateHandle,
    /// Set once the termination request has been acted on.
    terminated_tasks: AtomicBool,
    exhausted: AtomicBool,
    load_throttled: AtomicBool,
    wake: Notify,
    summary: Mutex<ScheduleSummary>,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    iface: SchedulerInterface,
}

impl<S: JobSource> Shared<S> {
    async fn run(self: Arc<Self>) -> Result<ScheduleSummary> {
        klog!(
            "scheduler starting: max_jobs={}, max_load={:?}",
            self.config.max_jobs,
            self.config.max_load
        );
        self.schedule();

        while !self.is_finished() {
            let throttled = self.load_throttled.load(Ordering::SeqCst);
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = self.terminate.notify.notified() => {}
                _ = tokio::time::sleep(self.config.loadavg_latency), if throttled => {
                    klog_debug!("re-sampling load average");
                }
            }
            self.schedule();
        }

        self.emit(SchedulerEvent::AllJobsComplete);
        let mut summary = lock(&self.summary).clone();
        summary.peak_running = lock(&self.running).peak();
        summary.finished_at = Some(Utc::now());
        klog!(
            "scheduler finished: {} completed, {} failed, terminated={}",
            summary.completed,
            summary.failed.len(),
            summary.terminated
        );
        Ok(summary)
    }

    fn is_finished(&self) -> bool {
        lock(&self.running).is_empty()
            && (self.exhausted.load(Ordering::SeqCst)
                || self.terminated_tasks.load(Ordering::SeqCst))
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Run scheduling passes until no further request arrives.
    fn schedule(self: &Arc<Self>) {
        self.guard.run(|| {
            self.termination_check();
            self.schedule_tasks();
        });
    }

    fn termination_check(&self) {
        if !self.terminate.is_requested() || self.terminated_tasks.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = lock(&self.running).snapshot();
        klog_warn!("termination requested, stopping {} running jobs", running.len());
        lock(&self.summary).terminated = true;
        self.emit(SchedulerEvent::Terminating);
        lock(&self.source).terminate_tasks(&running);
    }

    fn schedule_tasks(self: &Arc<Self>) {
        loop {
            if self.terminated_tasks.load(Ordering::SeqCst) {
                return;
            }
            let running = lock(&self.running).len();
            match admission(
                self.config.max_jobs,
                self.config.max_load,
                running,
                self.sampler.as_ref(),
            ) {
                Admission::Admit => self.load_throttled.store(false, Ordering::SeqCst),
                Admission::JobLimit => {
                    self.load_throttled.store(false, Ordering::SeqCst);
                    return;
                }
                Admission::LoadLimit | Admission::SampleFailed => {
                    self.load_throttled.store(true, Ordering::SeqCst);
                    return;
                }
            }
            let next = lock(&self.source).next_job();
            match next {
                Some(job) => self.start_job(job),
                None => {
                    self.exhausted.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    fn start_job(self: &Arc<Self>, job: Arc<dyn Task>) {
        let core = job.core();
        if core.scheduler_interface().is_none() {
            core.set_scheduler(self.iface.clone());
        }
        // Insert before the listener: a job that is already terminal reports
        // its exit as soon as the listener is attached.
        let running = lock(&self.running).insert(Arc::clone(&job));
        let shared = Arc::downgrade(self);
        core.add_exit_listener(Box::new(move |core| {
            if let Some(shared) = shared.upgrade() {
                shared.job_exit(core);
            }
        }));

        klog_debug!("admitted {} ({} running)", core.name(), running);
        self.emit(SchedulerEvent::JobStarted {
            task_id: core.id(),
            name: core.name().to_string(),
            running,
        });
        if let Err(e) = job.start() {
            klog_error!("{} failed to start: {}", core.name(), e);
        }
    }

    fn job_exit(self: &Arc<Self>, core: &TaskCore) {
        if lock(&self.running).remove(&core.id()).is_none() {
            return;
        }
        let code = core.returncode().unwrap_or(EX_FAILURE);
        let name = core.name().to_string();
        if code == EX_OK {
            klog!("{} completed", name);
            lock(&self.summary).completed += 1;
            self.emit(SchedulerEvent::JobCompleted {
                task_id: core.id(),
                name,
            });
        } else {
            klog_error!("{} failed with returncode {}", name, code);
            lock(&self.summary).failed.push(JobFailure {
                task_id: core.id(),
                name: name.clone(),
                returncode: code,
            });
            self.emit(SchedulerEvent::JobFailed {
                task_id: core.id(),
                name,
                returncode: code,
            });
        }
        self.schedule();
        self.wake.notify_one();
    }
}
