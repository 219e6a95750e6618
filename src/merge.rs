//! Merge-list jobs: building one package as a composite task.
//!
//! A [`PackageBuild`] fetches its sources through a shared fetch queue,
//! checks for blockers, then runs its build phases in order. With a build
//! directory set, each phase runs as a [`BuildPhase`] that can report its
//! own exit code over IPC. A [`MergeList`] feeds package builds to the
//! scheduler, highest dependency priority first.

use crate::core::subprocess::DEFAULT_CANCEL_GRACE;
use crate::core::{
    Composite, ProcessSpec, SubprocessTask, Task, TaskCore, TaskExt, TaskSequence, EX_FAILURE,
    EX_OK,
};
use crate::orchestration::{JobLimit, JobSource, TaskQueue};
use crate::phase::BuildPhase;
use crate::util::lock;
use crate::{klog, klog_error, klog_warn, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Strength of the dependency that put a package on the merge list.
///
/// Ordered weakest to strongest; the merge list schedules stronger first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    #[default]
    None,
    Soft,
    MediumPost,
    MediumSoft,
    Medium,
    Hard,
}

/// One package to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeListItem {
    /// Package atom, e.g. `dev-lang/rust-1.80.0`.
    pub package: String,
    #[serde(default)]
    pub priority: Priority,
    /// Command line that fetches sources, if any.
    #[serde(default)]
    pub fetch: Option<Vec<String>>,
    /// Command lines run in order to build and install.
    #[serde(default)]
    pub phases: Vec<Vec<String>>,
    /// Where phase output goes; defaults to the log directory.
    #[serde(default)]
    pub logfile: Option<PathBuf>,
}

impl MergeListItem {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            priority: Priority::default(),
            fetch: None,
            phases: Vec::new(),
            logfile: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_fetch<S: Into<String>>(mut self, argv: impl IntoIterator<Item = S>) -> Self {
        self.fetch = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_phase<S: Into<String>>(mut self, argv: impl IntoIterator<Item = S>) -> Self {
        self.phases.push(argv.into_iter().map(Into::into).collect());
        self
    }

    /// File name safe form of the package atom.
    pub fn file_stem(&self) -> String {
        self.package
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect()
    }

    pub fn log_name(&self) -> String {
        format!("{}.log", self.file_stem())
    }
}

/// Installed packages that conflict with a package about to be merged.
pub trait BlockerQuery: Send + Sync {
    fn conflicts(&self, package: &str) -> BTreeSet<String>;
}

/// Nothing blocks anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBlockers;

impl BlockerQuery for NoBlockers {
    fn conflicts(&self, _package: &str) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

/// Blockers listed up front, keyed by package.
#[derive(Debug, Clone, Default)]
pub struct StaticBlockers(pub BTreeMap<String, BTreeSet<String>>);

impl BlockerQuery for StaticBlockers {
    fn conflicts(&self, package: &str) -> BTreeSet<String> {
        self.0.get(package).cloned().unwrap_or_default()
    }
}

/// Builds one package: fetch, blocker check, then each phase in order.
pub struct PackageBuild {
    composite: Composite,
    item: MergeListItem,
    fetch_queue: Option<TaskQueue>,
    blockers: Arc<dyn BlockerQuery>,
    log_dir: Option<PathBuf>,
    build_dir: Option<PathBuf>,
    cancel_grace: Duration,
    fetcher: Mutex<Option<Arc<dyn Task>>>,
}

impl PackageBuild {
    pub fn new(item: MergeListItem, blockers: Arc<dyn BlockerQuery>) -> Self {
        Self {
            composite: Composite::new(item.package.clone()),
            item,
            fetch_queue: None,
            blockers,
            log_dir: None,
            build_dir: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            fetcher: Mutex::new(None),
        }
    }

    /// Run the fetch through `queue` instead of directly.
    pub fn with_fetch_queue(mut self, queue: TaskQueue) -> Self {
        self.fetch_queue = Some(queue);
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Parent of the per-package build directories. Phases get an IPC
    /// channel in `<dir>/<package>/.ipc`.
    pub fn with_build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_dir = Some(dir.into());
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn item(&self) -> &MergeListItem {
        &self.item
    }

    fn logfile(&self) -> Option<PathBuf> {
        self.item
            .logfile
            .clone()
            .or_else(|| self.log_dir.as_ref().map(|dir| dir.join(self.item.log_name())))
    }

    fn process_spec(&self, argv: &[String]) -> Result<ProcessSpec> {
        let mut spec = ProcessSpec::from_argv(argv)?;
        spec.logfile = self.logfile();
        Ok(spec)
    }

    fn subprocess(&self, label: &str, argv: &[String]) -> Result<Arc<dyn Task>> {
        let name = format!("{} {}", self.item.package, label);
        let task = SubprocessTask::new(name, self.process_spec(argv)?)
            .with_cancel_grace(self.cancel_grace);
        Ok(Arc::new(task))
    }

    fn phase(&self, index: usize, argv: &[String]) -> Result<Arc<dyn Task>> {
        let Some(build_dir) = &self.build_dir else {
            return self.subprocess(&format!("phase {}", index), argv);
        };
        let ipc_dir = build_dir.join(self.item.file_stem()).join(".ipc");
        let name = format!("{} phase {}", self.item.package, index);
        let task = BuildPhase::new(name, self.process_spec(argv)?, ipc_dir)
            .with_cancel_grace(self.cancel_grace);
        Ok(Arc::new(task))
    }

    fn start_fetch(self: &Arc<Self>, argv: &[String]) -> Result<()> {
        let fetcher = self.subprocess("fetch", argv)?;
        *lock(&self.fetcher) = Some(Arc::clone(&fetcher));

        let build = Arc::downgrade(self);
        let on_exit = Box::new(move |child: &TaskCore| {
            if let Some(build) = build.upgrade() {
                build.fetch_exit(child);
            }
        });

        match &self.fetch_queue {
            Some(queue) => {
                self.composite.reserve_slot(&fetcher);
                fetcher.core().add_exit_listener(on_exit);
                queue.add(fetcher);
                Ok(())
            }
            None => self.composite.start_task(fetcher, on_exit),
        }
    }

    fn fetch_exit(self: &Arc<Self>, fetcher: &TaskCore) {
        if self.core().returncode().is_some() {
            return;
        }
        lock(&self.fetcher).take();
        if self.composite.default_exit(fetcher) != EX_OK {
            klog_error!("{}: fetch failed", self.item.package);
            return;
        }
        self.start_build();
    }

    fn start_build(self: &Arc<Self>) {
        let conflicts = self.blockers.conflicts(&self.item.package);
        if !conflicts.is_empty() {
            let names: Vec<&str> = conflicts.iter().map(String::as_str).collect();
            klog_error!(
                "{} is blocked by installed packages: {}",
                self.item.package,
                names.join(", ")
            );
            self.composite.finish(EX_FAILURE);
            return;
        }

        let phases = TaskSequence::new(format!("{} phases", self.item.package));
        for (i, argv) in self.item.phases.iter().enumerate() {
            match self.phase(i + 1, argv) {
                Ok(task) => phases.add(task),
                Err(e) => {
                    klog_error!("{}: bad phase {}: {}", self.item.package, i + 1, e);
                    self.composite.finish(EX_FAILURE);
                    return;
                }
            }
        }

        let build = Arc::downgrade(self);
        let started = self.composite.start_task(
            Arc::new(phases),
            Box::new(move |child: &TaskCore| {
                if let Some(build) = build.upgrade() {
                    build.phases_exit(child);
                }
            }),
        );
        if let Err(e) = started {
            klog_error!("{}: phases failed to start: {}", self.item.package, e);
        }
    }

    fn phases_exit(&self, phases: &TaskCore) {
        if self.core().returncode().is_some() {
            return;
        }
        let code = self.composite.final_exit(phases);
        if code == EX_OK {
            klog!("{} merged", self.item.package);
        }
    }
}

impl Task for PackageBuild {
    fn core(&self) -> &TaskCore {
        self.composite.core()
    }

    fn on_start(self: Arc<Self>) -> Result<()> {
        match &self.item.fetch {
            Some(argv) => {
                let argv = argv.clone();
                self.start_fetch(&argv)
            }
            None => {
                self.start_build();
                Ok(())
            }
        }
    }

    fn on_poll(&self) {
        self.composite.poll_children();
    }

    fn on_cancel(&self) -> Result<()> {
        let queued = if self.composite.is_reserved() {
            lock(&self.fetcher).take()
        } else {
            None
        };
        self.composite.cancel_current()?;
        if let Some(fetcher) = queued {
            // Still waiting in the fetch queue; make sure it never runs.
            fetcher.cancel()?;
        }
        Ok(())
    }
}

/// Package builds in scheduling order.
pub struct MergeList {
    items: VecDeque<MergeListItem>,
    fetch_queue: TaskQueue,
    blockers: Arc<dyn BlockerQuery>,
    log_dir: Option<PathBuf>,
    build_dir: Option<PathBuf>,
    cancel_grace: Duration,
}

impl MergeList {
    /// Items are ordered by priority, strongest first; equal priorities
    /// keep their given order.
    pub fn new(
        items: Vec<MergeListItem>,
        blockers: Arc<dyn BlockerQuery>,
        fetch_jobs: JobLimit,
    ) -> Self {
        let mut items = items;
        items.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            items: items.into(),
            fetch_queue: TaskQueue::new("fetch", fetch_jobs),
            blockers,
            log_dir: None,
            build_dir: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_dir = Some(dir.into());
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn fetch_queue(&self) -> &TaskQueue {
        &self.fetch_queue
    }

    /// Packages not yet handed out.
    pub fn remaining(&self) -> impl Iterator<Item = &MergeListItem> {
        self.items.iter()
    }
}

impl JobSource for MergeList {
    fn next_job(&mut self) -> Option<Arc<dyn Task>> {
        let item = self.items.pop_front()?;
        let mut build = PackageBuild::new(item, Arc::clone(&self.blockers))
            .with_fetch_queue(self.fetch_queue.clone())
            .with_cancel_grace(self.cancel_grace);
        if let Some(dir) = &self.log_dir {
            build = build.with_log_dir(dir);
        }
        if let Some(dir) = &self.build_dir {
            build = build.with_build_dir(dir);
        }
        Some(Arc::new(build))
    }

    fn terminate_tasks(&mut self, running: &[Arc<dyn Task>]) {
        if !self.items.is_empty() {
            klog_warn!("dropping {} packages that never started", self.items.len());
        }
        self.items.clear();
        for task in running {
            if let Err(e) = task.cancel() {
                klog_error!("cancel of {} failed: {}", task.core().name(), e);
            }
        }
        self.fetch_queue.clear();
    }
}
