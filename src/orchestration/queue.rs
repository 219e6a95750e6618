//! FIFO queue of tasks with its own concurrency ceiling.
//!
//! Used for side work that must be throttled independently of the main
//! scheduler, such as fetches shared by every package build. Queued tasks
//! start in order as slots free up.

use super::guard::PassGuard;
use super::limits::JobLimit;
use super::pool::RunningSet;
use crate::core::{SchedulerInterface, Task, TaskCore, TaskExt};
use crate::util::lock;
use crate::{klog_debug, klog_error};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    max_jobs: JobLimit,
    state: Mutex<QueueState>,
    guard: PassGuard,
    scheduler: Mutex<Option<SchedulerInterface>>,
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<Arc<dyn Task>>,
    running: RunningSet,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, max_jobs: JobLimit) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                max_jobs,
                state: Mutex::new(QueueState::default()),
                guard: PassGuard::default(),
                scheduler: Mutex::new(None),
            }),
        }
    }

    /// Interface given to started tasks that do not already carry one.
    pub fn set_scheduler(&self, iface: SchedulerInterface) {
        *lock(&self.inner.scheduler) = Some(iface);
    }

    pub fn add(&self, task: Arc<dyn Task>) {
        lock(&self.inner.state).queued.push_back(task);
        self.schedule();
    }

    /// Queue ahead of everything already waiting.
    pub fn add_front(&self, task: Arc<dyn Task>) {
        lock(&self.inner.state).queued.push_front(task);
        self.schedule();
    }

    /// Start queued tasks while the ceiling allows.
    pub fn schedule(&self) {
        let inner = &self.inner;
        inner.guard.run(|| inner.schedule_pass());
    }

    /// Cancel every queued and running task.
    pub fn clear(&self) {
        let (queued, running) = {
            let mut state = lock(&self.inner.state);
            let queued: Vec<_> = state.queued.drain(..).collect();
            (queued, state.running.snapshot())
        };
        klog_debug!(
            "{}: clearing {} queued and {} running tasks",
            self.inner.name,
            queued.len(),
            running.len()
        );
        for task in queued.iter().chain(running.iter()) {
            if let Err(e) = task.cancel() {
                klog_error!("{}: cancel of {} failed: {}", self.inner.name, task.core().name(), e);
            }
        }
    }

    /// Tasks waiting to start.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running_count(&self) -> usize {
        lock(&self.inner.state).running.len()
    }
}

impl QueueInner {
    fn schedule_pass(self: &Arc<Self>) {
        loop {
            let task = {
                let mut state = lock(&self.state);
                if !self.max_jobs.allows(state.running.len()) {
                    return;
                }
                match state.queued.pop_front() {
                    Some(task) => task,
                    None => return,
                }
            };
            if task.core().returncode().is_some() {
                // Cancelled while it was waiting.
                continue;
            }
            lock(&self.state).running.insert(Arc::clone(&task));

            let queue = Arc::downgrade(self);
            task.core().add_exit_listener(Box::new(move |core| {
                if let Some(queue) = queue.upgrade() {
                    queue.task_exit(core);
                }
            }));
            if task.core().scheduler_interface().is_none() {
                if let Some(iface) = lock(&self.scheduler).clone() {
                    task.core().set_scheduler(iface);
                }
            }
            if let Err(e) = task.start() {
                klog_error!("{}: {} failed to start: {}", self.name, task.core().name(), e);
            }
        }
    }

    fn task_exit(self: &Arc<Self>, core: &TaskCore) {
        lock(&self.state).running.remove(&core.id());
        self.guard.run(|| self.schedule_pass());
    }
}
