//! Composite tasks: a parent that runs child tasks one at a time.
//!
//! [`Composite`] is embedded by concrete parents. It tracks which child is
//! current, forwards the scheduler interface, and provides the two standard
//! exit handlers: [`Composite::default_exit`] short-circuits the parent on
//! the first non-zero child, [`Composite::final_exit`] always ends it.

use super::task::{
    ExitListener, Task, TaskCore, TaskExt, CANCELLED_RETURNCODE, EX_FAILURE, EX_OK,
};
use crate::util::lock;
use crate::{klog_debug, klog_error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

/// What a composite is currently waiting on.
pub enum CurrentChild {
    Empty,
    /// A slot is claimed in some other queue; the child binds when it starts.
    Reserved,
    Bound(Arc<dyn Task>),
}

impl std::fmt::Debug for CurrentChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CurrentChild::Empty => write!(f, "Empty"),
            CurrentChild::Reserved => write!(f, "Reserved"),
            CurrentChild::Bound(task) => write!(f, "Bound({})", task.core().name()),
        }
    }
}

pub struct Composite {
    core: TaskCore,
    current: Arc<Mutex<CurrentChild>>,
}

impl Composite {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: TaskCore::new(name),
            current: Arc::new(Mutex::new(CurrentChild::Empty)),
        }
    }

    pub fn core(&self) -> &TaskCore {
        &self.core
    }

    pub fn current_child(&self) -> Option<Arc<dyn Task>> {
        match &*lock(&self.current) {
            CurrentChild::Bound(task) => Some(Arc::clone(task)),
            _ => None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        matches!(*lock(&self.current), CurrentChild::Reserved)
    }

    pub fn is_idle(&self) -> bool {
        matches!(*lock(&self.current), CurrentChild::Empty)
    }

    /// Make `child` current, attach `on_exit`, and start it.
    pub fn start_task(&self, child: Arc<dyn Task>, on_exit: ExitListener) -> Result<()> {
        *lock(&self.current) = CurrentChild::Bound(Arc::clone(&child));
        child.core().add_exit_listener(on_exit);
        if let Some(iface) = self.core.scheduler_interface() {
            child.core().set_scheduler(iface);
        }
        klog_debug!("{}: starting child {}", self.core.name(), child.core().name());
        child.start()
    }

    /// Claim the current slot for a child that some other queue will start.
    ///
    /// When the child starts it becomes current, unless the slot was released
    /// in the meantime.
    pub fn reserve_slot(&self, child: &Arc<dyn Task>) {
        *lock(&self.current) = CurrentChild::Reserved;
        if let Some(iface) = self.core.scheduler_interface() {
            child.core().set_scheduler(iface);
        }
        let slot = Arc::clone(&self.current);
        let weak: Weak<dyn Task> = Arc::downgrade(child);
        child.core().add_start_listener(Box::new(move |_| {
            let Some(child) = weak.upgrade() else { return };
            let mut current = lock(&slot);
            if matches!(*current, CurrentChild::Reserved) {
                *current = CurrentChild::Bound(child);
            }
        }));
    }

    fn assert_current(&self, child: &TaskCore) {
        let current = lock(&self.current);
        match &*current {
            CurrentChild::Bound(task) if task.core().id() == child.id() => {}
            other => panic!(
                "{}: exit handler for {} called while current child is {:?}",
                self.core.name(),
                child.name(),
                other
            ),
        }
    }

    fn child_code(child: &TaskCore) -> i32 {
        match child.returncode() {
            Some(code) => code,
            None => panic!("exit handler for {} called before it exited", child.name()),
        }
    }

    /// Short-circuit on failure: a non-zero child ends the parent with the
    /// child's returncode and cancelled flag. Returns the child's returncode.
    pub fn default_exit(&self, child: &TaskCore) -> i32 {
        self.assert_current(child);
        let code = Self::child_code(child);
        if code != EX_OK {
            self.core.inherit_cancelled(child.is_cancelled());
            self.finish(code);
        }
        code
    }

    /// End the parent with the child's result, whatever it is.
    pub fn final_exit(&self, child: &TaskCore) -> i32 {
        self.assert_current(child);
        let code = Self::child_code(child);
        self.core.inherit_cancelled(child.is_cancelled());
        self.finish(code);
        code
    }

    /// Release the current slot and end the parent.
    pub fn finish(&self, code: i32) {
        *lock(&self.current) = CurrentChild::Empty;
        self.core.finish(code);
    }

    /// Poll the current child, following the chain as children hand off.
    /// Each child is polled at most once per call.
    pub fn poll_children(&self) {
        let mut previous = None;
        loop {
            let child = match &*lock(&self.current) {
                CurrentChild::Bound(task) => Arc::clone(task),
                _ => break,
            };
            let id = child.core().id();
            if previous == Some(id) {
                break;
            }
            previous = Some(id);
            child.poll();
        }
    }

    /// Cancel whatever the parent is waiting on.
    ///
    /// A reserved slot has no child to cancel, so the parent fails with 1.
    pub fn cancel_current(&self) -> Result<()> {
        let target = match &*lock(&self.current) {
            CurrentChild::Bound(child) => Ok(Arc::clone(child)),
            CurrentChild::Reserved => Err(EX_FAILURE),
            CurrentChild::Empty => Err(CANCELLED_RETURNCODE),
        };
        match target {
            Ok(child) => child.cancel(),
            Err(code) => {
                self.finish(code);
                Ok(())
            }
        }
    }
}

/// Runs a list of tasks in order, stopping at the first failure.
///
/// The sequence returns the first non-zero child returncode, or the last
/// child's returncode when every earlier child succeeded. An empty sequence
/// succeeds immediately.
pub struct TaskSequence {
    composite: Composite,
    queue: Mutex<VecDeque<Arc<dyn Task>>>,
}

impl TaskSequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            composite: Composite::new(name),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_tasks(name: impl Into<String>, tasks: Vec<Arc<dyn Task>>) -> Self {
        let sequence = Self::new(name);
        lock(&sequence.queue).extend(tasks);
        sequence
    }

    pub fn add(&self, task: Arc<dyn Task>) {
        lock(&self.queue).push_back(task);
    }

    /// Tasks not yet started.
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_child(&self) -> Option<Arc<dyn Task>> {
        self.composite.current_child()
    }

    fn start_next(self: &Arc<Self>) -> Result<()> {
        let next = lock(&self.queue).pop_front();
        let Some(task) = next else {
            self.composite.finish(EX_OK);
            return Ok(());
        };
        let sequence = Arc::downgrade(self);
        self.composite.start_task(
            task,
            Box::new(move |child| {
                if let Some(sequence) = sequence.upgrade() {
                    sequence.task_exit(child);
                }
            }),
        )
    }

    fn task_exit(self: &Arc<Self>, child: &TaskCore) {
        if self.composite.core().returncode().is_some() {
            return;
        }
        if self.composite.default_exit(child) != EX_OK {
            return;
        }
        if lock(&self.queue).is_empty() {
            self.composite.final_exit(child);
            return;
        }
        if let Err(e) = self.start_next() {
            klog_error!("{}: next task failed to start: {}", self.composite.core().name(), e);
        }
    }
}

impl Task for TaskSequence {
    fn core(&self) -> &TaskCore {
        self.composite.core()
    }

    fn on_start(self: Arc<Self>) -> Result<()> {
        self.start_next()
    }

    fn on_poll(&self) {
        self.composite.poll_children();
    }

    fn on_cancel(&self) -> Result<()> {
        lock(&self.queue).clear();
        self.composite.cancel_current()
    }
}
