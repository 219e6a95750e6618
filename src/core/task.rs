//! Task state machine and exit notification.
//!
//! A task is the unit of asynchronous work. Its shared state lives in a
//! [`TaskCore`]: a set-once returncode, a monotonic cancelled flag, and the
//! start/exit listener lists. Concrete tasks embed a `TaskCore` and implement
//! the small [`Task`] trait; callers drive them through [`TaskExt`].
//!
//! Exit listeners fire exactly once, in reverse registration order, the first
//! time the returncode is set. They are popped off an owned stack one at a
//! time and invoked with no lock held, so a listener may freely call back
//! into this or any other task (including removing a listener that is still
//! waiting on the stack).

use crate::util::lock;
use crate::{klog_debug, klog_error, klog_trace, Error, Result};
use futures::future::BoxFuture;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Successful returncode.
pub const EX_OK: i32 = 0;

/// Generic failure returncode.
pub const EX_FAILURE: i32 = 1;

/// Returncode of a task that was cancelled before producing a real result.
///
/// Negative, so it never collides with a process exit status.
pub const CANCELLED_RETURNCODE: i32 = -(Signal::SIGINT as i32);

/// Identity of a task.
///
/// Tasks carry no other identifier; this exists so exit listeners and the
/// scheduler's running set can tell tasks apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Handle to the reactor a task runs on, forwarded from parent to child.
///
/// Carries the runtime used to spawn drivers and the background flag that
/// decides whether process output is echoed to the terminal.
#[derive(Debug, Clone)]
pub struct SchedulerInterface {
    handle: Handle,
    background: bool,
}

impl SchedulerInterface {
    pub fn new(handle: Handle, background: bool) -> Self {
        Self { handle, background }
    }

    /// Interface for the runtime the caller is executing on.
    pub fn current(background: bool) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|_| Error::NoRuntime("scheduler interface".to_string()))?;
        Ok(Self::new(handle, background))
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Called once with the task's core when the task reaches a terminal state.
pub type ExitListener = Box<dyn FnOnce(&TaskCore) + Send>;

/// Called once with the task's core when the task starts.
pub type StartListener = Box<dyn FnOnce(&TaskCore) + Send>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    /// `None` once the start listeners have fired.
    start: Option<Vec<StartListener>>,
    exit: Vec<(ListenerId, ExitListener)>,
    /// Listeners currently being fired, popped from the back.
    stack: Vec<(ListenerId, ExitListener)>,
    firing: bool,
}

impl Listeners {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

/// State shared by every task.
pub struct TaskCore {
    id: TaskId,
    name: String,
    returncode: watch::Sender<Option<i32>>,
    cancelled: AtomicBool,
    started: AtomicBool,
    listeners: Mutex<Listeners>,
    scheduler: Mutex<Option<SchedulerInterface>>,
}

impl std::fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("returncode", &self.returncode())
            .field("cancelled", &self.is_cancelled())
            .field("started", &self.is_started())
            .finish()
    }
}

impl TaskCore {
    pub fn new(name: impl Into<String>) -> Self {
        let (returncode, _) = watch::channel(None);
        Self {
            id: TaskId::new(),
            name: name.into(),
            returncode,
            cancelled: AtomicBool::new(false),
            started: AtomicBool::new(false),
            listeners: Mutex::new(Listeners {
                start: Some(Vec::new()),
                ..Default::default()
            }),
            scheduler: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The returncode; `Some` means the task is terminal.
    pub fn returncode(&self) -> Option<i32> {
        *self.returncode.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Mark the task cancelled. Returns `true` the first time only.
    pub(crate) fn mark_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Copy a child's cancelled flag. Never clears it.
    pub fn inherit_cancelled(&self, cancelled: bool) {
        if cancelled {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    pub fn set_scheduler(&self, iface: SchedulerInterface) {
        *lock(&self.scheduler) = Some(iface);
    }

    /// The forwarded scheduler interface, if one was assigned.
    pub fn scheduler_interface(&self) -> Option<SchedulerInterface> {
        lock(&self.scheduler).clone()
    }

    /// The forwarded scheduler interface, or one for the current runtime.
    pub fn scheduler(&self) -> Result<SchedulerInterface> {
        match self.scheduler_interface() {
            Some(iface) => Ok(iface),
            None => SchedulerInterface::current(false)
                .map_err(|_| Error::NoRuntime(self.name.clone())),
        }
    }

    pub fn is_background(&self) -> bool {
        self.scheduler_interface()
            .map(|iface| iface.is_background())
            .unwrap_or(false)
    }

    /// Bind the returncode if it is still absent. Returns `true` if this
    /// call bound it.
    fn set_returncode(&self, code: i32) -> bool {
        self.returncode.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        })
    }

    /// Bind the returncode (first call wins) and notify exit listeners.
    pub fn finish(&self, code: i32) -> bool {
        let bound = self.set_returncode(code);
        if bound {
            klog_debug!("task {} ({}) exited with {}", self.name, self.id.short(), code);
        }
        self.wait_hook();
        bound
    }

    /// Wait until the task is terminal and return its returncode.
    ///
    /// Suspends on the runtime rather than blocking a thread. Any number of
    /// callers may wait concurrently; none of them drive the task, so a
    /// waiter can never re-enter task logic. Waiting on a task that is never
    /// started or cancelled does not return.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.returncode.subscribe();
        let code = rx
            .wait_for(Option::is_some)
            .await
            .map(|rc| rc.unwrap_or(CANCELLED_RETURNCODE))
            .unwrap_or(CANCELLED_RETURNCODE);
        self.wait_hook();
        code
    }

    pub fn add_start_listener(&self, listener: StartListener) -> ListenerId {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id();
        if let Some(pending) = listeners.start.as_mut() {
            pending.push(listener);
            return id;
        }
        // Already started: fire right away.
        drop(listeners);
        listener(self);
        id
    }

    pub fn add_exit_listener(&self, listener: ExitListener) -> ListenerId {
        let id = {
            let mut listeners = lock(&self.listeners);
            let id = listeners.next_id();
            listeners.exit.push((id, listener));
            id
        };
        if self.returncode().is_some() {
            self.wait_hook();
        }
        id
    }

    /// Remove a pending exit listener. Returns `false` if it already ran.
    pub fn remove_exit_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        if let Some(pos) = listeners.exit.iter().position(|(lid, _)| *lid == id) {
            listeners.exit.remove(pos);
            return true;
        }
        if let Some(pos) = listeners.stack.iter().position(|(lid, _)| *lid == id) {
            listeners.stack.remove(pos);
            return true;
        }
        false
    }

    pub(crate) fn start_hook(&self) {
        let pending = lock(&self.listeners).start.take();
        if let Some(pending) = pending {
            for listener in pending {
                listener(self);
            }
        }
    }

    /// Fire exit listeners if the task is terminal.
    ///
    /// Only the outermost caller drains the stack; a nested call (a listener
    /// polling its own task) returns immediately, and listeners registered
    /// while draining are picked up before the outer call returns.
    pub(crate) fn wait_hook(&self) {
        if self.returncode().is_none() {
            return;
        }
        self.start_hook();

        {
            let mut listeners = lock(&self.listeners);
            if listeners.firing || listeners.exit.is_empty() {
                return;
            }
            let pending = std::mem::take(&mut listeners.exit);
            listeners.stack = pending;
            listeners.firing = true;
        }

        loop {
            let next = {
                let mut listeners = lock(&self.listeners);
                match listeners.stack.pop() {
                    Some(entry) => Some(entry),
                    None if !listeners.exit.is_empty() => {
                        let pending = std::mem::take(&mut listeners.exit);
                        listeners.stack = pending;
                        listeners.stack.pop()
                    }
                    None => {
                        listeners.firing = false;
                        None
                    }
                }
            };
            match next {
                Some((_, listener)) => listener(self),
                None => break,
            }
        }
    }
}

/// A unit of asynchronous work.
///
/// Implementors embed a [`TaskCore`] and provide the hooks below; the
/// public operations come from [`TaskExt`].
pub trait Task: Send + Sync + 'static {
    fn core(&self) -> &TaskCore;

    /// Begin the work and return without blocking. Long-running work is
    /// spawned on the task's scheduler interface and ends with
    /// `core().finish(code)`.
    fn on_start(self: Arc<Self>) -> Result<()>;

    /// Non-blocking status check, called by `poll()` while not terminal.
    fn on_poll(&self) {}

    /// Stop a started, non-terminal task. Must not wait for it to exit.
    fn on_cancel(&self) -> Result<()> {
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.core().returncode().is_none()
    }
}

/// Operations on a shared task.
pub trait TaskExt {
    /// Start the task. Fails if it was already started.
    fn start(&self) -> Result<()>;

    /// Non-blocking status check. Fires exit listeners once terminal.
    fn poll(&self) -> Option<i32>;

    /// Wait until terminal, yielding to the runtime meanwhile.
    fn wait(&self) -> BoxFuture<'_, i32>;

    /// Request cancellation without waiting for the task to exit.
    fn cancel(&self) -> Result<()>;
}

impl<T: Task + ?Sized> TaskExt for Arc<T> {
    fn start(&self) -> Result<()> {
        let core = self.core();
        if core.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState(format!(
                "task {} already started",
                core.name()
            )));
        }
        core.start_hook();
        if core.returncode().is_some() {
            // Cancelled before it was started.
            return Ok(());
        }
        klog_trace!("starting task {} ({})", core.name(), core.id().short());
        if let Err(e) = Arc::clone(self).on_start() {
            klog_error!("task {} failed to start: {}", core.name(), e);
            core.finish(EX_FAILURE);
            return Err(e);
        }
        Ok(())
    }

    fn poll(&self) -> Option<i32> {
        let core = self.core();
        if let Some(code) = core.returncode() {
            return Some(code);
        }
        self.on_poll();
        core.wait_hook();
        core.returncode()
    }

    fn wait(&self) -> BoxFuture<'_, i32> {
        Box::pin(self.core().wait())
    }

    fn cancel(&self) -> Result<()> {
        let core = self.core();
        if !core.mark_cancelled() {
            return Ok(());
        }
        if !core.is_started() {
            core.finish(CANCELLED_RETURNCODE);
            return Ok(());
        }
        if core.returncode().is_some() {
            return Ok(());
        }
        klog_debug!("cancelling task {} ({})", core.name(), core.id().short());
        self.on_cancel()
    }
}

/// A task that finishes with a fixed returncode as soon as it starts.
pub struct ReturnCodeTask {
    core: TaskCore,
    code: i32,
}

impl ReturnCodeTask {
    pub fn new(name: impl Into<String>, code: i32) -> Self {
        Self {
            core: TaskCore::new(name),
            code,
        }
    }

    pub fn ok(name: impl Into<String>) -> Self {
        Self::new(name, EX_OK)
    }
}

impl Task for ReturnCodeTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn on_start(self: Arc<Self>) -> Result<()> {
        self.core.finish(self.code);
        Ok(())
    }
}
