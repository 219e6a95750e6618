//! Build phases that can report back to the engine.
//!
//! A [`BuildPhase`] runs one phase command next to an [`IpcDaemon`] serving
//! the FIFOs in the package's `.ipc` directory. The child finds them through
//! `KILN_IPC_DIR` and may call `kiln ipc exit <code>` to report its own
//! result; a reported code replaces the process exit status.

use crate::core::{
    ProcessSpec, SchedulerInterface, SubprocessTask, Task, TaskCore, TaskExt, EX_FAILURE,
};
use crate::ipc::{init_fifos, ExitCommand, IpcDaemon};
use crate::util::lock;
use crate::{klog_debug, klog_error, klog_warn, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Environment variable naming the phase's FIFO directory.
pub const IPC_DIR_ENV: &str = "KILN_IPC_DIR";

/// How long a phase may keep running after reporting its exit code.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

struct Running {
    process: Arc<SubprocessTask>,
    daemon: Arc<IpcDaemon>,
    exit: Arc<ExitCommand>,
}

pub struct BuildPhase {
    core: TaskCore,
    spec: ProcessSpec,
    ipc_dir: PathBuf,
    cancel_grace: Duration,
    exit_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl BuildPhase {
    pub fn new(name: impl Into<String>, spec: ProcessSpec, ipc_dir: impl Into<PathBuf>) -> Self {
        Self {
            core: TaskCore::new(name),
            spec,
            ipc_dir: ipc_dir.into(),
            cancel_grace: crate::core::subprocess::DEFAULT_CANCEL_GRACE,
            exit_timeout: EXIT_TIMEOUT,
            running: Mutex::new(None),
        }
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_exit_timeout(mut self, timeout: Duration) -> Self {
        self.exit_timeout = timeout;
        self
    }

    pub fn ipc_dir(&self) -> &std::path::Path {
        &self.ipc_dir
    }

    /// Exit code the phase reported over IPC, once it has.
    pub fn reported_exit(&self) -> Option<i32> {
        lock(&self.running)
            .as_ref()
            .and_then(|running| running.exit.exitcode())
    }

    fn start_daemon(
        self: &Arc<Self>,
        iface: SchedulerInterface,
    ) -> Result<(Arc<IpcDaemon>, Arc<ExitCommand>)> {
        init_fifos(&self.ipc_dir)?;
        let phase = Arc::downgrade(self);
        let exit = Arc::new(ExitCommand::with_hook(move |code| {
            if let Some(phase) = phase.upgrade() {
                phase.exit_reported(code);
            }
        }));
        let daemon = IpcDaemon::in_dir(format!("{} ipc", self.core.name()), &self.ipc_dir)
            .with_shared_command("exit", exit.clone());
        let daemon = Arc::new(daemon);
        daemon.core().set_scheduler(iface);
        daemon.start()?;
        Ok((daemon, exit))
    }

    /// The phase said it is done; give it a while to exit on its own.
    fn exit_reported(self: &Arc<Self>, code: i32) {
        klog_debug!("{}: reported exit {}", self.core.name(), code);
        let Ok(iface) = self.core.scheduler() else {
            return;
        };
        let phase = Arc::downgrade(self);
        let timeout = self.exit_timeout;
        iface.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(phase) = phase.upgrade() else { return };
            if phase.core.returncode().is_some() {
                return;
            }
            let process = lock(&phase.running).as_ref().map(|r| Arc::clone(&r.process));
            let Some(process) = process else { return };
            klog_warn!(
                "{}: still running {:?} after reporting exit {}, stopping it",
                phase.core.name(),
                timeout,
                code
            );
            if let Err(e) = process.cancel() {
                klog_error!("{}: cancel failed: {}", phase.core.name(), e);
            }
        });
    }

    fn process_exit(&self, process: &TaskCore) {
        let ipc = lock(&self.running)
            .as_ref()
            .map(|r| (Arc::clone(&r.daemon), Arc::clone(&r.exit)));
        let mut code = process.returncode().unwrap_or(EX_FAILURE);
        if let Some((daemon, exit)) = ipc {
            if let Err(e) = daemon.cancel() {
                klog_error!("{}: stopping ipc daemon failed: {}", self.core.name(), e);
            }
            if let Some(reported) = exit.exitcode() {
                if reported != code {
                    klog_debug!(
                        "{}: process exited {}, phase reported {}",
                        self.core.name(),
                        code,
                        reported
                    );
                }
                code = reported;
            }
        }
        self.core.finish(code);
    }
}

impl Task for BuildPhase {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn on_start(self: Arc<Self>) -> Result<()> {
        let iface = self.core.scheduler()?;
        let (daemon, exit) = self.start_daemon(iface.clone())?;

        let spec = self
            .spec
            .clone()
            .env(IPC_DIR_ENV, self.ipc_dir.to_string_lossy());
        let process = Arc::new(
            SubprocessTask::new(self.core.name(), spec).with_cancel_grace(self.cancel_grace),
        );
        process.core().set_scheduler(iface);
        let phase = Arc::downgrade(&self);
        process.core().add_exit_listener(Box::new(move |child: &TaskCore| {
            if let Some(phase) = phase.upgrade() {
                phase.process_exit(child);
            }
        }));

        *lock(&self.running) = Some(Running {
            process: Arc::clone(&process),
            daemon,
            exit,
        });
        process.start()
    }

    fn on_poll(&self) {
        let process = lock(&self.running).as_ref().map(|r| Arc::clone(&r.process));
        if let Some(process) = process {
            process.poll();
        }
    }

    fn on_cancel(&self) -> Result<()> {
        let process = lock(&self.running).as_ref().map(|r| Arc::clone(&r.process));
        match process {
            Some(process) => process.cancel(),
            None => Ok(()),
        }
    }
}
