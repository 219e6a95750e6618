//! Tasks that run an external program.
//!
//! The child's stdout and stderr share one pipe. A driver spawned on the
//! scheduler interface pumps that pipe into the optional log file (and the
//! terminal, unless running in the background) while waiting for the process
//! to exit. Cancellation sends SIGTERM and escalates to SIGKILL if the
//! process is still around after the grace period.

use super::poll::{next_event, read_buf, PollEvent, PollFiles, ReadOutcome};
use super::task::{Task, TaskCore, TaskExt, EX_FAILURE};
use crate::util::lock;
use crate::{klog_debug, klog_error, klog_trace, klog_warn, Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::fcntl::OFlag;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Returncode when the program cannot be found or spawned.
pub const COMMAND_NOT_FOUND: i32 = 127;

pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(1);

const OUTPUT: &str = "output";

/// Delivers a signal to a process. Swappable so tests can simulate races.
pub type Signaller = fn(Pid, Signal) -> nix::Result<()>;

fn send_signal(pid: Pid, sig: Signal) -> nix::Result<()> {
    signal::kill(pid, sig)
}

/// Program, arguments and environment of a subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Build from an argv vector; the first element is the program.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Validation("empty command line".to_string()))?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn logfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.logfile = Some(path.into());
        self
    }

    /// Resolve bare program names against `PATH`.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        if self.program.contains('/') {
            return Ok(PathBuf::from(&self.program));
        }
        which::which(&self.program)
            .map_err(|e| Error::Validation(format!("{}: {}", self.program, e)))
    }
}

pub struct SubprocessTask {
    core: TaskCore,
    spec: ProcessSpec,
    /// Set while the child runs; the driver spawned in `on_start` clears it
    /// once the process has been reaped.
    pid: Mutex<Option<u32>>,
    registered: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    signaller: Signaller,
    cancel_grace: Duration,
}

impl SubprocessTask {
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            core: TaskCore::new(name),
            spec,
            pid: Mutex::new(None),
            registered: Arc::new(AtomicBool::new(false)),
            cancel_token: CancellationToken::new(),
            signaller: send_signal,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    pub fn with_signaller(mut self, signaller: Signaller) -> Self {
        self.signaller = signaller;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    /// Process id while the child is running.
    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    /// Whether the output pipe is still registered with the reactor.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn spawn_failed(&self, reason: &dyn std::fmt::Display) {
        klog_error!("{}: cannot run {}: {}", self.core.name(), self.spec.program, reason);
        self.core.finish(COMMAND_NOT_FOUND);
    }

    async fn drive(
        self: Arc<Self>,
        mut child: Child,
        mut files: PollFiles,
        mut log: Option<File>,
        background: bool,
    ) {
        let exited = CancellationToken::new();
        let pump = self.pump_output(&mut files, &mut log, background, exited.clone());
        let exit = async {
            let code = self.wait_child(&mut child).await;
            exited.cancel();
            code
        };
        let ((), code) = tokio::join!(pump, exit);

        files.unregister();
        self.core.finish(code);
    }

    async fn pump_output(
        self: &Arc<Self>,
        files: &mut PollFiles,
        log: &mut Option<File>,
        background: bool,
        exited: CancellationToken,
    ) {
        loop {
            let Some(fd) = files.get(OUTPUT) else { return };
            let event = tokio::select! {
                event = next_event(fd) => Some(event),
                _ = exited.cancelled() => None,
            };
            let event = match event {
                Some(event) => event,
                None => {
                    // Pick up whatever was written just before exit.
                    if let Some(fd) = files.get(OUTPUT) {
                        if let Ok(ReadOutcome::Data(data)) = read_buf(fd.get_ref()) {
                            self.emit(&data, log, background);
                        }
                    }
                    files.unregister();
                    return;
                }
            };
            match event {
                Ok(PollEvent::Data(data)) => self.emit(&data, log, background),
                Ok(PollEvent::Eof) => {
                    klog_trace!("{}: output closed", self.core.name());
                    files.unregister();
                    return;
                }
                Ok(PollEvent::Exceptional) => {
                    klog_error!(
                        "{}: error condition on output pipe, cancelling",
                        self.core.name()
                    );
                    files.unregister();
                    if let Err(e) = self.cancel() {
                        klog_error!("{}: cancel failed: {}", self.core.name(), e);
                    }
                    return;
                }
                Err(e) => {
                    klog_error!("{}: reading output failed: {}", self.core.name(), e);
                    files.unregister();
                    return;
                }
            }
        }
    }

    fn emit(&self, data: &[u8], log: &mut Option<File>, background: bool) {
        if let Some(file) = log.as_mut() {
            if let Err(e) = file.write_all(data) {
                klog_warn!("{}: log write failed, disabling log: {}", self.core.name(), e);
                *log = None;
            }
        }
        if !background {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(data);
            let _ = stdout.flush();
        }
    }

    async fn grace_expired(&self) {
        self.cancel_token.cancelled().await;
        tokio::time::sleep(self.cancel_grace).await;
    }

    async fn wait_child(&self, child: &mut Child) -> i32 {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = self.grace_expired() => {
                klog_warn!(
                    "{}: still running {:?} after SIGTERM, sending SIGKILL",
                    self.core.name(),
                    self.cancel_grace
                );
                if let Err(e) = child.start_kill() {
                    klog_debug!("{}: SIGKILL failed: {}", self.core.name(), e);
                }
                child.wait().await
            }
        };
        lock(&self.pid).take();
        match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                klog_error!("{}: waiting for process failed: {}", self.core.name(), e);
                EX_FAILURE
            }
        }
    }
}

/// Exit status as a returncode; signal deaths map to 128 + signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => EX_FAILURE,
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

impl Task for SubprocessTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn on_start(self: Arc<Self>) -> Result<()> {
        let iface = self.core.scheduler()?;
        let background = iface.is_background();

        let program = match self.spec.resolve_program() {
            Ok(program) => program,
            Err(e) => {
                self.spawn_failed(&e);
                return Ok(());
            }
        };
        let log = self.spec.logfile.as_deref().map(open_log).transpose()?;

        // Close-on-exec, so jobs spawned concurrently never inherit each
        // other's output pipes.
        let (reader, writer) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        let mut files = PollFiles::new(Arc::clone(&self.registered));
        files.register(OUTPUT, File::from(reader))?;

        let mut command = Command::new(&program);
        command
            .args(&self.spec.args)
            .envs(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::from(writer.try_clone()?))
            .stderr(Stdio::from(writer))
            .stdin(if background {
                Stdio::null()
            } else {
                Stdio::inherit()
            });
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }
        let spawned = command.spawn();
        // Closes our copies of the write end, so EOF arrives with the child.
        drop(command);

        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                files.unregister();
                self.spawn_failed(&e);
                return Ok(());
            }
        };

        let pid = child.id();
        *lock(&self.pid) = pid;
        klog_debug!(
            "{}: spawned {} (pid {:?})",
            self.core.name(),
            program.display(),
            pid
        );
        iface.spawn(Arc::clone(&self).drive(child, files, log, background));
        Ok(())
    }

    fn on_cancel(&self) -> Result<()> {
        self.cancel_token.cancel();
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        let pid = Pid::from_raw(pid as i32);
        match (self.signaller)(pid, Signal::SIGTERM) {
            Ok(()) => Ok(()),
            Err(Errno::EPERM) => {
                klog_warn!("{}: not permitted to signal pid {}", self.core.name(), pid);
                Ok(())
            }
            // Already exited; the exit notification sets the returncode.
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_alive(&self) -> bool {
        self.is_registered() || (self.pid().is_some() && self.core.returncode().is_none())
    }
}
