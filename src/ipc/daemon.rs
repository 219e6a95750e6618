//! Request/reply daemon on a pair of named pipes.
//!
//! The daemon reads framed requests from its input FIFO, dispatches them to
//! registered commands and writes each reply to the output FIFO. Writers
//! serialize on a lock file next to the input FIFO; the daemon takes the
//! same lock before reopening its input after a writer hangs up, so a
//! request written in that window is never lost.

use super::commands::{CommandReply, IpcCommand};
use super::lock::FifoLock;
use super::protocol::{encode_reply, FrameBuffer, IpcRequest};
use crate::core::poll::{next_event, read_buf, PollEvent, PollFiles, ReadOutcome};
use crate::core::{Task, TaskCore, TaskExt, CANCELLED_RETURNCODE, EX_FAILURE};
use crate::{klog_debug, klog_error, klog_trace, klog_warn, Error, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use serde_json::Value;
use std::collections::HashMap;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio_util::sync::CancellationToken;

/// How often a deferred reopen retries the lock.
pub const REOPEN_RETRY: Duration = Duration::from_millis(100);

/// Longest a reply write may wait for the client to drain the FIFO.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub const INPUT_FIFO: &str = "in";
pub const OUTPUT_FIFO: &str = "out";
pub const LOCK_FILE: &str = "lock";

const INPUT: &str = "input";

/// Create the `in` and `out` FIFOs inside `dir`, creating `dir` too.
///
/// Existing FIFOs are kept; anything else in their place is replaced.
pub fn init_fifos(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    for name in [INPUT_FIFO, OUTPUT_FIFO] {
        let path = dir.join(name);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_fifo() => continue,
            Ok(_) => fs::remove_file(&path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        mkfifo(&path, Mode::S_IRWXU | Mode::S_IRWXG)?;
    }
    Ok(())
}

/// Open a FIFO for reading without waiting for a writer.
pub fn open_fifo_reader(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    /// Nobody had the reply FIFO open.
    PeerGone,
}

enum Wake {
    Cancelled,
    Event(io::Result<PollEvent>),
    RetryReopen,
}

#[derive(Debug, Default)]
struct DaemonStats {
    requests: AtomicUsize,
    replies: AtomicUsize,
    discarded: AtomicUsize,
    reopens: AtomicUsize,
    deferred: AtomicUsize,
}

pub struct IpcDaemon {
    core: TaskCore,
    input_fifo: PathBuf,
    output_fifo: PathBuf,
    lock_path: PathBuf,
    commands: HashMap<String, Arc<dyn IpcCommand>>,
    registered: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    stats: DaemonStats,
}

impl IpcDaemon {
    pub fn new(name: impl Into<String>, input_fifo: PathBuf, output_fifo: PathBuf) -> Self {
        let lock_path = input_fifo
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(LOCK_FILE);
        Self {
            core: TaskCore::new(name),
            input_fifo,
            output_fifo,
            lock_path,
            commands: HashMap::new(),
            registered: Arc::new(AtomicBool::new(false)),
            cancel_token: CancellationToken::new(),
            stats: DaemonStats::default(),
        }
    }

    /// Daemon using the `in`/`out`/`lock` files inside `dir`.
    pub fn in_dir(name: impl Into<String>, dir: &Path) -> Self {
        Self::new(name, dir.join(INPUT_FIFO), dir.join(OUTPUT_FIFO))
    }

    pub fn with_command(
        mut self,
        name: impl Into<String>,
        command: impl IpcCommand + 'static,
    ) -> Self {
        self.commands.insert(name.into(), Arc::new(command));
        self
    }

    pub fn with_shared_command(
        mut self,
        name: impl Into<String>,
        command: Arc<dyn IpcCommand>,
    ) -> Self {
        self.commands.insert(name.into(), command);
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Requests decoded and dispatched.
    pub fn requests_handled(&self) -> usize {
        self.stats.requests.load(Ordering::SeqCst)
    }

    pub fn replies_sent(&self) -> usize {
        self.stats.replies.load(Ordering::SeqCst)
    }

    /// Payloads dropped as malformed or incomplete.
    pub fn discarded(&self) -> usize {
        self.stats.discarded.load(Ordering::SeqCst)
    }

    /// Times the input FIFO was reopened.
    pub fn reopen_count(&self) -> usize {
        self.stats.reopens.load(Ordering::SeqCst)
    }

    /// Reopen attempts put off because a writer held the lock.
    pub fn reopens_deferred(&self) -> usize {
        self.stats.deferred.load(Ordering::SeqCst)
    }

    async fn serve(self: Arc<Self>, mut files: PollFiles) {
        let mut reopen_pending = false;

        loop {
            let Some(fd) = files.get(INPUT) else { break };
            // A hung-up descriptor stays readable, so it is only read on the
            // retry tick until the reopen goes through.
            let wake = if reopen_pending {
                tokio::select! {
                    _ = self.cancel_token.cancelled() => Wake::Cancelled,
                    _ = tokio::time::sleep(REOPEN_RETRY) => Wake::RetryReopen,
                }
            } else {
                tokio::select! {
                    _ = self.cancel_token.cancelled() => Wake::Cancelled,
                    event = next_event(fd) => Wake::Event(event),
                }
            };

            match wake {
                Wake::Cancelled => break,
                Wake::Event(Ok(PollEvent::Data(data))) => {
                    self.handle_data(&data, &mut files).await;
                }
                Wake::Event(Ok(PollEvent::Eof)) => {
                    reopen_pending = !self.reopen_locked(&mut files);
                }
                Wake::RetryReopen => {
                    let reopens = self.reopen_count();
                    let pending = files.get(INPUT).map(|fd| read_buf(fd.get_ref()));
                    match pending {
                        Some(Ok(ReadOutcome::Data(data))) => {
                            self.handle_data(&data, &mut files).await;
                        }
                        Some(Ok(_)) | None => {}
                        Some(Err(e)) => {
                            klog_error!("{}: reading input FIFO failed: {}", self.core.name(), e);
                            break;
                        }
                    }
                    reopen_pending =
                        self.reopen_count() == reopens && !self.reopen_locked(&mut files);
                }
                Wake::Event(Ok(PollEvent::Exceptional)) => {
                    klog_error!("{}: error condition on input FIFO", self.core.name());
                    files.unregister();
                    if let Err(e) = self.cancel() {
                        klog_error!("{}: cancel failed: {}", self.core.name(), e);
                    }
                    break;
                }
                Wake::Event(Err(e)) => {
                    klog_error!("{}: reading input FIFO failed: {}", self.core.name(), e);
                    break;
                }
            }
        }

        files.unregister();
        let code = if self.core.is_cancelled() {
            CANCELLED_RETURNCODE
        } else {
            EX_FAILURE
        };
        klog_debug!("{}: stopped", self.core.name());
        self.core.finish(code);
    }

    /// Dispatch every frame in one read burst. Writers send a request in a
    /// single atomic write, so bytes left over are never completed later.
    async fn handle_data(&self, data: &[u8], files: &mut PollFiles) {
        klog_trace!("{}: read {} bytes", self.core.name(), data.len());
        let mut frames = FrameBuffer::default();
        frames.extend(data);
        while let Some(frame) = frames.next_frame() {
            match frame {
                Ok(payload) => self.handle_payload(&payload, files).await,
                Err(reason) => self.discard(&reason),
            }
        }
        let partial = frames.clear();
        if partial > 0 {
            self.discard(&format!("{} bytes of an incomplete frame", partial));
        }
    }

    fn discard(&self, reason: &str) {
        klog_warn!("{}: discarding input: {}", self.core.name(), reason);
        self.stats.discarded.fetch_add(1, Ordering::SeqCst);
    }

    /// Reopen the input if no writer holds the lock. Returns `false` when
    /// the reopen has to be retried later.
    fn reopen_locked(&self, files: &mut PollFiles) -> bool {
        match FifoLock::try_acquire(&self.lock_path) {
            Ok(Some(_lock)) => {
                self.reopen_input(files);
                true
            }
            Ok(None) => {
                klog_trace!("{}: writer holds the lock, deferring reopen", self.core.name());
                self.stats.deferred.fetch_add(1, Ordering::SeqCst);
                false
            }
            Err(e) => {
                klog_error!(
                    "{}: cannot take {}: {}",
                    self.core.name(),
                    self.lock_path.display(),
                    e
                );
                false
            }
        }
    }

    fn reopen_input(&self, files: &mut PollFiles) {
        // Open the new descriptor before the old one closes, so data already
        // in the pipe survives the swap.
        match open_fifo_reader(&self.input_fifo) {
            Ok(file) => {
                if let Err(e) = files.register(INPUT, file) {
                    klog_error!("{}: cannot register input FIFO: {}", self.core.name(), e);
                    files.unregister();
                    return;
                }
                self.stats.reopens.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                klog_error!(
                    "{}: cannot reopen {}: {}",
                    self.core.name(),
                    self.input_fifo.display(),
                    e
                );
            }
        }
    }

    async fn handle_payload(&self, payload: &[u8], files: &mut PollFiles) {
        let request = match IpcRequest::from_payload(payload) {
            Ok(request) => request,
            Err(e) => {
                self.discard(&e.to_string());
                return;
            }
        };
        // The writer is done with this request; get ready for the next one.
        self.reopen_input(files);

        klog_debug!("{}: {} {:?}", self.core.name(), request.command, request.args);
        self.stats.requests.fetch_add(1, Ordering::SeqCst);
        let command = self.commands.get(&request.command).cloned();
        let reply = match &command {
            Some(command) => command.call(&request),
            None => {
                klog_warn!("{}: unknown command '{}'", self.core.name(), request.command);
                CommandReply::error(format!("unknown command: {}", request.command)).to_value()
            }
        };

        match self.send_reply(&reply).await {
            Ok(Delivery::Delivered) => {
                self.stats.replies.fetch_add(1, Ordering::SeqCst);
                if let Some(command) = command {
                    command.reply_hook();
                }
            }
            Ok(Delivery::PeerGone) => {
                if let Some(command) = command {
                    command.reply_hook();
                }
            }
            Err(e) => {
                klog_error!("{}: reply to {} failed: {}", self.core.name(), request.command, e);
            }
        }
    }

    async fn send_reply(&self, reply: &Value) -> Result<Delivery> {
        let frame = encode_reply(reply)?;
        let file = match OpenOptions::new()
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&self.output_fifo)
        {
            Ok(file) => file,
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                klog_warn!(
                    "{}: no reader on {}, dropping reply",
                    self.core.name(),
                    self.output_fifo.display()
                );
                return Ok(Delivery::PeerGone);
            }
            Err(e) => return Err(e.into()),
        };
        let fd = AsyncFd::with_interest(file, Interest::WRITABLE)?;
        tokio::time::timeout(REPLY_TIMEOUT, write_all(&fd, &frame))
            .await
            .map_err(|_| Error::Timeout(REPLY_TIMEOUT))?
    }
}

async fn write_all(fd: &AsyncFd<File>, frame: &[u8]) -> Result<Delivery> {
    let mut written = 0;
    while written < frame.len() {
        let mut guard = fd.writable().await?;
        let remaining = &frame[written..];
        match guard.try_io(|inner| {
            let mut file = inner.get_ref();
            file.write(remaining)
        }) {
            Ok(Ok(n)) => written += n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(Delivery::PeerGone),
            Ok(Err(e)) => return Err(e.into()),
            Err(_would_block) => continue,
        }
    }
    Ok(Delivery::Delivered)
}

impl Task for IpcDaemon {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn on_start(self: Arc<Self>) -> Result<()> {
        let iface = self.core.scheduler()?;
        let mut files = PollFiles::new(Arc::clone(&self.registered));
        files.register(INPUT, open_fifo_reader(&self.input_fifo)?)?;
        klog_debug!("{}: listening on {}", self.core.name(), self.input_fifo.display());
        iface.spawn(Arc::clone(&self).serve(files));
        Ok(())
    }

    fn on_cancel(&self) -> Result<()> {
        self.cancel_token.cancel();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.is_registered()
    }
}
