//! Non-blocking descriptor reads and readiness handling.
//!
//! Subprocess tasks and the IPC daemon register pipe or FIFO read ends in a
//! [`PollFiles`] set and wait on them with [`next_event`]. Descriptors are
//! owned by the set, so closing happens exactly once when the set is
//! unregistered or dropped.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::io::{Interest, Ready};

/// Chunk size for a single `read(2)`.
pub const BUFSIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Nothing to read right now.
    Pending,
    /// Every writer is gone.
    Eof,
    Data(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Pending,
    Eof,
    Filled(usize),
}

/// What woke a registered descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Data(Vec<u8>),
    /// Hang-up with nothing left to read.
    Eof,
    /// Error condition on the descriptor.
    Exceptional,
}

fn is_disconnected(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::EIO as i32)
}

/// Read everything currently available, growing the buffer as needed.
///
/// `EAGAIN` with nothing read is [`ReadOutcome::Pending`]; `EIO` (a pty whose
/// other side closed) counts as end of file; `EINTR` is retried.
pub fn read_buf(file: &File) -> io::Result<ReadOutcome> {
    let mut reader = file;
    let mut data = Vec::new();
    let mut chunk = [0u8; BUFSIZE];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if data.is_empty() {
                    return Ok(ReadOutcome::Pending);
                }
                return Ok(ReadOutcome::Data(data));
            }
            Err(e) if is_disconnected(&e) => break,
            Err(e) => return Err(e),
        }
    }
    if data.is_empty() {
        Ok(ReadOutcome::Eof)
    } else {
        Ok(ReadOutcome::Data(data))
    }
}

/// Single read into a caller-provided buffer.
pub fn read_array(file: &File, buf: &mut [u8]) -> io::Result<ChunkOutcome> {
    let mut reader = file;
    loop {
        return match reader.read(buf) {
            Ok(0) => Ok(ChunkOutcome::Eof),
            Ok(n) => Ok(ChunkOutcome::Filled(n)),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ChunkOutcome::Pending),
            Err(e) if is_disconnected(&e) => Ok(ChunkOutcome::Eof),
            Err(e) => Err(e),
        };
    }
}

pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Wait for the next readiness event on `fd` and read what it signals.
///
/// End of file is sticky: once every writer is gone, later calls on the
/// same descriptor return [`PollEvent::Eof`] right away, so a caller that
/// keeps it open must stop polling it until it is replaced.
pub async fn next_event(fd: &AsyncFd<File>) -> io::Result<PollEvent> {
    loop {
        let mut guard = fd.ready(Interest::READABLE | Interest::ERROR).await?;
        let ready = guard.ready();
        if ready.is_error() {
            return Ok(PollEvent::Exceptional);
        }
        match read_buf(guard.get_inner())? {
            ReadOutcome::Data(data) => return Ok(PollEvent::Data(data)),
            ReadOutcome::Pending => {
                guard.clear_ready_matching(Ready::READABLE);
            }
            ReadOutcome::Eof => {
                guard.clear_ready();
                return Ok(PollEvent::Eof);
            }
        }
    }
}

/// Descriptors registered with the reactor on behalf of one task.
pub struct PollFiles {
    files: HashMap<&'static str, AsyncFd<File>>,
    registered: Arc<AtomicBool>,
}

impl PollFiles {
    /// `registered` mirrors whether any descriptor is currently held, so the
    /// owning task can answer `is_alive` without reaching into its driver.
    pub fn new(registered: Arc<AtomicBool>) -> Self {
        Self {
            files: HashMap::new(),
            registered,
        }
    }

    /// Switch `file` to non-blocking mode and register it for reading.
    ///
    /// Replaces (and closes) any descriptor already registered as `name`.
    pub fn register(&mut self, name: &'static str, file: File) -> io::Result<()> {
        set_nonblocking(file.as_raw_fd()).map_err(io::Error::from)?;
        let fd = AsyncFd::with_interest(file, Interest::READABLE)?;
        self.files.insert(name, fd);
        self.registered.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&AsyncFd<File>> {
        self.files.get(name)
    }

    pub fn is_registered(&self) -> bool {
        !self.files.is_empty()
    }

    /// Deregister and close every descriptor. Returns how many were closed;
    /// repeated calls close nothing.
    pub fn unregister(&mut self) -> usize {
        let closed = self.files.len();
        self.files.clear();
        self.registered.store(false, Ordering::SeqCst);
        closed
    }
}

impl Drop for PollFiles {
    fn drop(&mut self) {
        self.unregister();
    }
}
