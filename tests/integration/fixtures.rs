//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Tasks that take a while and record how many run at once
//! - FIFO directories for the IPC daemon
//! - Polling a condition with a deadline

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kiln::core::{SchedulerInterface, Task, TaskCore};
use kiln::ipc::{INPUT_FIFO, OUTPUT_FIFO};
use kiln::orchestration::{LoadAverage, LoadSampler};
use nix::sys::stat::Mode;
use tempfile::TempDir;

/// Tracks how many tasks sharing it are running right now, and the most
/// that ever ran together.
#[derive(Debug, Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl Gauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Sleeps on the runtime, then finishes with a fixed code.
pub struct SlowTask {
    core: TaskCore,
    delay: Duration,
    code: i32,
    gauge: Arc<Gauge>,
}

impl SlowTask {
    pub fn new(name: &str, delay: Duration, code: i32, gauge: &Arc<Gauge>) -> Arc<Self> {
        Arc::new(Self {
            core: TaskCore::new(name),
            delay,
            code,
            gauge: Arc::clone(gauge),
        })
    }
}

impl Task for SlowTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn on_start(self: Arc<Self>) -> kiln::Result<()> {
        let iface = self.core.scheduler()?;
        self.gauge.enter();
        let task = Arc::clone(&self);
        iface.spawn(async move {
            tokio::time::sleep(task.delay).await;
            task.gauge.leave();
            task.core.finish(task.code);
        });
        Ok(())
    }

    fn on_cancel(&self) -> kiln::Result<()> {
        // Stays in the gauge until its sleep ends; finish now.
        self.core.finish(kiln::CANCELLED_RETURNCODE);
        Ok(())
    }
}

/// Load sampler that always reports the same value.
pub struct FixedLoad(pub f64);

impl LoadSampler for FixedLoad {
    fn sample(&self) -> io::Result<LoadAverage> {
        Ok(LoadAverage {
            one: self.0,
            five: self.0,
            fifteen: self.0,
        })
    }
}

/// Load sampler that always fails.
pub struct BrokenLoad;

impl LoadSampler for BrokenLoad {
    fn sample(&self) -> io::Result<LoadAverage> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "loadavg unavailable"))
    }
}

/// A temporary directory holding the daemon's `in` and `out` FIFOs.
pub struct FifoDir {
    pub temp_dir: TempDir,
}

impl FifoDir {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        for name in [INPUT_FIFO, OUTPUT_FIFO] {
            nix::unistd::mkfifo(&temp_dir.path().join(name), Mode::S_IRUSR | Mode::S_IWUSR)
                .expect("Failed to create FIFO");
        }
        Self { temp_dir }
    }

    pub fn path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    pub fn input(&self) -> PathBuf {
        self.path().join(INPUT_FIFO)
    }
}

/// Interface for tasks started directly by a test.
pub fn background() -> SchedulerInterface {
    SchedulerInterface::current(true).expect("tests run inside a tokio runtime")
}

/// Poll `condition` every 10ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Write raw bytes to a FIFO and close it, off the runtime.
pub async fn write_raw(path: PathBuf, bytes: Vec<u8>) {
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        let mut fifo = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("Failed to open FIFO for writing");
        fifo.write_all(&bytes).expect("Failed to write FIFO");
    })
    .await
    .expect("writer thread panicked");
}

/// Write raw bytes to a FIFO and keep the write end open.
pub async fn write_and_hold(path: PathBuf, bytes: Vec<u8>) -> std::fs::File {
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        let mut fifo = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("Failed to open FIFO for writing");
        fifo.write_all(&bytes).expect("Failed to write FIFO");
        fifo
    })
    .await
    .expect("writer thread panicked")
}
