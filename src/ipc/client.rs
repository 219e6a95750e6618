//! Client side of the FIFO channel, used by `kiln ipc` from build phases.

use super::daemon::{open_fifo_reader, INPUT_FIFO, LOCK_FILE, OUTPUT_FIFO};
use super::lock::FifoLock;
use super::protocol::{decode_reply, FrameBuffer, IpcRequest};
use crate::core::poll::{next_event, PollEvent};
use crate::util::{blocking, blocking_with_timeout};
use crate::{klog_debug, Error, Result};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct IpcClient {
    input_fifo: PathBuf,
    output_fifo: PathBuf,
    lock_path: PathBuf,
    timeout: Duration,
}

impl IpcClient {
    pub fn new(input_fifo: PathBuf, output_fifo: PathBuf, lock_path: PathBuf) -> Self {
        Self {
            input_fifo,
            output_fifo,
            lock_path,
            timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Client for a daemon serving the `in`/`out`/`lock` files in `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(INPUT_FIFO), dir.join(OUTPUT_FIFO), dir.join(LOCK_FILE))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request and wait for its reply.
    ///
    /// The lock is held for the whole exchange, so the daemon never reopens
    /// its input between our write and its read.
    pub async fn send(&self, request: &IpcRequest) -> Result<Value> {
        let frame = request.to_frame()?;

        let lock_path = self.lock_path.clone();
        let _lock = blocking(move || FifoLock::acquire(&lock_path)).await?;

        // Open the reply side first so the daemon's non-blocking open finds
        // a reader.
        let reply =
            AsyncFd::with_interest(open_fifo_reader(&self.output_fifo)?, Interest::READABLE)?;

        let input = self.input_fifo.clone();
        blocking_with_timeout(self.timeout, move || {
            let mut fifo = OpenOptions::new().write(true).open(&input)?;
            fifo.write_all(&frame)?;
            Ok(())
        })
        .await?;
        klog_debug!("ipc: sent {} request", request.command);

        let payload = tokio::time::timeout(self.timeout, read_reply(&reply))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;
        decode_reply(&payload)
    }
}

async fn read_reply(fd: &AsyncFd<File>) -> Result<Vec<u8>> {
    let mut frames = FrameBuffer::default();
    loop {
        match next_event(fd).await? {
            PollEvent::Data(data) => {
                frames.extend(&data);
                if let Some(frame) = frames.next_frame() {
                    return frame.map_err(Error::Ipc);
                }
            }
            PollEvent::Eof => {
                return Err(Error::Ipc(
                    "daemon closed the reply FIFO before a full reply".to_string(),
                ))
            }
            PollEvent::Exceptional => {
                return Err(Error::Ipc("error condition on reply FIFO".to_string()))
            }
        }
    }
}
