//! Request/reply channel between build phases and the engine.
//!
//! A build phase talks to the engine through two named pipes: it writes a
//! framed request to the daemon's input FIFO and reads the framed reply from
//! the output FIFO. [`init_fifos`] creates the pair inside a build
//! directory before the daemon starts.

mod client;
mod commands;
mod daemon;
mod lock;
mod protocol;

pub use client::{IpcClient, DEFAULT_REPLY_TIMEOUT};
pub use commands::{CommandReply, ExitCommand, ExitHook, IpcCommand};
pub use daemon::{
    init_fifos, open_fifo_reader, IpcDaemon, INPUT_FIFO, LOCK_FILE, OUTPUT_FIFO, REOPEN_RETRY,
    REPLY_TIMEOUT,
};
pub use lock::FifoLock;
pub use protocol::{
    decode_frame, decode_reply, encode_frame, encode_reply, FrameBuffer, FrameDecode, IpcRequest,
    HEADER_LEN, MAX_FRAME_LEN, MAX_REQUEST_LEN,
};
