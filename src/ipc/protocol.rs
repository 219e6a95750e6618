//! Wire format for the FIFO channel.
//!
//! Every message is a frame: a 4-byte big-endian payload length followed by
//! that many bytes of JSON. Requests are a JSON array of strings
//! `[command, root, args...]`; replies are any JSON value.

use crate::{Error, Result};
use serde_json::Value;
use std::path::PathBuf;

/// Length prefix size.
pub const HEADER_LEN: usize = 4;

/// Largest payload accepted in either direction.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Largest request frame, `PIPE_BUF`, so a request reaches the daemon in
/// one atomic write.
pub const MAX_REQUEST_LEN: usize = 4096;

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!(
            "payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDecode {
    /// A whole frame; `consumed` counts the header too.
    Complete { payload: Vec<u8>, consumed: usize },
    /// More bytes are needed.
    Incomplete,
    /// The header announces an impossible length.
    Invalid(String),
}

pub fn decode_frame(buf: &[u8]) -> FrameDecode {
    let Some(header) = buf.get(..HEADER_LEN) else {
        return FrameDecode::Incomplete;
    };
    let mut len = [0u8; HEADER_LEN];
    len.copy_from_slice(header);
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return FrameDecode::Invalid(format!("frame length {} exceeds limit", len));
    }
    match buf.get(HEADER_LEN..HEADER_LEN + len) {
        Some(payload) => FrameDecode::Complete {
            payload: payload.to_vec(),
            consumed: HEADER_LEN + len,
        },
        None => FrameDecode::Incomplete,
    }
}

/// Accumulates bytes from one writer and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The next complete frame, `None` if more bytes are needed. An invalid
    /// header discards everything buffered.
    pub fn next_frame(&mut self) -> Option<std::result::Result<Vec<u8>, String>> {
        match decode_frame(&self.buf) {
            FrameDecode::Complete { payload, consumed } => {
                self.buf.drain(..consumed);
                Some(Ok(payload))
            }
            FrameDecode::Incomplete => None,
            FrameDecode::Invalid(reason) => {
                self.buf.clear();
                Some(Err(reason))
            }
        }
    }

    /// Drop any partial frame. Returns how many bytes were discarded.
    pub fn clear(&mut self) -> usize {
        let pending = self.buf.len();
        self.buf.clear();
        pending
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// A command invocation sent by a build phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcRequest {
    pub command: String,
    /// Root filesystem the command applies to.
    pub root: PathBuf,
    pub args: Vec<String>,
}

impl IpcRequest {
    pub fn new(command: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            root: root.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Encode as a complete frame.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let mut fields = Vec::with_capacity(self.args.len() + 2);
        fields.push(self.command.clone());
        fields.push(self.root.to_string_lossy().into_owned());
        fields.extend(self.args.iter().cloned());
        let frame = encode_frame(&serde_json::to_vec(&fields)?)?;
        if frame.len() > MAX_REQUEST_LEN {
            return Err(Error::Ipc(format!(
                "{} request of {} bytes exceeds the {} byte limit",
                self.command,
                frame.len(),
                MAX_REQUEST_LEN
            )));
        }
        Ok(frame)
    }

    /// Decode a frame payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let fields: Vec<String> = serde_json::from_slice(payload)?;
        let mut fields = fields.into_iter();
        match (fields.next(), fields.next()) {
            (Some(command), Some(root)) if !command.is_empty() => Ok(Self {
                command,
                root: PathBuf::from(root),
                args: fields.collect(),
            }),
            _ => Err(Error::Ipc("request needs a command and a root".to_string())),
        }
    }
}

pub fn encode_reply(reply: &Value) -> Result<Vec<u8>> {
    encode_frame(&serde_json::to_vec(reply)?)
}

pub fn decode_reply(payload: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(payload)?)
}
