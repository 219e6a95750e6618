//! Commands the IPC daemon can dispatch.

use super::protocol::IpcRequest;
use crate::core::EX_FAILURE;
use crate::util::lock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A handler registered under a command name.
pub trait IpcCommand: Send + Sync {
    /// Compute the reply for `request`.
    fn call(&self, request: &IpcRequest) -> Value;

    /// Runs after the reply for the last `call` was delivered.
    fn reply_hook(&self) {}
}

impl<F> IpcCommand for F
where
    F: Fn(&IpcRequest) -> Value + Send + Sync,
{
    fn call(&self, request: &IpcRequest) -> Value {
        self(request)
    }
}

/// Reply shape for commands that behave like a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
}

impl CommandReply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            returncode: EX_FAILURE,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "stdout": self.stdout,
            "stderr": self.stderr,
            "returncode": self.returncode,
        })
    }
}

/// Hook run once after the first exit request has been answered.
pub type ExitHook = Box<dyn Fn(i32) + Send + Sync>;

/// Records the exit code a build phase reports for itself.
///
/// The first request wins; later ones are acknowledged but ignored. A
/// missing or unparsable code counts as failure.
#[derive(Default)]
pub struct ExitCommand {
    exitcode: Mutex<Option<i32>>,
    hook: Option<ExitHook>,
    hook_armed: AtomicBool,
}

impl ExitCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: impl Fn(i32) + Send + Sync + 'static) -> Self {
        Self {
            hook: Some(Box::new(hook)),
            ..Self::default()
        }
    }

    pub fn exitcode(&self) -> Option<i32> {
        *lock(&self.exitcode)
    }
}

impl IpcCommand for ExitCommand {
    fn call(&self, request: &IpcRequest) -> Value {
        let mut exitcode = lock(&self.exitcode);
        if exitcode.is_none() {
            let code = request
                .args
                .first()
                .and_then(|arg| arg.parse().ok())
                .unwrap_or(EX_FAILURE);
            *exitcode = Some(code);
            self.hook_armed.store(true, Ordering::SeqCst);
        }
        CommandReply::ok().to_value()
    }

    fn reply_hook(&self) {
        if !self.hook_armed.swap(false, Ordering::SeqCst) {
            return;
        }
        if let (Some(hook), Some(code)) = (&self.hook, self.exitcode()) {
            hook(code);
        }
    }
}
