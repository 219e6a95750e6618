//! Task engine core.
//!
//! Every unit of work is a [`Task`]: a state machine with a set-once
//! returncode, monotonic cancellation, and exit listeners. Composite tasks
//! run child tasks one at a time, subprocess tasks run an external program,
//! and [`poll`] holds the descriptor plumbing both of them share with the
//! IPC daemon.

pub mod composite;
pub mod poll;
pub mod subprocess;
pub mod task;


pub use composite::{Composite, CurrentChild, TaskSequence};
pub use poll::{PollEvent, PollFiles, ReadOutcome};
pub use subprocess::{ProcessSpec, SubprocessTask};
pub use task::{
    ExitListener, ListenerId, ReturnCodeTask, SchedulerInterface, StartListener, Task, TaskCore,
    TaskExt, TaskId, CANCELLED_RETURNCODE, EX_FAILURE, EX_OK,
};
