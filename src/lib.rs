pub mod config;
pub mod core;
pub mod error;
pub mod ipc;
pub mod log;
pub mod merge;
pub mod orchestration;
pub mod phase;
pub mod plan;
pub mod util;

pub use crate::core::{
    Composite, ProcessSpec, ReturnCodeTask, SchedulerInterface, SubprocessTask, Task, TaskCore,
    TaskExt, TaskId, TaskSequence, CANCELLED_RETURNCODE,
};
pub use error::{Error, Result};
pub use merge::{MergeList, MergeListItem, PackageBuild, Priority};
pub use orchestration::{JobLimit, ScheduleSummary, Scheduler, SchedulerConfig};
pub use phase::BuildPhase;
pub use plan::BuildPlan;
