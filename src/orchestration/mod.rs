//! Job admission and queueing.
//!
//! The [`Scheduler`] starts jobs from a [`JobSource`] within a job ceiling
//! and a load-average limit. A [`TaskQueue`] throttles side work (fetches)
//! with its own ceiling.

mod guard;
mod limits;
mod loadavg;
mod pool;
mod queue;
mod scheduler;

pub use guard::PassGuard;
pub use limits::JobLimit;
pub use loadavg::{LoadAverage, LoadSampler, ProcLoadAvg};
pub use pool::RunningSet;
pub use queue::TaskQueue;
pub use scheduler::{
    admission, Admission, JobFailure, JobSource, ScheduleSummary, Scheduler, SchedulerConfig,
    SchedulerEvent, TerminateHandle, DEFAULT_LOADAVG_LATENCY,
};
