use std::fmt;
use std::num::NonZeroUsize;

/// Ceiling on concurrently running jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobLimit {
    /// No ceiling.
    Unlimited,
    /// At most this many jobs at once.
    Max(NonZeroUsize),
}

impl Default for JobLimit {
    /// One job at a time.
    fn default() -> Self {
        JobLimit::Max(NonZeroUsize::MIN)
    }
}

impl From<usize> for JobLimit {
    fn from(value: usize) -> Self {
        NonZeroUsize::new(value)
            .map(JobLimit::Max)
            .unwrap_or(JobLimit::Unlimited)
    }
}

impl JobLimit {
    /// Whether another job may start while `running` are active.
    pub fn allows(&self, running: usize) -> bool {
        match self {
            JobLimit::Unlimited => true,
            JobLimit::Max(max) => running < max.get(),
        }
    }

    /// Whether more than one job can ever run at once.
    pub fn is_parallel(&self) -> bool {
        match self {
            JobLimit::Unlimited => true,
            JobLimit::Max(max) => max.get() > 1,
        }
    }

    pub fn get(&self) -> Option<usize> {
        match self {
            JobLimit::Unlimited => None,
            JobLimit::Max(max) => Some(max.get()),
        }
    }
}

impl fmt::Display for JobLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobLimit::Unlimited => write!(f, "unlimited"),
            JobLimit::Max(max) => write!(f, "{}", max),
        }
    }
}
