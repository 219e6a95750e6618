//! Set of running jobs.
//!
//! The `RunningSet` owns a strong reference to every job the scheduler has
//! admitted and not yet seen exit, keyed by task identity. It also records
//! the highest concurrency observed, which the schedule summary reports.

use crate::core::{Task, TaskId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct RunningSet {
    /// Running jobs indexed by their ID.
    jobs: HashMap<TaskId, Arc<dyn Task>>,
    /// Highest number of jobs ever running at once.
    peak: usize,
}

impl RunningSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job. Returns the number now running.
    pub fn insert(&mut self, job: Arc<dyn Task>) -> usize {
        self.jobs.insert(job.core().id(), job);
        self.peak = self.peak.max(self.jobs.len());
        self.jobs.len()
    }

    /// Remove a job by ID, returning it if it was running.
    pub fn remove(&mut self, id: &TaskId) -> Option<Arc<dyn Task>> {
        self.jobs.remove(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Arc<dyn Task>> {
        self.jobs.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.jobs.contains_key(id)
    }

    /// Get the number of running jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    /// Strong references to every running job, for cancellation.
    pub fn snapshot(&self) -> Vec<Arc<dyn Task>> {
        self.jobs.values().cloned().collect()
    }

    /// Remove and return every running job.
    pub fn drain(&mut self) -> Vec<Arc<dyn Task>> {
        self.jobs.drain().map(|(_, job)| job).collect()
    }
}
