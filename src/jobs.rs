//! # Job Registry
//!
//! Tracks the jobs accepted by the [`Controller`](crate::controller::Controller).
//! A job is `Pending` until its worker writes a result, then `Done` until the
//! first poll reads that result, after which it is forgotten. The registry keeps
//! no history, so a consumed id and an id that never existed poll the same way.
//!
//! All state sits behind one mutex; `allocate`, `complete` and the
//! read-then-evict step of `poll` each run under a single lock acquisition.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use rand::Rng;

pub type JobId = u32;

/// Default upper bound (inclusive) for generated job ids.
pub const DEFAULT_ID_SPACE: u32 = 100_000;

pub const MISSING_JOB_INFO: &str = "job id doesn't exist anymore";
pub const PENDING_JOB_INFO: &str = "not finished yet";

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobState {
    Pending,
    Done(String),
}

/// Outcome of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub is_finished: bool,
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Every id in the id space is taken by a tracked job.
    Exhausted { id_space: u32 },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Exhausted { id_space } => {
                write!(f, "all {} job ids are in use", id_space)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, JobState>>,
    id_space: u32,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_id_space(DEFAULT_ID_SPACE)
    }

    /// Registry drawing ids uniformly from `1..=id_space`.
    pub fn with_id_space(id_space: u32) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            id_space: id_space.max(1),
        }
    }

    // A worker that panicked mid-update cannot leave the map half-written, so a
    // poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobState>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves a fresh id and marks it `Pending`. Ids colliding with a tracked job are re-rolled.
    pub fn allocate(&self) -> Result<JobId, RegistryError> {
        let mut jobs = self.lock();
        if jobs.len() >= self.id_space as usize {
            return Err(RegistryError::Exhausted { id_space: self.id_space });
        }

        let mut rng = rand::thread_rng();
        let mut id = rng.gen_range(1..=self.id_space);
        while jobs.contains_key(&id) {
            debug!("Job id {} already tracked, re-rolling", id);
            id = rng.gen_range(1..=self.id_space);
        }
        jobs.insert(id, JobState::Pending);
        Ok(id)
    }

    /// Moves a pending job to `Done`. Unknown or already finished ids are logged and ignored.
    pub fn complete(&self, job_id: JobId, result: String) {
        let mut jobs = self.lock();
        match jobs.get_mut(&job_id) {
            Some(state) if *state == JobState::Pending => *state = JobState::Done(result),
            Some(_) => warn!("Job {} completed twice, keeping the first result", job_id),
            None => warn!("Job {} completed but is no longer tracked", job_id),
        }
    }

    /// Reports a job's state. A finished job is removed by the poll that returns its result.
    pub fn poll(&self, job_id: JobId) -> JobStatus {
        let mut jobs = self.lock();
        match jobs.remove(&job_id) {
            None => JobStatus {
                is_finished: true,
                info: MISSING_JOB_INFO.to_string(),
            },
            Some(JobState::Pending) => {
                jobs.insert(job_id, JobState::Pending);
                JobStatus {
                    is_finished: false,
                    info: PENDING_JOB_INFO.to_string(),
                }
            }
            Some(JobState::Done(result)) => JobStatus {
                is_finished: true,
                info: result,
            },
        }
    }

    /// Number of tracked (pending or unread) jobs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_allocate_marks_pending() {
        let registry = JobRegistry::new();
        let id = registry.allocate().unwrap();
        assert!((1..=DEFAULT_ID_SPACE).contains(&id));
        assert_eq!(
            registry.poll(id),
            JobStatus { is_finished: false, info: PENDING_JOB_INFO.to_string() }
        );
        // Polling a pending job does not consume it.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_result_is_read_once() {
        let registry = JobRegistry::new();
        let id = registry.allocate().unwrap();
        registry.complete(id, "done".to_string());

        let first = registry.poll(id);
        assert!(first.is_finished);
        assert_eq!(first.info, "done");

        let second = registry.poll(id);
        assert!(second.is_finished);
        assert_eq!(second.info, MISSING_JOB_INFO);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_id_reports_missing() {
        let registry = JobRegistry::new();
        let status = registry.poll(42);
        assert!(status.is_finished);
        assert_eq!(status.info, MISSING_JOB_INFO);
    }

    #[test]
    fn test_complete_unknown_id_is_ignored() {
        let registry = JobRegistry::new();
        registry.complete(7, "orphan".to_string());
        assert!(registry.is_empty());
        assert_eq!(registry.poll(7).info, MISSING_JOB_INFO);
    }

    #[test]
    fn test_second_complete_keeps_first_result() {
        let registry = JobRegistry::new();
        let id = registry.allocate().unwrap();
        registry.complete(id, "first".to_string());
        registry.complete(id, "second".to_string());
        assert_eq!(registry.poll(id).info, "first");
    }

    #[test]
    fn test_ids_unique_across_small_space() {
        let registry = JobRegistry::with_id_space(16);
        let ids: HashSet<JobId> = (0..16).map(|_| registry.allocate().unwrap()).collect();
        assert_eq!(ids.len(), 16);
        assert_eq!(registry.allocate(), Err(RegistryError::Exhausted { id_space: 16 }));

        // Reading a result frees its id for reuse.
        let some_id = *ids.iter().next().unwrap();
        registry.complete(some_id, "ok".to_string());
        registry.poll(some_id);
        assert_eq!(registry.allocate(), Ok(some_id));
    }

    #[test]
    fn test_concurrent_polls_have_one_winner() {
        const POLLERS: usize = 16;
        let registry = Arc::new(JobRegistry::new());
        let id = registry.allocate().unwrap();
        registry.complete(id, "the result".to_string());

        let barrier = Arc::new(Barrier::new(POLLERS));
        let handles: Vec<_> = (0..POLLERS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.poll(id)
                })
            })
            .collect();

        let results: Vec<JobStatus> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.iter().all(|s| s.is_finished));
        let winners = results.iter().filter(|s| s.info == "the result").count();
        let losers = results.iter().filter(|s| s.info == MISSING_JOB_INFO).count();
        assert_eq!(winners, 1);
        assert_eq!(losers, POLLERS - 1);
    }
}
