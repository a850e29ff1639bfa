//! Priority Queue Manager: admits jobs, orders by priority, groups by
//! phase, handles retries with backoff.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{Job, JobStatus, LoadResult, LoadingError};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} already present in the queue")]
    DuplicateJob(Uuid),
    #[error("job {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone)]
struct PendingEntry {
    priority: u8,
    created_at: DateTime<Utc>,
    job: Job,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.created_at == other.created_at
    }
}
impl Eq for PendingEntry {}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, then earlier
        // created_at first among equal priorities.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}
impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    pending: BinaryHeap<PendingEntry>,
    known_ids: HashSet<Uuid>,
    running: HashMap<Uuid, Job>,
    completed: HashMap<Uuid, (Job, LoadResult)>,
    failed: HashMap<Uuid, (Job, LoadingError)>,
}

/// Single in-process priority queue shared by the orchestrator and worker
/// pool. All mutation is serialized behind a mutex.
pub struct Queue {
    state: Mutex<State>,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: BinaryHeap::new(),
                known_ids: HashSet::new(),
                running: HashMap::new(),
                completed: HashMap::new(),
                failed: HashMap::new(),
            }),
        }
    }

    pub fn add(&self, job: Job) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.known_ids.contains(&job.id) {
            return Err(QueueError::DuplicateJob(job.id));
        }
        state.known_ids.insert(job.id);
        state.pending.push(PendingEntry { priority: job.priority, created_at: job.created_at, job });
        Ok(())
    }

    /// Removes up to `k` highest-priority pending jobs whose phase is not
    /// blocked, and marks them `running`.
    pub fn next_batch<F>(&self, k: usize, phase_is_ready: F) -> Vec<Job>
    where
        F: Fn(Option<&str>) -> bool,
    {
        let mut state = self.state.lock().unwrap();
        let mut taken = Vec::new();
        let mut deferred = Vec::new();

        while taken.len() < k {
            match state.pending.pop() {
                Some(entry) => {
                    if phase_is_ready(entry.job.phase()) {
                        let mut job = entry.job;
                        job.status = JobStatus::Running;
                        job.started_at = Some(Utc::now());
                        taken.push(job.clone());
                        state.running.insert(job.id, job);
                    } else {
                        deferred.push(entry);
                    }
                }
                None => break,
            }
        }
        for entry in deferred {
            state.pending.push(entry);
        }
        taken
    }

    pub fn has_pending_for(&self, phase: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.pending.iter().any(|e| e.job.phase() == Some(phase))
    }

    pub fn queue_depth(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().unwrap().running.len()
    }

    pub fn complete(&self, job_id: Uuid, result: LoadResult) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let mut job = state.running.remove(&job_id).ok_or(QueueError::NotFound(job_id))?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.processed_records = result.records_loaded;
        state.completed.insert(job_id, (job, result));
        Ok(())
    }

    /// Terminal or retryable failure. Retryable jobs with budget left are
    /// re-admitted to `pending` with a later `created_at` (never jumping
    /// ahead of equal-priority never-tried jobs).
    pub fn fail(&self, job_id: Uuid, error: LoadingError, config: &Config) -> Result<bool, QueueError> {
        let mut state = self.state.lock().unwrap();
        let mut job = state.running.remove(&job_id).ok_or(QueueError::NotFound(job_id))?;
        job.error_count += 1;

        if error.retryable && job.retry_count < job.max_retries {
            job.retry_count += 1;
            job.status = JobStatus::Pending;
            job.created_at = Utc::now() + chrono::Duration::from_std(config.retry_delay(job.retry_count)).unwrap_or_default();
            state.pending.push(PendingEntry { priority: job.priority, created_at: job.created_at, job });
            Ok(true)
        } else {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            state.failed.insert(job_id, (job, error));
            Ok(false)
        }
    }

    /// Returns a `running` job to `pending` after an admission denial
    /// (budget exhausted, worker pool saturated). Unlike `fail`, this never
    /// touches `error_count`/`retry_count` — the job was never attempted.
    pub fn requeue(&self, job_id: Uuid, delay: chrono::Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let mut job = state.running.remove(&job_id).ok_or(QueueError::NotFound(job_id))?;
        job.status = JobStatus::Pending;
        job.started_at = None;
        job.created_at = Utc::now() + delay;
        state.pending.push(PendingEntry { priority: job.priority, created_at: job.created_at, job });
        Ok(())
    }

    pub fn is_phase_complete(&self, phase: &str) -> bool {
        let state = self.state.lock().unwrap();
        let no_pending = !state.pending.iter().any(|e| e.job.phase() == Some(phase));
        let no_running = !state.running.values().any(|j| j.phase() == Some(phase));
        no_pending && no_running
    }

    pub fn completed_count_for(&self, phase: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.completed.values().filter(|(job, _)| job.phase() == Some(phase)).count()
    }

    pub fn total_count_for(&self, phase: &str) -> usize {
        let state = self.state.lock().unwrap();
        let completed = state.completed.values().filter(|(job, _)| job.phase() == Some(phase)).count();
        let failed = state.failed.values().filter(|(job, _)| job.phase() == Some(phase)).count();
        let pending = state.pending.iter().filter(|e| e.job.phase() == Some(phase)).count();
        let running = state.running.values().filter(|j| j.phase() == Some(phase)).count();
        completed + failed + pending + running
    }

    /// Purges `completed` jobs older than `max_age`, bounding memory.
    pub fn cleanup_old_jobs(&self, max_age: chrono::Duration) {
        let mut state = self.state.lock().unwrap();
        let cutoff = Utc::now() - max_age;
        state.completed.retain(|_, (job, _)| job.completed_at.map(|t| t > cutoff).unwrap_or(true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataQuality, Geography, GeographyLevel, JobKind};
    use std::time::Duration;

    fn job(priority: u8) -> Job {
        Job::new(JobKind::Bulk, Geography::all(GeographyLevel::State), vec!["B01003_001E".to_string()], "acs5".to_string(), 2023, priority, 52, 3)
    }

    #[test]
    fn higher_priority_admitted_first() {
        let queue = Queue::new();
        let low = job(10);
        let high = job(90);
        queue.add(low.clone()).unwrap();
        queue.add(high.clone()).unwrap();
        let batch = queue.next_batch(1, |_| true);
        assert_eq!(batch[0].id, high.id);
    }

    #[test]
    fn duplicate_job_id_rejected() {
        let queue = Queue::new();
        let j = job(10);
        queue.add(j.clone()).unwrap();
        assert!(queue.add(j).is_err());
    }

    #[test]
    fn retryable_failure_re_admits_to_pending() {
        let queue = Queue::new();
        let config = Config::default();
        let j = job(50);
        let id = j.id;
        queue.add(j).unwrap();
        let batch = queue.next_batch(1, |_| true);
        assert_eq!(batch.len(), 1);
        let retried = queue
            .fail(id, LoadingError::new(crate::models::ErrorKind::ApiError, "boom", true), &config)
            .unwrap();
        assert!(retried);
        assert_eq!(queue.queue_depth(), 1);
    }

    #[test]
    fn exhausted_retries_is_terminal() {
        let queue = Queue::new();
        let config = Config::default();
        let mut j = job(50);
        j.max_retries = 0;
        let id = j.id;
        queue.add(j).unwrap();
        queue.next_batch(1, |_| true);
        let retried = queue
            .fail(id, LoadingError::new(crate::models::ErrorKind::ApiError, "boom", true), &config)
            .unwrap();
        assert!(!retried);
        assert_eq!(queue.queue_depth(), 0);
    }

    #[test]
    fn requeue_does_not_consume_retry_budget() {
        let queue = Queue::new();
        let mut j = job(50);
        j.max_retries = 0;
        let id = j.id;
        queue.add(j).unwrap();
        queue.next_batch(1, |_| true);
        queue.requeue(id, chrono::Duration::seconds(0)).unwrap();
        assert_eq!(queue.queue_depth(), 1);
        let batch = queue.next_batch(1, |_| true);
        assert_eq!(batch[0].retry_count, 0);
        assert_eq!(batch[0].error_count, 0);
    }

    #[test]
    fn completed_job_is_removed_from_running() {
        let queue = Queue::new();
        let j = job(50);
        let id = j.id;
        queue.add(j).unwrap();
        queue.next_batch(1, |_| true);
        queue
            .complete(
                id,
                LoadResult {
                    job_id: id,
                    records_loaded: 52,
                    records_skipped: 0,
                    records_errored: 0,
                    duration: Duration::from_secs(1),
                    api_calls: 1,
                    quality: DataQuality { completeness: 1.0, accuracy: 1.0, consistency: 1.0 },
                },
            )
            .unwrap();
        assert_eq!(queue.running_count(), 0);
    }
}
