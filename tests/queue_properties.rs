use std::time::Duration;

use census_ingest::config::Config;
use census_ingest::models::{ErrorKind, Geography, GeographyLevel, Job, JobKind, LoadingError};
use census_ingest::queue::Queue;
use proptest::prelude::*;

fn make_job(priority: u8) -> Job {
    Job::new(
        JobKind::Bulk,
        Geography::all(GeographyLevel::State),
        vec!["B01003_001E".to_string()],
        "acs5".to_string(),
        2023,
        priority,
        52,
        3,
    )
}

proptest! {
    /// For every pair of pending jobs with priority(a) > priority(b),
    /// a is admitted no later than b.
    #[test]
    fn priority_respects_weights(priorities in prop::collection::vec(0u8..=100, 1..30)) {
        let queue = Queue::new();
        let mut jobs = Vec::new();
        for p in &priorities {
            let job = make_job(*p);
            jobs.push(job.clone());
            queue.add(job).unwrap();
        }

        let admitted = queue.next_batch(jobs.len(), |_| true);
        let admitted_priorities: Vec<u8> = admitted.iter().map(|j| j.priority).collect();
        let mut sorted = admitted_priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        prop_assert_eq!(admitted_priorities, sorted);
    }

    /// For every job, the number of times it enters `running` is at
    /// most `max_retries + 1`.
    #[test]
    fn retry_bound_is_respected(max_retries in 0u32..5) {
        let queue = Queue::new();
        let config = Config::default();
        let mut job = make_job(50);
        job.max_retries = max_retries;
        let id = job.id;
        queue.add(job).unwrap();

        let mut entries_into_running = 0u32;
        loop {
            let batch = queue.next_batch(1, |_| true);
            if batch.is_empty() {
                break;
            }
            entries_into_running += 1;
            let retried = queue
                .fail(id, LoadingError::new(ErrorKind::ApiError, "flake", true), &config)
                .unwrap();
            if !retried {
                break;
            }
        }
        prop_assert!(entries_into_running <= max_retries + 1);
    }
}

#[test]
fn at_most_one_copy_of_a_job_id_exists() {
    let queue = Queue::new();
    let job = make_job(50);
    queue.add(job.clone()).unwrap();
    assert!(queue.add(job).is_err());
}

#[test]
fn cleanup_purges_old_completed_jobs() {
    let queue = Queue::new();
    let job = make_job(50);
    let id = job.id;
    queue.add(job).unwrap();
    queue.next_batch(1, |_| true);
    queue
        .complete(
            id,
            census_ingest::models::LoadResult {
                job_id: id,
                records_loaded: 1,
                records_skipped: 0,
                records_errored: 0,
                duration: Duration::from_secs(1),
                api_calls: 1,
                quality: census_ingest::models::DataQuality { completeness: 1.0, accuracy: 1.0, consistency: 1.0 },
            },
        )
        .unwrap();
    queue.cleanup_old_jobs(chrono::Duration::seconds(0));
    assert_eq!(queue.completed_count_for("unrelated"), 0);
}
