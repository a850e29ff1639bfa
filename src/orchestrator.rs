//! Orchestrator: the top-level driver. Sequences phases, expands them
//! into jobs, admits work under budget, and forwards events upward.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::catalog::{self, job_priority, PHASES, STATE_FIPS};
use crate::config::{Config, ConfigError, ConfigPatch};
use crate::models::{Event, Geography, GeographyLevel, Job, JobKind, SystemHealth};
use crate::monitor::Monitor;
use crate::queue::Queue;
use crate::rate_limit::Accountant;
use crate::worker::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Loading = 1,
    Paused = 2,
    Stopping = 3,
    Stopped = 4,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Loading,
            2 => RunState::Paused,
            3 => RunState::Stopping,
            4 => RunState::Stopped,
            _ => RunState::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub percentage: f64,
    pub records_per_second: f64,
    pub calls_used: u32,
    pub calls_remaining: u32,
    pub status: String,
    pub recent_errors: Vec<String>,
}

pub struct Orchestrator {
    config: Arc<RwLock<Config>>,
    queue: Arc<Queue>,
    accountant: Arc<Accountant>,
    monitor: Arc<Monitor>,
    pool: Arc<WorkerPool>,
    state: AtomicU8,
    current_phase_index: std::sync::Mutex<usize>,
    active_phases: std::sync::Mutex<Vec<&'static str>>,
}

impl Orchestrator {
    pub fn new(config: Arc<RwLock<Config>>, queue: Arc<Queue>, accountant: Arc<Accountant>, monitor: Arc<Monitor>, pool: Arc<WorkerPool>) -> Self {
        Self {
            config,
            queue,
            accountant,
            monitor,
            pool,
            state: AtomicU8::new(RunState::Idle as u8),
            current_phase_index: std::sync::Mutex::new(0),
            active_phases: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Idempotent no-op if already running. Begins sequencing the named
    /// phases (or all phases, in priority order, if none are named).
    #[instrument(skip(self))]
    pub async fn start_loading(&self, phase_names: Option<Vec<String>>) {
        if self.state() == RunState::Loading {
            return;
        }

        let selected: Vec<&'static str> = match phase_names {
            Some(names) => PHASES.iter().map(|p| p.name).filter(|n| names.iter().any(|requested| requested == n)).collect(),
            None => PHASES.iter().map(|p| p.name).collect(),
        };
        *self.active_phases.lock().unwrap() = selected;
        *self.current_phase_index.lock().unwrap() = 0;

        self.state.store(RunState::Loading as u8, Ordering::SeqCst);
        self.pool.start();
        info!("loading started");
    }

    pub fn pause(&self) {
        self.state.store(RunState::Paused as u8, Ordering::SeqCst);
        self.pool.pause();
    }

    pub fn resume(&self) {
        if self.state() == RunState::Paused {
            self.state.store(RunState::Loading as u8, Ordering::SeqCst);
            self.pool.resume();
        }
    }

    pub async fn stop(&self) {
        self.state.store(RunState::Stopping as u8, Ordering::SeqCst);
        self.pool.stop().await;
        self.state.store(RunState::Stopped as u8, Ordering::SeqCst);
    }

    pub fn add_custom_job(&self, geography: Geography, variables: Vec<String>, priority: Option<u8>) -> Uuid {
        let priority = priority.unwrap_or_else(|| job_priority(geography.level, &variables, 50));
        let estimated = catalog::estimated_record_count(geography.level);
        let max_retries = self.config.read().unwrap().max_retries;
        let job = Job::new(JobKind::Incremental, geography, variables, "acs5".to_string(), Utc::now().year(), priority, estimated, max_retries);
        let id = job.id;
        let _ = self.queue.add(job);
        id
    }

    /// Returns the currently active configuration.
    pub fn current_config(&self) -> Config {
        self.config.read().unwrap().clone()
    }

    /// Validates `patch` against the current config and, only if it
    /// passes, commits it as the new live config — a "validated in-place
    /// update": the running system keeps its old config on any violation.
    pub fn update_config(&self, patch: ConfigPatch) -> Result<Config, ConfigError> {
        let next = self.config.read().unwrap().apply_patch(&patch)?;
        self.accountant.update_limits(next.daily_limit, next.reserve_for_interactive);
        *self.config.write().unwrap() = next.clone();
        Ok(next)
    }

    /// Evaluates phases in descending priority, expanding each into jobs
    /// once its dependencies are complete. Chunks variables into groups
    /// of ≤50 and geography codes when a level's batch size is exceeded.
    #[instrument(skip(self))]
    pub fn expand_ready_phases(&self) {
        let active = self.active_phases.lock().unwrap().clone();
        for phase in PHASES.iter().filter(|p| active.contains(&p.name)) {
            if !self.dependencies_complete(phase.dependencies) {
                continue;
            }
            if self.queue.has_pending_for(phase.name) || self.queue.total_count_for(phase.name) > 0 {
                continue;
            }
            self.expand_phase(phase);
        }
    }

    fn dependencies_complete(&self, dependencies: &[&str]) -> bool {
        dependencies.iter().all(|dep| self.queue.is_phase_complete(dep) && self.queue.total_count_for(dep) > 0)
    }

    fn expand_phase(&self, phase: &catalog::Phase) {
        let variable_chunks: Vec<Vec<String>> =
            phase.variables.chunks(50).map(|c| c.iter().map(|s| s.to_string()).collect()).collect();

        for geo_level in phase.geographies {
            let batch_size = self.config.read().unwrap().batch_size_per_level.get(geo_level).copied().unwrap_or(50) as usize;
            let code_chunks = self.code_chunks_for(*geo_level, batch_size);
            let total_chunks = variable_chunks.len() * code_chunks.len().max(1);
            let mut chunk_index = 0;

            for var_chunk in &variable_chunks {
                if code_chunks.is_empty() {
                    chunk_index += 1;
                    self.enqueue_chunk(phase, *geo_level, Vec::new(), var_chunk.clone(), chunk_index, total_chunks);
                } else {
                    for codes in &code_chunks {
                        chunk_index += 1;
                        self.enqueue_chunk(phase, *geo_level, codes.clone(), var_chunk.clone(), chunk_index, total_chunks);
                    }
                }
            }
        }
    }

    /// Per-level dispatch policy: state/zcta/nation/metro/place/tract are
    /// requested wildcard in a single job; county and block_group jobs
    /// each carry a batch of parent state FIPS codes, fanned out into one
    /// HTTP request per parent (county) or per `(state, county)` pair
    /// (block_group) at execution time.
    fn code_chunks_for(&self, level: GeographyLevel, batch_size: usize) -> Vec<Vec<String>> {
        match level {
            GeographyLevel::County | GeographyLevel::BlockGroup => {
                STATE_FIPS.chunks(batch_size.max(1)).map(|chunk| chunk.iter().map(|s| s.to_string()).collect()).collect()
            }
            _ => Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue_chunk(
        &self,
        phase: &catalog::Phase,
        level: GeographyLevel,
        codes: Vec<String>,
        variables: Vec<String>,
        chunk_index: usize,
        total_chunks: usize,
    ) {
        let geography = Geography { level, codes, parent: None };
        let priority = job_priority(level, &variables, phase.priority);
        let estimated = catalog::estimated_record_count(level);
        let max_retries = self.config.read().unwrap().max_retries;
        let mut job = Job::new(JobKind::Bulk, geography, variables, "acs5".to_string(), Utc::now().year(), priority, estimated, max_retries);
        job.metadata.insert("phase".to_string(), phase.name.to_string());
        job.metadata.insert("chunk_index".to_string(), chunk_index.to_string());
        job.metadata.insert("total_chunks".to_string(), total_chunks.to_string());
        let _ = self.queue.add(job);
    }

    /// One tick of the pump loop: checks admission, computes target
    /// concurrency, and hands a batch of jobs to the worker pool.
    #[instrument(skip(self))]
    pub async fn pump_once(&self) {
        if self.state() != RunState::Loading {
            return;
        }

        let snapshot = match self.accountant.snapshot().await {
            Ok(s) => s,
            Err(_) => return,
        };
        self.monitor.record_api_call(snapshot.used);

        let (should_pause, daily_limit, target_concurrency) = {
            let config = self.config.read().unwrap();
            let error_rate = 0.0; // sourced from monitor in a full tick; see tick().
            (config.should_pause(snapshot.used, error_rate), config.daily_limit, config.optimal_concurrency(snapshot.used))
        };
        if should_pause {
            self.pause();
            self.monitor.publish(Event::RateLimitWarning { calls_used: snapshot.used, daily_limit });
            return;
        }

        let available_workers = target_concurrency.min(self.pool.available_permits());
        if available_workers == 0 {
            return;
        }

        let active = self.active_phases.lock().unwrap().clone();
        let batch = self.queue.next_batch(available_workers, |phase| {
            phase.map(|p| active.contains(&p)).unwrap_or(true)
        });

        if !batch.is_empty() {
            self.pool.run_batch(batch).await;
        }

        self.monitor.publish(Event::ProgressUpdate {
            phase: self.current_phase_name(),
            percentage: self.progress().await.percentage,
        });
    }

    fn current_phase_name(&self) -> String {
        let active = self.active_phases.lock().unwrap();
        let idx = *self.current_phase_index.lock().unwrap();
        active.get(idx).map(|s| s.to_string()).unwrap_or_default()
    }

    /// Advances past completed phases in priority order.
    pub fn advance_if_phase_complete(&self) {
        let active = self.active_phases.lock().unwrap().clone();
        let mut idx = self.current_phase_index.lock().unwrap();
        while *idx < active.len() && self.queue.is_phase_complete(active[*idx]) && self.queue.total_count_for(active[*idx]) > 0 {
            *idx += 1;
        }
        if *idx >= active.len() && !active.is_empty() {
            self.state.store(RunState::Idle as u8, Ordering::SeqCst);
        }
    }

    pub async fn progress(&self) -> Progress {
        let active = self.active_phases.lock().unwrap().clone();
        let (total, completed) = active
            .iter()
            .map(|p| (self.queue.total_count_for(p), self.queue.completed_count_for(p)))
            .fold((0usize, 0usize), |acc, (t, c)| (acc.0 + t, acc.1 + c));
        let percentage = if total == 0 { 0.0 } else { (completed as f64 / total as f64) * 100.0 };
        let daily_limit = self.config.read().unwrap().daily_limit;
        let snapshot = self.accountant.snapshot().await.unwrap_or(crate::rate_limit::RateLimitInfo {
            used: 0,
            remaining: daily_limit,
            reset_at: Utc::now(),
        });

        Progress {
            total_jobs: total,
            completed_jobs: completed,
            percentage,
            records_per_second: 0.0,
            calls_used: snapshot.used,
            calls_remaining: snapshot.remaining,
            status: format!("{:?}", self.state()),
            recent_errors: Vec::new(),
        }
    }

    pub fn health(&self) -> SystemHealth {
        let config = self.config.read().unwrap();
        self.monitor.system_health(config.daily_limit, config.reserve_for_interactive)
    }

    /// Samples a health snapshot into the monitor's rolling ring. Callers
    /// supply the system memory-usage ratio (read via `sysinfo`) since the
    /// orchestrator itself has no OS-level visibility.
    pub fn tick_health(&self, memory_usage_ratio: f64, window: Duration) -> crate::models::HealthSnapshot {
        let daily_limit = self.config.read().unwrap().daily_limit;
        self.monitor.tick(self.queue.queue_depth(), memory_usage_ratio, daily_limit, window)
    }

    pub fn health_history(&self, window_hours: u32) -> Vec<crate::models::HealthSnapshot> {
        self.monitor.history_window(window_hours)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.monitor.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_round_trips_through_u8() {
        assert_eq!(RunState::from_u8(RunState::Loading as u8), RunState::Loading);
        assert_eq!(RunState::from_u8(99), RunState::Idle);
    }
}
