//! Monitor: counters, rolling health-snapshot history, health scoring,
//! and alert emission. Mutation is serialized through `&self` methods
//! backed by atomics and a mutexed ring buffer; readers take snapshots.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{register_counter_vec_with_registry, register_gauge_with_registry, CounterVec, Gauge, Registry};
use tokio::sync::broadcast;

use crate::models::{Event, HealthSnapshot, HealthStatus, Issue, IssueCategory, Severity, SystemHealth};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static JOBS_STARTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec_with_registry!("census_ingest_jobs_started_total", "Jobs started", &["phase"], REGISTRY).unwrap()
});
static JOBS_COMPLETED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec_with_registry!("census_ingest_jobs_completed_total", "Jobs completed", &["phase"], REGISTRY)
        .unwrap()
});
static JOBS_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec_with_registry!("census_ingest_jobs_failed_total", "Jobs failed", &["phase", "error_kind"], REGISTRY)
        .unwrap()
});
static API_CALLS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge_with_registry!("census_ingest_api_calls_used", "External API calls used today", REGISTRY).unwrap()
});

const RING_CAPACITY: usize = 1_440;

#[derive(Default)]
struct Counters {
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    records_loaded: AtomicU64,
    api_calls_used: AtomicU32,
    total_job_duration_ms: AtomicU64,
    recent_slow_jobs: AtomicU32,
}

pub struct Monitor {
    counters: Counters,
    history: Mutex<VecDeque<HealthSnapshot>>,
    events: broadcast::Sender<Event>,
}

impl Monitor {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(1024);
        Self { counters: Counters::default(), history: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)), events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // A lagged receiver drops events rather than blocking the
        // producer; delivery is at-least-once to subscribers keeping up.
        let _ = self.events.send(event);
    }

    pub fn record_job_started(&self, phase: &str) {
        self.counters.jobs_started.fetch_add(1, Ordering::Relaxed);
        JOBS_STARTED.with_label_values(&[phase]).inc();
    }

    pub fn record_job_completed(&self, phase: &str, records_loaded: u64, duration: Duration) {
        self.counters.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.counters.records_loaded.fetch_add(records_loaded, Ordering::Relaxed);
        self.counters.total_job_duration_ms.fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        if duration > Duration::from_secs(30) {
            self.counters.recent_slow_jobs.fetch_add(1, Ordering::Relaxed);
        }
        JOBS_COMPLETED.with_label_values(&[phase]).inc();
    }

    pub fn record_job_failed(&self, phase: &str, error_kind: &str) {
        self.counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
        JOBS_FAILED.with_label_values(&[phase, error_kind]).inc();
    }

    pub fn record_api_call(&self, calls_used: u32) {
        self.counters.api_calls_used.store(calls_used, Ordering::Relaxed);
        API_CALLS.set(calls_used as f64);
    }

    fn error_rate(&self) -> f64 {
        let completed = self.counters.jobs_completed.load(Ordering::Relaxed);
        let failed = self.counters.jobs_failed.load(Ordering::Relaxed);
        let total = completed + failed;
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }

    fn avg_job_duration(&self) -> Duration {
        let completed = self.counters.jobs_completed.load(Ordering::Relaxed).max(1);
        let total_ms = self.counters.total_job_duration_ms.load(Ordering::Relaxed);
        Duration::from_millis(total_ms / completed)
    }

    /// Computes a [`HealthSnapshot`] and appends it to the bounded ring
    /// buffer (default capacity 1,440 ≈ 24h at one-minute cadence).
    pub fn tick(&self, queue_depth: usize, memory_usage_ratio: f64, daily_limit: u32, window: Duration) -> HealthSnapshot {
        let completed = self.counters.jobs_completed.load(Ordering::Relaxed);
        let window_minutes = (window.as_secs_f64() / 60.0).max(1.0 / 60.0);
        let jobs_per_minute = completed as f64 / window_minutes;
        let records_per_second = self.counters.records_loaded.load(Ordering::Relaxed) as f64 / window.as_secs_f64().max(1.0);

        let snapshot = HealthSnapshot {
            timestamp: chrono::Utc::now(),
            jobs_per_minute,
            records_per_second,
            avg_job_duration: self.avg_job_duration(),
            error_rate: self.error_rate(),
            calls_used: self.counters.api_calls_used.load(Ordering::Relaxed),
            memory_usage_ratio,
            queue_depth,
        };

        let mut history = self.history.lock().unwrap();
        if history.len() == RING_CAPACITY {
            history.pop_front();
        }
        history.push_back(snapshot);

        let _ = daily_limit;
        snapshot
    }

    pub fn history_window(&self, hours: u32) -> Vec<HealthSnapshot> {
        let history = self.history.lock().unwrap();
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(hours as i64);
        history.iter().filter(|s| s.timestamp > cutoff).copied().collect()
    }

    /// Starts at 100, subtracts weighted penalties; maps to a status.
    pub fn system_health(&self, daily_limit: u32, reserve: u32) -> SystemHealth {
        let mut score: i32 = 100;
        let mut issues = Vec::new();

        let error_rate = self.error_rate();
        if error_rate > 0.05 {
            let penalty = if error_rate > 0.20 { 20 } else { 10 };
            score -= penalty;
            issues.push(Issue {
                category: IssueCategory::ErrorRate,
                severity: if error_rate > 0.20 { Severity::High } else { Severity::Medium },
                message: format!("Observed error rate {:.1}%", error_rate * 100.0),
                remediation: "Consider pausing non-critical jobs or implement API key".to_string(),
            });
        }

        let available = daily_limit.saturating_sub(reserve).max(1);
        let usage_ratio = self.counters.api_calls_used.load(Ordering::Relaxed) as f64 / available as f64;
        if usage_ratio > 0.80 {
            let penalty = if usage_ratio > 0.95 { 25 } else { 15 };
            score -= penalty;
            issues.push(Issue {
                category: IssueCategory::ApiLimit,
                severity: if usage_ratio > 0.95 { Severity::Critical } else { Severity::High },
                message: format!("API budget {:.1}% utilized", usage_ratio * 100.0),
                remediation: "Consider pausing non-critical jobs or implement API key".to_string(),
            });
        }

        let memory_ratio = self.history.lock().unwrap().back().map(|s| s.memory_usage_ratio).unwrap_or(0.0);
        if memory_ratio > 0.80 {
            let penalty = if memory_ratio > 0.95 { 15 } else { 10 };
            score -= penalty;
            issues.push(Issue {
                category: IssueCategory::Resource,
                severity: if memory_ratio > 0.95 { Severity::High } else { Severity::Medium },
                message: format!("Memory usage at {:.1}%", memory_ratio * 100.0),
                remediation: "Reduce batch sizes or implement data streaming".to_string(),
            });
        }

        if self.counters.recent_slow_jobs.load(Ordering::Relaxed) > 3 {
            score -= 10;
            issues.push(Issue {
                category: IssueCategory::Performance,
                severity: Severity::Medium,
                message: "Multiple jobs exceeded the slow-job threshold".to_string(),
                remediation: "Reduce batch sizes or implement data streaming".to_string(),
            });
        }

        let score = score.clamp(0, 100) as u8;
        let status = if score >= 85 {
            HealthStatus::Healthy
        } else if score >= 70 {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        };

        SystemHealth { status, score, issues }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Trend of a metric over the last N snapshots vs. the earlier window,
/// using a ±5% change threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Improving,
    Stable,
    Worsening,
}

pub fn classify_trend(earlier_mean: f64, recent_mean: f64, higher_is_better: bool) -> Trend {
    if earlier_mean == 0.0 {
        return Trend::Stable;
    }
    let change = (recent_mean - earlier_mean) / earlier_mean;
    let improved = if higher_is_better { change > 0.05 } else { change < -0.05 };
    let worsened = if higher_is_better { change < -0.05 } else { change > 0.05 };
    if improved {
        Trend::Improving
    } else if worsened {
        Trend::Worsening
    } else {
        Trend::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_under_steady_state() {
        let monitor = Monitor::new();
        for _ in 0..10 {
            monitor.record_job_completed("foundation", 100, Duration::from_millis(10));
        }
        let health = monitor.system_health(500, 50);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.score >= 85);
    }

    #[test]
    fn critical_under_budget_saturation() {
        let monitor = Monitor::new();
        monitor.record_api_call(480);
        let health = monitor.system_health(500, 50);
        assert!(health.score < 85);
    }

    #[test]
    fn trend_classifies_improving_throughput() {
        assert_eq!(classify_trend(100.0, 120.0, true), Trend::Improving);
        assert_eq!(classify_trend(100.0, 80.0, true), Trend::Worsening);
        assert_eq!(classify_trend(100.0, 102.0, true), Trend::Stable);
    }
}
