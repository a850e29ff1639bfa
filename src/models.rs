//! Core data model shared by every ingestion control-plane component.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Granularity of a statistical area, ordered coarse to fine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GeographyLevel {
    Nation,
    State,
    Metro,
    County,
    Place,
    Tract,
    BlockGroup,
    Zcta,
}

impl GeographyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeographyLevel::Nation => "nation",
            GeographyLevel::State => "state",
            GeographyLevel::Metro => "metro",
            GeographyLevel::County => "county",
            GeographyLevel::Place => "place",
            GeographyLevel::Tract => "tract",
            GeographyLevel::BlockGroup => "block_group",
            GeographyLevel::Zcta => "zcta",
        }
    }
}

impl std::fmt::Display for GeographyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A target geography: a level, an optional explicit code set, and an
/// optional parent used to scope `county`/`block_group` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geography {
    pub level: GeographyLevel,
    pub codes: Vec<String>,
    pub parent: Option<String>,
}

impl Geography {
    pub fn all(level: GeographyLevel) -> Self {
        Self { level, codes: Vec::new(), parent: None }
    }

    pub fn is_wildcard(&self) -> bool {
        self.codes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Bulk,
    Incremental,
    Backfill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

/// The unit of ingestion work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub geography: Geography,
    pub variables: Vec<String>,
    pub dataset: String,
    pub year: i32,
    pub priority: u8,
    pub status: JobStatus,
    pub estimated_records: u64,
    pub processed_records: u64,
    pub error_count: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        geography: Geography,
        variables: Vec<String>,
        dataset: String,
        year: i32,
        priority: u8,
        estimated_records: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            geography,
            variables,
            dataset,
            year,
            priority,
            status: JobStatus::Pending,
            estimated_records,
            processed_records: 0,
            error_count: 0,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn phase(&self) -> Option<&str> {
        self.metadata.get("phase").map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQuality {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
}

/// Outcome of a completed or terminally failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResult {
    pub job_id: Uuid,
    pub records_loaded: u64,
    pub records_skipped: u64,
    pub records_errored: u64,
    pub duration: Duration,
    pub api_calls: u32,
    pub quality: DataQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ApiError,
    ValidationError,
    StoreError,
    Timeout,
    RateLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadingError {
    pub error_kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
}

impl LoadingError {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self { error_kind, message: message.into(), timestamp: Utc::now(), retryable }
    }
}

/// Static definition of an ordered loading phase.
#[derive(Debug, Clone)]
pub struct PhaseDefinition {
    pub name: &'static str,
    pub priority: u8,
    pub description: &'static str,
    pub dependencies: &'static [&'static str],
    pub geographies: &'static [GeographyLevel],
    pub variables: &'static [&'static str],
    pub estimated_jobs: u32,
    pub estimated_api_calls: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Budget {
    pub daily_limit: u32,
    pub reserve_for_interactive: u32,
    pub used: u32,
    pub reset_at: DateTime<Utc>,
    pub burst_window: Duration,
}

impl Budget {
    pub fn available(&self) -> u32 {
        self.daily_limit.saturating_sub(self.reserve_for_interactive)
    }

    pub fn remaining(&self) -> u32 {
        self.available().saturating_sub(self.used)
    }

    pub fn usage_ratio(&self) -> f64 {
        if self.available() == 0 {
            return 1.0;
        }
        self.used as f64 / self.available() as f64
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub jobs_per_minute: f64,
    pub records_per_second: f64,
    pub avg_job_duration: Duration,
    pub error_rate: f64,
    pub calls_used: u32,
    pub memory_usage_ratio: f64,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Performance,
    ErrorRate,
    Resource,
    ApiLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub category: IssueCategory,
    pub severity: Severity,
    pub message: String,
    pub remediation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub score: u8,
    pub issues: Vec<Issue>,
}

/// A tagged attribute value, generalizing the statistical service's
/// dynamically-typed record payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int64(i64),
    Float64(f64),
    Text(String),
    Null,
}

impl Value {
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Value::Int64(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return Value::Float64(f);
        }
        Value::Text(raw.to_string())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(i) => Some(*i as f64),
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }
}

/// Internal record shape produced by the worker pool's transform stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CensusRecord {
    pub dataset: String,
    pub year: i32,
    pub geography_level: GeographyLevel,
    pub geography_code: String,
    pub geography_name: Option<String>,
    pub state_code: Option<String>,
    pub county_code: Option<String>,
    pub tract_code: Option<String>,
    pub block_group_code: Option<String>,
    pub zip_code: Option<String>,
    pub variable_name: String,
    pub variable_value: Value,
    pub margin_of_error: Option<f64>,
}

/// Generic response envelope returned by the consumer-facing control
/// interface.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { success: true, data: Some(data), error: None, timestamp: Utc::now() }
    }

    pub fn error(message: String) -> Self {
        Self { success: false, data: None, error: Some(message), timestamp: Utc::now() }
    }
}

/// Events published outward from the Queue/Worker Pool/Monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    JobStarted { job_id: Uuid },
    JobCompleted { job_id: Uuid, result: Box<LoadResult> },
    JobFailed { job_id: Uuid, error: LoadingError },
    ProgressUpdate { phase: String, percentage: f64 },
    RateLimitWarning { calls_used: u32, daily_limit: u32 },
    ValidationFailed { job_id: Uuid, message: String },
    StoreError { job_id: Uuid, message: String },
    SystemHealth { health: SystemHealth },
    EstimateDrift { job_id: Uuid, estimated: u64, realized: u64 },
}
