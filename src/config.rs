//! Loading configuration, environmental adaptation, and tracing setup.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::models::GeographyLevel;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config_invalid: {0}")]
    Invalid(String),
}

/// Tunables for the ingestion control plane. Construct via [`Config::from_env`]
/// or [`Config::default`], then always call [`Config::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub max_concurrent_jobs: usize,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub daily_limit: u32,
    pub burst_limit: u32,
    pub reserve_for_interactive: u32,
    #[serde(skip)]
    pub batch_size_per_level: HashMap<GeographyLevel, u32>,
    #[serde(skip)]
    pub priority_weight_per_level: HashMap<GeographyLevel, u8>,
    pub strict_validation: bool,
    pub quality_thresholds: QualityThresholds,
    pub store_max_connections: u32,
    pub batch_insert_size: u32,
    pub monitor_cadence: Duration,
    pub alert_error_rate_threshold: f64,
    pub request_timeout: Duration,
    pub shutdown_grace_window: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self { completeness: 0.95, accuracy: 0.95, consistency: 0.90 }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut batch_size_per_level = HashMap::new();
        batch_size_per_level.insert(GeographyLevel::State, 50);
        batch_size_per_level.insert(GeographyLevel::County, 50);
        batch_size_per_level.insert(GeographyLevel::Zcta, 50);
        batch_size_per_level.insert(GeographyLevel::BlockGroup, 50);
        batch_size_per_level.insert(GeographyLevel::Tract, 50);

        let mut priority_weight_per_level = HashMap::new();
        priority_weight_per_level.insert(GeographyLevel::Nation, 100);
        priority_weight_per_level.insert(GeographyLevel::State, 90);
        priority_weight_per_level.insert(GeographyLevel::Metro, 70);
        priority_weight_per_level.insert(GeographyLevel::County, 60);
        priority_weight_per_level.insert(GeographyLevel::Place, 40);
        priority_weight_per_level.insert(GeographyLevel::Zcta, 35);
        priority_weight_per_level.insert(GeographyLevel::Tract, 20);
        priority_weight_per_level.insert(GeographyLevel::BlockGroup, 10);

        Self {
            max_concurrent_jobs: 5,
            max_retries: 3,
            base_retry_delay: Duration::from_millis(500),
            daily_limit: 500,
            burst_limit: 50,
            reserve_for_interactive: 50,
            batch_size_per_level,
            priority_weight_per_level,
            strict_validation: false,
            quality_thresholds: QualityThresholds::default(),
            store_max_connections: 10,
            batch_insert_size: 1000,
            monitor_cadence: Duration::from_secs(60),
            alert_error_rate_threshold: 0.1,
            request_timeout: Duration::from_secs(30),
            shutdown_grace_window: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(v) = env::var("MAX_CONCURRENT_JOBS") {
            if let Ok(n) = v.parse() {
                config.max_concurrent_jobs = n;
            }
        }
        if let Ok(v) = env::var("MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                config.max_retries = n;
            }
        }
        if let Ok(v) = env::var("DAILY_LIMIT") {
            if let Ok(n) = v.parse() {
                config.daily_limit = n;
            }
        }
        if let Ok(v) = env::var("RESERVE_FOR_INTERACTIVE") {
            if let Ok(n) = v.parse() {
                config.reserve_for_interactive = n;
            }
        }
        if let Ok(v) = env::var("BATCH_INSERT_SIZE") {
            if let Ok(n) = v.parse() {
                config.batch_insert_size = n;
            }
        }
        if env::var("STRICT_VALIDATION").ok().as_deref() == Some("true") {
            config.strict_validation = true;
        }
        if env::var("CENSUS_API_KEY").is_ok() {
            config = config.for_credentialed();
        }
        if env::var("APP_ENV").ok().as_deref() == Some("production") {
            config = config.for_production();
        }
        if env::var("MEMORY_CONSTRAINED").ok().as_deref() == Some("true") {
            config = config.for_memory_constrained();
        }

        config
    }

    /// Fails fast with `config_invalid` on any violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if self.reserve_for_interactive >= self.daily_limit {
            violations.push("reserve_for_interactive must be < daily_limit".to_string());
        }
        for (level, size) in &self.batch_size_per_level {
            if *size > 50 {
                violations.push(format!("batch size for {level} exceeds 50-variable cap"));
            }
        }
        let qt = &self.quality_thresholds;
        for (name, value) in [
            ("completeness", qt.completeness),
            ("accuracy", qt.accuracy),
            ("consistency", qt.consistency),
        ] {
            if !(0.0..=1.0).contains(&value) {
                violations.push(format!("quality threshold {name} must be in [0,1]"));
            }
        }
        for (level, weight) in &self.priority_weight_per_level {
            if *weight as u32 > 100 {
                violations.push(format!("priority weight for {level} must be in [0,100]"));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(violations.join("; ")))
        }
    }

    pub fn for_credentialed(mut self) -> Self {
        self.daily_limit = self.daily_limit.saturating_mul(20);
        self.burst_limit = self.burst_limit.saturating_mul(4);
        self.max_concurrent_jobs *= 2;
        self
    }

    pub fn for_production(mut self) -> Self {
        self.strict_validation = true;
        self.reserve_for_interactive = (self.reserve_for_interactive as f64 * 1.5) as u32;
        self.monitor_cadence = Duration::from_secs(30);
        self
    }

    pub fn for_memory_constrained(mut self) -> Self {
        for size in self.batch_size_per_level.values_mut() {
            *size = (*size / 2).max(1);
        }
        self
    }

    /// Linearly throttles concurrency as usage approaches the budget:
    /// full below 70%, half between 70–90%, single-track above 90%.
    pub fn optimal_concurrency(&self, calls_used: u32) -> usize {
        let available = self.daily_limit.saturating_sub(self.reserve_for_interactive).max(1);
        let ratio = calls_used as f64 / available as f64;
        if ratio < 0.70 {
            self.max_concurrent_jobs
        } else if ratio < 0.90 {
            (self.max_concurrent_jobs / 2).max(1)
        } else {
            1
        }
    }

    pub fn should_pause(&self, calls_used: u32, error_rate: f64) -> bool {
        let available = self.daily_limit.saturating_sub(self.reserve_for_interactive).max(1);
        let usage_ratio = calls_used as f64 / available as f64;
        usage_ratio > 0.95 || error_rate > self.alert_error_rate_threshold
    }

    /// Exponential backoff with additive jitter up to one second.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_retry_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
        let jitter = (attempt as u64 * 137) % 1000;
        Duration::from_millis(exp.saturating_add(jitter))
    }

    /// Applies a partial override on top of the current config and
    /// validates the merged result before returning it; the receiver is
    /// left untouched if validation fails. `max_concurrent_jobs` is
    /// accepted but only affects new admission decisions — the worker
    /// pool's dispatch semaphore is sized once at startup.
    pub fn apply_patch(&self, patch: &ConfigPatch) -> Result<Config, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = patch.max_concurrent_jobs {
            next.max_concurrent_jobs = v;
        }
        if let Some(v) = patch.max_retries {
            next.max_retries = v;
        }
        if let Some(v) = patch.base_retry_delay_secs {
            next.base_retry_delay = Duration::from_secs_f64(v);
        }
        if let Some(v) = patch.daily_limit {
            next.daily_limit = v;
        }
        if let Some(v) = patch.burst_limit {
            next.burst_limit = v;
        }
        if let Some(v) = patch.reserve_for_interactive {
            next.reserve_for_interactive = v;
        }
        if let Some(v) = patch.strict_validation {
            next.strict_validation = v;
        }
        if let Some(v) = patch.quality_thresholds {
            next.quality_thresholds = v;
        }
        if let Some(v) = patch.batch_insert_size {
            next.batch_insert_size = v;
        }
        if let Some(v) = patch.monitor_cadence_secs {
            next.monitor_cadence = Duration::from_secs_f64(v);
        }
        if let Some(v) = patch.alert_error_rate_threshold {
            next.alert_error_rate_threshold = v;
        }
        if let Some(v) = patch.request_timeout_secs {
            next.request_timeout = Duration::from_secs_f64(v);
        }
        if let Some(v) = patch.shutdown_grace_window_secs {
            next.shutdown_grace_window = Duration::from_secs_f64(v);
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial override for [`Config::apply_patch`]. Durations are expressed
/// in fractional seconds to keep the wire representation JSON-friendly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub max_concurrent_jobs: Option<usize>,
    pub max_retries: Option<u32>,
    pub base_retry_delay_secs: Option<f64>,
    pub daily_limit: Option<u32>,
    pub burst_limit: Option<u32>,
    pub reserve_for_interactive: Option<u32>,
    pub strict_validation: Option<bool>,
    pub quality_thresholds: Option<QualityThresholds>,
    pub batch_insert_size: Option<u32>,
    pub monitor_cadence_secs: Option<f64>,
    pub alert_error_rate_threshold: Option<f64>,
    pub request_timeout_secs: Option<f64>,
    pub shutdown_grace_window_secs: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: String,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { format: LogFormat::Json, filter: "info".to_string(), include_target: true }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let format = match env::var("LOG_FORMAT").ok().as_deref() {
            Some("pretty") => LogFormat::Pretty,
            Some("compact") => LogFormat::Compact,
            _ => LogFormat::Json,
        };
        let filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let include_target = env::var("LOG_INCLUDE_TARGET").ok().as_deref() != Some("false");
        Self { format, filter, include_target }
    }

    pub fn init(&self) {
        let env_filter = EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new("info"));

        match self.format {
            LogFormat::Json => {
                let layer = fmt::layer().json().with_target(self.include_target);
                tracing_subscriber::registry().with(env_filter).with(layer).init();
            }
            LogFormat::Pretty => {
                let layer = fmt::layer().pretty().with_target(self.include_target);
                tracing_subscriber::registry().with(env_filter).with(layer).init();
            }
            LogFormat::Compact => {
                let layer = fmt::layer().compact().with_target(self.include_target);
                tracing_subscriber::registry().with(env_filter).with(layer).init();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn reserve_equal_to_daily_limit_is_rejected() {
        let mut config = Config::default();
        config.reserve_for_interactive = config.daily_limit;
        assert!(config.validate().is_err());
    }

    #[test]
    fn batch_size_of_51_is_rejected() {
        let mut config = Config::default();
        config.batch_size_per_level.insert(GeographyLevel::State, 51);
        assert!(config.validate().is_err());
    }

    #[test]
    fn batch_size_of_50_is_accepted() {
        let mut config = Config::default();
        config.batch_size_per_level.insert(GeographyLevel::State, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn optimal_concurrency_throttles_with_usage() {
        let config = Config::default();
        let available = config.daily_limit - config.reserve_for_interactive;
        assert_eq!(config.optimal_concurrency(0), config.max_concurrent_jobs);
        assert_eq!(
            config.optimal_concurrency((available as f64 * 0.8) as u32),
            (config.max_concurrent_jobs / 2).max(1)
        );
        assert_eq!(config.optimal_concurrency((available as f64 * 0.95) as u32), 1);
    }

    #[test]
    fn apply_patch_overrides_only_named_fields() {
        let config = Config::default();
        let patch = ConfigPatch { daily_limit: Some(1000), ..Default::default() };
        let patched = config.apply_patch(&patch).unwrap();
        assert_eq!(patched.daily_limit, 1000);
        assert_eq!(patched.max_retries, config.max_retries);
    }

    #[test]
    fn apply_patch_rejects_invariant_violation() {
        let config = Config::default();
        let patch = ConfigPatch { reserve_for_interactive: Some(config.daily_limit), ..Default::default() };
        assert!(config.apply_patch(&patch).is_err());
        // original config is untouched
        assert!(config.validate().is_ok());
    }

    #[test]
    fn should_pause_above_95_percent_usage() {
        let config = Config::default();
        let available = config.daily_limit - config.reserve_for_interactive;
        assert!(config.should_pause((available as f64 * 0.96) as u32, 0.0));
        assert!(!config.should_pause((available as f64 * 0.5) as u32, 0.0));
    }
}
