//! Rate-Limit Accountant: the single source of truth for the daily
//! external-call budget. A Redis-backed shared counter with an
//! in-memory fallback, generalized to a single global daily budget.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::models::Budget;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("redis connection error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("accountant state poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub used: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

struct InMemoryState {
    used: u32,
    reset_at: DateTime<Utc>,
}

/// Tracks calls used and reserved against the daily budget; answers
/// "may I proceed", "slow down", or "pause" for both the worker pool and
/// the orchestrator.
pub struct Accountant {
    daily_limit: AtomicU32,
    reserve_for_interactive: AtomicU32,
    burst_window: Duration,
    redis: Option<redis::aio::ConnectionManager>,
    memory: Mutex<InMemoryState>,
}

fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    (now + ChronoDuration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
}

impl Accountant {
    pub fn new_in_memory(daily_limit: u32, reserve_for_interactive: u32, burst_window: Duration) -> Self {
        Self {
            daily_limit: AtomicU32::new(daily_limit),
            reserve_for_interactive: AtomicU32::new(reserve_for_interactive),
            burst_window,
            redis: None,
            memory: Mutex::new(InMemoryState { used: 0, reset_at: next_reset(Utc::now()) }),
        }
    }

    pub async fn new(
        redis_url: &str,
        daily_limit: u32,
        reserve_for_interactive: u32,
        burst_window: Duration,
    ) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            daily_limit: AtomicU32::new(daily_limit),
            reserve_for_interactive: AtomicU32::new(reserve_for_interactive),
            burst_window,
            redis: Some(manager),
            memory: Mutex::new(InMemoryState { used: 0, reset_at: next_reset(Utc::now()) }),
        })
    }

    /// Applies a validated config update's daily budget to the running
    /// accountant without restarting it.
    pub fn update_limits(&self, daily_limit: u32, reserve_for_interactive: u32) {
        self.daily_limit.store(daily_limit, Ordering::SeqCst);
        self.reserve_for_interactive.store(reserve_for_interactive, Ordering::SeqCst);
    }

    fn available(&self) -> u32 {
        self.daily_limit.load(Ordering::SeqCst).saturating_sub(self.reserve_for_interactive.load(Ordering::SeqCst))
    }

    /// Returns `true` (admitted) or `false` (denied) synchronously from the
    /// caller's perspective. Denied acquisitions never consume budget.
    pub async fn try_acquire(&self, n: u32) -> Result<bool, RateLimitError> {
        if let Some(manager) = &self.redis {
            self.try_acquire_redis(manager.clone(), n).await
        } else {
            Ok(self.try_acquire_memory(n))
        }
    }

    async fn try_acquire_redis(
        &self,
        mut manager: redis::aio::ConnectionManager,
        n: u32,
    ) -> Result<bool, RateLimitError> {
        let key = "census_ingest:calls_used";
        self.roll_window_if_needed_redis(&mut manager).await?;

        let used: u32 = manager.get(key).await.unwrap_or(0);
        if used.saturating_add(n) > self.available() {
            return Ok(false);
        }
        let _: () = manager.incr(key, n).await?;
        let _: () = manager.expire(key, 86_400).await?;
        Ok(true)
    }

    async fn roll_window_if_needed_redis(&self, manager: &mut redis::aio::ConnectionManager) -> Result<(), RateLimitError> {
        let reset_key = "census_ingest:reset_at";
        let stored: Option<i64> = manager.get(reset_key).await.unwrap_or(None);
        let now = Utc::now().timestamp();
        if stored.map(|r| now >= r).unwrap_or(true) {
            let reset_at = next_reset(Utc::now()).timestamp();
            let _: () = manager.set(reset_key, reset_at).await?;
            let _: () = manager.set("census_ingest:calls_used", 0).await?;
        }
        Ok(())
    }

    fn try_acquire_memory(&self, n: u32) -> bool {
        let mut state = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        if Utc::now() >= state.reset_at {
            state.used = 0;
            state.reset_at = next_reset(Utc::now());
        }
        if state.used.saturating_add(n) > self.available() {
            return false;
        }
        state.used += n;
        true
    }

    /// Post-call bookkeeping for when admitted count and realized count
    /// differ (e.g. a partial failure released fewer calls than reserved).
    pub async fn record(&self, n: u32) -> Result<(), RateLimitError> {
        if let Some(manager) = &self.redis {
            let mut manager = manager.clone();
            let _: () = manager.incr("census_ingest:calls_used", n).await?;
        } else {
            let mut state = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            state.used = state.used.saturating_add(n);
        }
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<RateLimitInfo, RateLimitError> {
        let (used, reset_at) = if let Some(manager) = &self.redis {
            let mut manager = manager.clone();
            let used: u32 = manager.get("census_ingest:calls_used").await.unwrap_or(0);
            let reset_at: i64 = manager
                .get("census_ingest:reset_at")
                .await
                .unwrap_or_else(|_: redis::RedisError| next_reset(Utc::now()).timestamp());
            (used, DateTime::from_timestamp(reset_at, 0).unwrap_or_else(Utc::now))
        } else {
            let state = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            (state.used, state.reset_at)
        };
        Ok(RateLimitInfo { used, remaining: self.available().saturating_sub(used), reset_at })
    }

    pub fn to_budget(&self, used: u32, reset_at: DateTime<Utc>) -> Budget {
        Budget {
            daily_limit: self.daily_limit.load(Ordering::SeqCst),
            reserve_for_interactive: self.reserve_for_interactive.load(Ordering::SeqCst),
            used,
            reset_at,
            burst_window: self.burst_window,
        }
    }

    pub fn is_using_redis(&self) -> bool {
        self.redis.is_some()
    }
}
