//! Per (agent, user) rate limiting over minute, hour and day windows

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::backend::QueueError;
use crate::clock::{Clock, SystemClock};
use crate::job::ParseLabelError;

/// Counting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitWindow {
    PerMinute,
    PerHour,
    PerDay,
}

impl LimitWindow {
    pub fn duration(&self) -> Duration {
        match self {
            Self::PerMinute => Duration::minutes(1),
            Self::PerHour => Duration::hours(1),
            Self::PerDay => Duration::days(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerMinute => "per_minute",
            Self::PerHour => "per_hour",
            Self::PerDay => "per_day",
        }
    }
}

impl fmt::Display for LimitWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitWindow {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_minute" => Ok(Self::PerMinute),
            "per_hour" => Ok(Self::PerHour),
            "per_day" => Ok(Self::PerDay),
            other => Err(ParseLabelError::new("limit window", other)),
        }
    }
}

/// Ceilings per window; `None` disables that window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
    pub per_day: Option<u32>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: Some(10),
            per_hour: Some(100),
            per_day: Some(1000),
        }
    }
}

impl RateLimits {
    pub fn unlimited() -> Self {
        Self {
            per_minute: None,
            per_hour: None,
            per_day: None,
        }
    }

    /// Configured windows, shortest first
    pub fn windows(&self) -> Vec<(LimitWindow, u32)> {
        [
            (LimitWindow::PerMinute, self.per_minute),
            (LimitWindow::PerHour, self.per_hour),
            (LimitWindow::PerDay, self.per_day),
        ]
        .into_iter()
        .filter_map(|(window, limit)| limit.map(|l| (window, l)))
        .collect()
    }
}

/// Counter state for one (agent, user, window)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub agent_id: String,
    pub user_id: String,
    pub window: LimitWindow,
    pub count: u32,
    pub limit: u32,
    pub window_reset_at: DateTime<Utc>,
    /// Rejections attributed to this window
    pub exceeded_count: u64,
}

/// Result of a reservation attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed,
    Exceeded {
        window: LimitWindow,
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// All-or-nothing reservation over the counters of one (agent, user).
///
/// Missing counters are created, expired ones are reset in place. Every
/// exceeded window has its `exceeded_count` bumped; counts are only
/// incremented when all windows pass. Backends call this inside their own
/// critical section and persist `counters` afterwards.
pub fn reserve(
    counters: &mut Vec<RateLimitCounter>,
    agent_id: &str,
    user_id: &str,
    limits: &RateLimits,
    now: DateTime<Utc>,
) -> RateDecision {
    let windows = limits.windows();

    for (window, limit) in &windows {
        match counters.iter_mut().find(|c| c.window == *window) {
            Some(counter) => {
                counter.limit = *limit;
                if now >= counter.window_reset_at {
                    counter.count = 0;
                    counter.window_reset_at = now + window.duration();
                }
            }
            None => counters.push(RateLimitCounter {
                agent_id: agent_id.to_string(),
                user_id: user_id.to_string(),
                window: *window,
                count: 0,
                limit: *limit,
                window_reset_at: now + window.duration(),
                exceeded_count: 0,
            }),
        }
    }

    let mut exceeded: Option<(LimitWindow, Duration)> = None;
    for counter in counters.iter_mut() {
        if !windows.iter().any(|(w, _)| *w == counter.window) {
            continue;
        }
        if counter.count >= counter.limit {
            counter.exceeded_count += 1;
            let wait = counter.window_reset_at - now;
            exceeded = match exceeded {
                Some((w, longest)) if longest >= wait => Some((w, longest)),
                _ => Some((counter.window, wait)),
            };
        }
    }

    if let Some((window, retry_after)) = exceeded {
        return RateDecision::Exceeded {
            window,
            retry_after,
        };
    }

    for counter in counters.iter_mut() {
        if windows.iter().any(|(w, _)| *w == counter.window) {
            counter.count += 1;
        }
    }
    RateDecision::Allowed
}

/// Storage for rate-limit counters
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Atomically evaluate and (if allowed) consume one request
    async fn check_and_reserve(
        &self,
        agent_id: &str,
        user_id: &str,
        limits: &RateLimits,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, QueueError>;

    async fn counters(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Vec<RateLimitCounter>, QueueError>;
}

#[derive(Debug, Default)]
pub struct MemoryRateLimitBackend {
    counters: Mutex<HashMap<(String, String), Vec<RateLimitCounter>>>,
}

impl MemoryRateLimitBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitBackend for MemoryRateLimitBackend {
    async fn check_and_reserve(
        &self,
        agent_id: &str,
        user_id: &str,
        limits: &RateLimits,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, QueueError> {
        let mut all = self.counters.lock().await;
        let counters = all
            .entry((agent_id.to_string(), user_id.to_string()))
            .or_default();
        Ok(reserve(counters, agent_id, user_id, limits, now))
    }

    async fn counters(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Vec<RateLimitCounter>, QueueError> {
        let all = self.counters.lock().await;
        Ok(all
            .get(&(agent_id.to_string(), user_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

/// Rate limiter front-end: default ceilings plus a counter backend
#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    defaults: RateLimits,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(
        backend: Arc<dyn RateLimitBackend>,
        defaults: RateLimits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            defaults,
            clock,
        }
    }

    /// Memory-backed limiter with the system defaults
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRateLimitBackend::new()),
            RateLimits::default(),
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn defaults(&self) -> &RateLimits {
        &self.defaults
    }

    /// Reserve one request under the default limits
    pub async fn check_and_reserve(&self, agent_id: &str, user_id: &str) -> Result<bool, QueueError> {
        let limits = self.defaults;
        Ok(self.reserve(agent_id, user_id, &limits).await?.is_allowed())
    }

    /// Reserve one request under explicit limits (per-agent overrides)
    pub async fn reserve(
        &self,
        agent_id: &str,
        user_id: &str,
        limits: &RateLimits,
    ) -> Result<RateDecision, QueueError> {
        let decision = self
            .backend
            .check_and_reserve(agent_id, user_id, limits, self.clock.now())
            .await?;

        if let RateDecision::Exceeded {
            window,
            retry_after,
        } = &decision
        {
            warn!(
                agent_id = %agent_id,
                user_id = %user_id,
                window = %window,
                retry_after_secs = retry_after.num_seconds(),
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    pub async fn counters(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Vec<RateLimitCounter>, QueueError> {
        self.backend.counters(agent_id, user_id).await
    }
}
