//! Retry policies and backoff

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use crate::job::{ErrorClass, ParseLabelError};

/// Backoff curve between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        }
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffStrategy {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(ParseLabelError::new("backoff strategy", other)),
        }
    }
}

/// Retry policy for one agent (optionally narrowed to one error class)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    /// System default: 3 tries, exponential from 5s, capped at 5 minutes, jittered
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::Exponential,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::Fixed,
            initial_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.backoff {
            BackoffStrategy::Fixed => Some(self.initial_delay),
            BackoffStrategy::Linear => self.initial_delay.checked_mul(attempt),
            BackoffStrategy::Exponential => 2u32
                .checked_pow(attempt - 1)
                .and_then(|factor| self.initial_delay.checked_mul(factor)),
        };
        let capped = raw.map_or(self.max_delay, |d| d.min(self.max_delay));

        if self.jitter {
            let factor: f64 = rand::rng().random_range(0.5..1.5);
            capped.mul_f64(factor)
        } else {
            capped
        }
    }

    /// `attempts_made` failed attempts so far; true if another is allowed
    pub fn should_retry(&self, attempts_made: u32, class: ErrorClass) -> bool {
        attempts_made < self.max_retries && class.is_retryable()
    }
}

/// Policy registry keyed by (agent, error class)
#[derive(Debug, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    policies: RwLock<HashMap<(String, Option<ErrorClass>), RetryPolicy>>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// Register a policy; `class = None` applies to every class of the agent
    pub fn set(&self, agent_id: &str, class: Option<ErrorClass>, policy: RetryPolicy) {
        self.policies
            .write()
            .expect("Retry policy RwLock poisoned")
            .insert((agent_id.to_string(), class), policy);
    }

    /// (agent, class), then (agent, any class), then the system default
    pub fn lookup(&self, agent_id: &str, class: ErrorClass) -> RetryPolicy {
        let policies = self.policies.read().expect("Retry policy RwLock poisoned");
        policies
            .get(&(agent_id.to_string(), Some(class)))
            .or_else(|| policies.get(&(agent_id.to_string(), None)))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
