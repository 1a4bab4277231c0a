//! Job definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job Identifier (stable across retries)
pub type JobId = Uuid;

/// Most urgent priority value
pub const HIGHEST_PRIORITY: u8 = 1;
/// Least urgent priority value
pub const LOWEST_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Dispatch timeout used when neither the trigger nor the agent sets one
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Error returned when parsing a stored enum label fails
#[derive(Debug, thiserror::Error)]
#[error("Unknown {kind}: {value}")]
pub struct ParseLabelError {
    kind: &'static str,
    value: String,
}

impl ParseLabelError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// What caused the job to be enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Schedule,
    Manual,
    Api,
    Test,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Manual => "manual",
            Self::Api => "api",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(Self::Webhook),
            "schedule" => Ok(Self::Schedule),
            "manual" => Ok(Self::Manual),
            "api" => Ok(Self::Api),
            "test" => Ok(Self::Test),
            other => Err(ParseLabelError::new("trigger type", other)),
        }
    }
}

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in queue (initial state, also the retry state)
    Queued,
    /// Leased by a worker
    Running,
    /// Webhook returned 2xx
    Completed,
    /// Permanently failed
    Failed,
    /// Permanently failed because the last attempt timed out
    TimedOut,
    /// Cancelled before any worker claimed it
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseLabelError::new("job status", other)),
        }
    }
}

/// Classification of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection refused, DNS failure, reset
    NetworkError,
    /// Dispatch exceeded its deadline
    Timeout,
    /// 5xx from the agent endpoint
    ServerError,
    /// 429 from the agent endpoint
    RateLimitedByRemote,
    /// 4xx other than 429
    ClientError,
    /// Payload could not be built or serialized
    MalformedPayload,
    /// A required credential is absent or expired
    MissingCredential,
    /// Agent was removed or deactivated after the job was admitted
    AgentUnavailable,
    /// Lease expired while the job was running
    WorkerLost,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::Timeout
                | Self::ServerError
                | Self::RateLimitedByRemote
                | Self::WorkerLost
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::ServerError => "server_error",
            Self::RateLimitedByRemote => "rate_limited_by_remote",
            Self::ClientError => "client_error",
            Self::MalformedPayload => "malformed_payload",
            Self::MissingCredential => "missing_credential",
            Self::AgentUnavailable => "agent_unavailable",
            Self::WorkerLost => "worker_lost",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network_error" => Ok(Self::NetworkError),
            "timeout" => Ok(Self::Timeout),
            "server_error" => Ok(Self::ServerError),
            "rate_limited_by_remote" => Ok(Self::RateLimitedByRemote),
            "client_error" => Ok(Self::ClientError),
            "malformed_payload" => Ok(Self::MalformedPayload),
            "missing_credential" => Ok(Self::MissingCredential),
            "agent_unavailable" => Ok(Self::AgentUnavailable),
            "worker_lost" => Ok(Self::WorkerLost),
            other => Err(ParseLabelError::new("error class", other)),
        }
    }
}

/// A persisted execution job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub id: JobId,
    pub agent_id: String,
    pub user_id: String,
    pub trigger_type: TriggerType,
    pub payload: serde_json::Value,
    /// 1 (most urgent) to 10
    pub priority: u8,
    pub scheduled_for: DateTime<Utc>,
    /// Attempts already made and failed
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub status: JobStatus,
    pub lease_owner: Option<String>,
    pub schedule_id: Option<Uuid>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub created_at: DateTime<Utc>,
    /// Claim time of the current (or last) attempt
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Insertion order, assigned by the backend
    pub sequence: u64,
}

impl ExecutionJob {
    /// Whether `ClaimNext` may hand this job out at `now`
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued
            && self.scheduled_for <= now
            && self.attempt < self.max_attempts
    }

    /// Wall time of the last attempt, once finished
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        }
    }
}

/// An execution request, before admission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub agent_id: String,
    pub user_id: String,
    pub trigger_type: TriggerType,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: u32,
    /// Overrides the agent's default dispatch timeout
    pub timeout_secs: Option<u64>,
    pub schedule_id: Option<Uuid>,
}

impl NewJob {
    pub fn new(
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        trigger_type: TriggerType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            trigger_type,
            payload,
            priority: DEFAULT_PRIORITY,
            scheduled_for: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout_secs: None,
            schedule_id: None,
        }
    }

    /// Set priority, clamped to 1..=10
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(HIGHEST_PRIORITY, LOWEST_PRIORITY);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn from_schedule(mut self, schedule_id: Uuid) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }
}

/// Result of one dispatch attempt, as reported to `Complete`
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(serde_json::Value),
    Failure { class: ErrorClass, message: String },
    Timeout,
}

impl Outcome {
    pub fn failure(class: ErrorClass, message: impl Into<String>) -> Self {
        Self::Failure {
            class,
            message: message.into(),
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Success(_) => None,
            Self::Failure { class, .. } => Some(*class),
            Self::Timeout => Some(ErrorClass::Timeout),
        }
    }
}
