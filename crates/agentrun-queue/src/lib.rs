//! # AgentRun Queue
//!
//! Execution queue for webhook-backed agents.
//!
//! Features:
//! - `ExecutionQueue` service with admission, atomic claim, retry-aware completion
//! - Pluggable backends (`QueueBackend`, `HistoryStore`, `ScheduleStore`, `RateLimitBackend`)
//! - In-memory backends for tests and single-process deployments
//! - Retry policies with fixed, linear and exponential backoff
//! - All-or-nothing multi-window rate limiting
//! - Worker leases with heartbeat-based crash recovery
//! - Cron schedules with consecutive-failure auto-disable

pub mod backend;
pub mod clock;
pub mod credentials;
pub mod directory;
pub mod history;
pub mod job;
pub mod lease;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod schedule;

pub use backend::{LeaseGuard, QueueBackend, QueueError, Transition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::{CredentialBundle, CredentialError, CredentialResolver, MemoryCredentials};
pub use directory::{AgentDirectory, AgentRecord, DirectoryError, MemoryDirectory};
pub use history::{
    DailyRollup, HistoryEntry, HistoryRecorder, HistoryStore, JobSummary, MemoryHistoryStore,
    Phase,
};
pub use job::{
    ErrorClass, ExecutionJob, JobId, JobStatus, NewJob, Outcome, ParseLabelError, TriggerType,
};
pub use lease::{LeaseManager, ReapReport, Worker, WorkerStatus};
pub use memory::MemoryQueue;
pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use queue::{AdmissionError, ExecutionQueue, ExecutionQueueBuilder};
pub use rate_limit::{
    LimitWindow, MemoryRateLimitBackend, RateDecision, RateLimitBackend, RateLimitCounter,
    RateLimiter, RateLimits,
};
pub use retry::{BackoffStrategy, RetryPolicies, RetryPolicy};
pub use schedule::{CronSchedule, MemoryScheduleStore, Schedule, ScheduleError, ScheduleStore};
