//! Queue Backend Trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{ErrorClass, ExecutionJob, JobId, JobStatus};
use crate::lease::Worker;
use crate::queue::AdmissionError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("Job {id} cannot transition from {status}")]
    InvalidTransition { id: JobId, status: JobStatus },
    #[error("Lease on job {0} is no longer held by this worker")]
    LeaseLost(JobId),
}

/// The lease a completion claims to hold; the backend compares it against the row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    pub owner: String,
    pub attempt: u32,
}

/// State change applied to a running job
#[derive(Debug, Clone)]
pub enum Transition {
    /// Back to `queued` for another attempt
    Requeue {
        attempt: u32,
        scheduled_for: DateTime<Utc>,
        error_class: ErrorClass,
        error_message: String,
    },
    /// Terminal state
    Finish {
        status: JobStatus,
        result: Option<serde_json::Value>,
        error_class: Option<ErrorClass>,
        error_message: Option<String>,
        finished_at: DateTime<Utc>,
    },
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a freshly admitted job; the backend assigns `sequence`
    async fn insert(&self, job: ExecutionJob) -> Result<ExecutionJob, QueueError>;

    /// Atomically lease the best claimable job to `worker_id`.
    ///
    /// Order: lowest priority value, earliest `scheduled_for`, earliest
    /// insertion. The chosen job becomes `running` with `lease_owner` set,
    /// `started_at = now`, and the worker's load is incremented.
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionJob>, QueueError>;

    /// Compare-and-set from `running` under `guard`.
    ///
    /// Returns `false` (and changes nothing) when the job is no longer
    /// running under that owner and attempt.
    async fn transition(
        &self,
        id: JobId,
        guard: &LeaseGuard,
        transition: Transition,
    ) -> Result<bool, QueueError>;

    /// `queued -> cancelled`; `false` if the job is in any other state
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, QueueError>;

    async fn get_job(&self, id: JobId) -> Result<ExecutionJob, QueueError>;

    /// Jobs of a user, most recently created first
    async fn list_jobs(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionJob>, QueueError>;

    /// Terminal jobs of an agent that finished at or after `since`
    async fn finished_jobs_for_agent(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExecutionJob>, QueueError>;

    /// Create or refresh a worker from its heartbeat
    async fn upsert_worker(
        &self,
        worker_id: &str,
        capacity: u32,
        current_load: u32,
        now: DateTime<Utc>,
    ) -> Result<Worker, QueueError>;

    async fn list_workers(&self) -> Result<Vec<Worker>, QueueError>;

    /// Running jobs whose owner last heartbeated before `cutoff` or is unknown
    async fn orphaned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExecutionJob>, QueueError>;

    /// Mark workers with a heartbeat older than `cutoff` offline; returns their ids
    async fn mark_workers_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, QueueError>;
}
