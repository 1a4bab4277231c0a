//! Execution queue service
//!
//! Wraps a [`QueueBackend`] with admission control, retry decisions, history
//! and metrics. Every state change of a job goes through this type.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{LeaseGuard, QueueBackend, QueueError, Transition};
use crate::clock::{Clock, SystemClock};
use crate::credentials::{CredentialError, CredentialResolver};
use crate::directory::{AgentDirectory, DirectoryError};
use crate::history::{HistoryEntry, HistoryRecorder, HistoryStore, MemoryHistoryStore, Phase};
use crate::job::{ErrorClass, ExecutionJob, JobId, JobStatus, NewJob, Outcome, DEFAULT_TIMEOUT_SECS};
use crate::metrics::RuntimeMetrics;
use crate::rate_limit::{LimitWindow, RateDecision, RateLimiter};
use crate::retry::RetryPolicies;
use crate::schedule::ScheduleStore;

/// Reasons an execution request is refused before a job exists
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Rate limit exceeded for agent {agent_id} / user {user_id} ({window})")]
    RateLimitExceeded {
        agent_id: String,
        user_id: String,
        window: LimitWindow,
        retry_after_secs: i64,
    },
    #[error("Agent not found: {0}")]
    AgentNotFound(String),
    #[error("Agent is inactive: {0}")]
    AgentInactive(String),
    #[error("User {user_id} is not entitled to agent {agent_id}")]
    UserNotEntitled { agent_id: String, user_id: String },
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Missing credential: {0}")]
    MissingCredential(String),
}

impl From<DirectoryError> for QueueError {
    fn from(e: DirectoryError) -> Self {
        QueueError::Backend(e.to_string())
    }
}

pub struct ExecutionQueueBuilder {
    backend: Arc<dyn QueueBackend>,
    directory: Arc<dyn AgentDirectory>,
    credentials: Arc<dyn CredentialResolver>,
    clock: Option<Arc<dyn Clock>>,
    rate_limiter: Option<RateLimiter>,
    retry_policies: Option<Arc<RetryPolicies>>,
    history_store: Option<Arc<dyn HistoryStore>>,
    schedules: Option<Arc<dyn ScheduleStore>>,
    metrics: Option<Arc<RuntimeMetrics>>,
}

impl ExecutionQueueBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn retry_policies(mut self, policies: Arc<RetryPolicies>) -> Self {
        self.retry_policies = Some(policies);
        self
    }

    pub fn history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history_store = Some(store);
        self
    }

    pub fn schedules(mut self, schedules: Arc<dyn ScheduleStore>) -> Self {
        self.schedules = Some(schedules);
        self
    }

    pub fn metrics(mut self, metrics: Arc<RuntimeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> ExecutionQueue {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let rate_limiter = self
            .rate_limiter
            .unwrap_or_else(RateLimiter::in_memory)
            .with_clock(clock.clone());
        let history_store = self
            .history_store
            .unwrap_or_else(|| Arc::new(MemoryHistoryStore::new()));

        ExecutionQueue {
            history: HistoryRecorder::new(history_store, self.backend.clone()),
            backend: self.backend,
            directory: self.directory,
            credentials: self.credentials,
            clock,
            rate_limiter,
            retry_policies: self.retry_policies.unwrap_or_default(),
            schedules: self.schedules,
            metrics: self.metrics.unwrap_or_default(),
        }
    }
}

pub struct ExecutionQueue {
    backend: Arc<dyn QueueBackend>,
    directory: Arc<dyn AgentDirectory>,
    credentials: Arc<dyn CredentialResolver>,
    clock: Arc<dyn Clock>,
    rate_limiter: RateLimiter,
    retry_policies: Arc<RetryPolicies>,
    history: HistoryRecorder,
    schedules: Option<Arc<dyn ScheduleStore>>,
    metrics: Arc<RuntimeMetrics>,
}

impl fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("clock", &self.clock)
            .field("rate_limiter", &self.rate_limiter)
            .finish_non_exhaustive()
    }
}

impl ExecutionQueue {
    pub fn builder(
        backend: Arc<dyn QueueBackend>,
        directory: Arc<dyn AgentDirectory>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> ExecutionQueueBuilder {
        ExecutionQueueBuilder {
            backend,
            directory,
            credentials,
            clock: None,
            rate_limiter: None,
            retry_policies: None,
            history_store: None,
            schedules: None,
            metrics: None,
        }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn directory(&self) -> &Arc<dyn AgentDirectory> {
        &self.directory
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialResolver> {
        &self.credentials
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn retry_policies(&self) -> &Arc<RetryPolicies> {
        &self.retry_policies
    }

    pub fn history(&self) -> &HistoryRecorder {
        &self.history
    }

    pub fn schedules(&self) -> Option<&Arc<dyn ScheduleStore>> {
        self.schedules.as_ref()
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    /// Admit an execution request and persist it as a `queued` job.
    ///
    /// Checks run in a fixed order and the first failure wins. The rate-limit
    /// reservation is the last check; a rejected request leaves no job behind.
    pub async fn enqueue(&self, request: NewJob) -> Result<JobId, QueueError> {
        match self.admit(request).await {
            Ok(job) => {
                self.metrics.record_enqueued();
                Ok(job.id)
            }
            Err(QueueError::Admission(e)) => {
                let rate_limited = matches!(e, AdmissionError::RateLimitExceeded { .. });
                self.metrics.record_rejected(rate_limited);
                debug!(error = %e, "Execution request rejected");
                Err(QueueError::Admission(e))
            }
            Err(e) => Err(e),
        }
    }

    async fn admit(&self, request: NewJob) -> Result<ExecutionJob, QueueError> {
        let agent = self
            .directory
            .agent(&request.agent_id)
            .await?
            .ok_or_else(|| AdmissionError::AgentNotFound(request.agent_id.clone()))?;

        if !agent.active {
            return Err(AdmissionError::AgentInactive(agent.id).into());
        }

        if !self
            .directory
            .is_entitled(&request.agent_id, &request.user_id)
            .await?
        {
            return Err(AdmissionError::UserNotEntitled {
                agent_id: request.agent_id,
                user_id: request.user_id,
            }
            .into());
        }

        if !request.payload.is_object() {
            return Err(AdmissionError::InvalidPayload(
                "payload must be a JSON object".to_string(),
            )
            .into());
        }

        // Presence check only; values are resolved again at dispatch
        match self
            .credentials
            .resolve(&request.agent_id, &request.user_id, &agent.required_fields)
            .await
        {
            Ok(_) => {}
            Err(CredentialError::Missing(field)) => {
                return Err(AdmissionError::MissingCredential(field).into())
            }
            Err(e) => return Err(QueueError::Backend(e.to_string())),
        }

        let limits = agent
            .rate_limits
            .unwrap_or(*self.rate_limiter.defaults());
        if let RateDecision::Exceeded {
            window,
            retry_after,
        } = self
            .rate_limiter
            .reserve(&request.agent_id, &request.user_id, &limits)
            .await?
        {
            return Err(AdmissionError::RateLimitExceeded {
                agent_id: request.agent_id,
                user_id: request.user_id,
                window,
                retry_after_secs: retry_after.num_seconds().max(1),
            }
            .into());
        }

        let now = self.clock.now();
        let job = ExecutionJob {
            id: Uuid::new_v4(),
            agent_id: request.agent_id,
            user_id: request.user_id,
            trigger_type: request.trigger_type,
            payload: request.payload,
            priority: request.priority,
            scheduled_for: request.scheduled_for.unwrap_or(now),
            attempt: 0,
            max_attempts: request.max_attempts,
            timeout_secs: request
                .timeout_secs
                .or(agent.default_timeout_secs)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            status: JobStatus::Queued,
            lease_owner: None,
            schedule_id: request.schedule_id,
            result: None,
            error_message: None,
            error_class: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            sequence: 0,
        };
        let job = self.backend.insert(job).await?;

        info!(
            job_id = %job.id,
            agent_id = %job.agent_id,
            user_id = %job.user_id,
            trigger = %job.trigger_type,
            priority = job.priority,
            "Job enqueued"
        );
        self.history
            .record(
                HistoryEntry::for_job(&job, Phase::Init, now)
                    .with_log(format!("enqueued via {}", job.trigger_type)),
            )
            .await;

        Ok(job)
    }

    /// Lease the next claimable job to `worker_id`, if it has room
    pub async fn claim_next(
        &self,
        worker_id: &str,
        capacity_remaining: u32,
    ) -> Result<Option<ExecutionJob>, QueueError> {
        if capacity_remaining == 0 {
            return Ok(None);
        }
        let claimed = self.backend.claim_next(worker_id, self.clock.now()).await?;
        if let Some(job) = &claimed {
            self.metrics.record_claimed();
            debug!(
                job_id = %job.id,
                worker_id = %worker_id,
                attempt = job.attempt,
                "Job claimed"
            );
        }
        Ok(claimed)
    }

    /// Apply the outcome of the current attempt.
    ///
    /// Fails with [`QueueError::LeaseLost`] when `worker_id` no longer owns the
    /// job (it was reaped and possibly re-leased); nothing changes in that case.
    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        outcome: Outcome,
    ) -> Result<JobStatus, QueueError> {
        let job = self.backend.get_job(job_id).await?;
        if job.status != JobStatus::Running || job.lease_owner.as_deref() != Some(worker_id) {
            return Err(QueueError::LeaseLost(job_id));
        }

        let guard = LeaseGuard {
            owner: worker_id.to_string(),
            attempt: job.attempt,
        };
        let now = self.clock.now();
        let elapsed_ms = job
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);

        let (transition, status) = self.decide(&job, outcome, now);
        let (phase, log_line) = match &transition {
            Transition::Finish {
                status: JobStatus::Completed,
                ..
            } => (Phase::Completed, "completed".to_string()),
            Transition::Finish {
                status,
                error_message,
                ..
            } => (
                Phase::Error,
                format!(
                    "{}: {}",
                    status,
                    error_message.as_deref().unwrap_or("no message")
                ),
            ),
            Transition::Requeue {
                error_class,
                error_message,
                scheduled_for,
                ..
            } => (
                Phase::Error,
                format!(
                    "{}: {} (retry at {})",
                    error_class,
                    error_message,
                    scheduled_for.to_rfc3339()
                ),
            ),
        };

        if !self.backend.transition(job_id, &guard, transition).await? {
            warn!(job_id = %job_id, worker_id = %worker_id, "Completion lost lease race");
            return Err(QueueError::LeaseLost(job_id));
        }

        let mut entry = HistoryEntry::for_job(&job, phase, now).with_log(log_line);
        if let Some(ms) = elapsed_ms {
            entry = entry.with_duration_ms(ms);
        }
        self.history.record(entry).await;

        if status == JobStatus::Queued {
            self.metrics.record_retry();
        } else {
            self.metrics.record_terminal(status);
            if let (Some(schedule_id), Some(schedules)) = (job.schedule_id, &self.schedules) {
                let succeeded = status == JobStatus::Completed;
                if let Err(e) = schedules.record_outcome(schedule_id, succeeded).await {
                    warn!(schedule_id = %schedule_id, error = %e, "Failed to record schedule outcome");
                }
            }
        }

        Ok(status)
    }

    fn decide(&self, job: &ExecutionJob, outcome: Outcome, now: DateTime<Utc>) -> (Transition, JobStatus) {
        let (class, message) = match outcome {
            Outcome::Success(result) => {
                info!(job_id = %job.id, attempt = job.attempt + 1, "Job completed");
                return (
                    Transition::Finish {
                        status: JobStatus::Completed,
                        result: Some(result),
                        error_class: None,
                        error_message: None,
                        finished_at: now,
                    },
                    JobStatus::Completed,
                );
            }
            Outcome::Failure { class, message } => (class, message),
            Outcome::Timeout => (
                ErrorClass::Timeout,
                format!("no response within {}s", job.timeout_secs),
            ),
        };

        let attempts_made = job.attempt + 1;
        let policy = self.retry_policies.lookup(&job.agent_id, class);

        if policy.should_retry(attempts_made, class) && attempts_made < job.max_attempts {
            let delay = policy.next_delay(attempts_made);
            let scheduled_for = now
                + Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(300));
            info!(
                job_id = %job.id,
                attempt = attempts_made,
                error_class = %class,
                delay_ms = delay.as_millis() as u64,
                "Job failed, scheduling retry with backoff"
            );
            return (
                Transition::Requeue {
                    attempt: attempts_made,
                    scheduled_for,
                    error_class: class,
                    error_message: message,
                },
                JobStatus::Queued,
            );
        }

        let status = if class == ErrorClass::Timeout {
            JobStatus::TimedOut
        } else {
            JobStatus::Failed
        };
        warn!(
            job_id = %job.id,
            attempt = attempts_made,
            error_class = %class,
            status = %status,
            "Job failed permanently"
        );
        (
            Transition::Finish {
                status,
                result: None,
                error_class: Some(class),
                error_message: Some(message),
                finished_at: now,
            },
            status,
        )
    }

    /// Cancel a job that has not been claimed yet
    pub async fn cancel(&self, job_id: JobId) -> Result<(), QueueError> {
        let now = self.clock.now();
        if self.backend.cancel(job_id, now).await? {
            info!(job_id = %job_id, "Job cancelled");
            self.metrics.record_terminal(JobStatus::Cancelled);
            if let Ok(job) = self.backend.get_job(job_id).await {
                self.history
                    .record(HistoryEntry::for_job(&job, Phase::Error, now).with_log("cancelled"))
                    .await;
            }
            return Ok(());
        }
        let job = self.backend.get_job(job_id).await?;
        Err(QueueError::InvalidTransition {
            id: job_id,
            status: job.status,
        })
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<ExecutionJob, QueueError> {
        self.backend.get_job(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::credentials::MemoryCredentials;
    use crate::directory::{AgentRecord, MemoryDirectory};
    use crate::job::TriggerType;
    use crate::memory::MemoryQueue;
    use crate::retry::RetryPolicy;
    use serde_json::json;

    async fn setup() -> (ExecutionQueue, Arc<MemoryDirectory>, Arc<MemoryCredentials>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let directory = Arc::new(MemoryDirectory::new());
        directory
            .register(
                AgentRecord::new("summarizer", "Summarizer", "http://localhost/hook")
                    .with_required_fields(["api_key"]),
            )
            .await;
        directory.install("summarizer", "alice").await;

        let credentials = Arc::new(MemoryCredentials::new(clock.clone()));
        credentials.set("summarizer", "alice", "api_key", "sk-alice").await;

        let policies = Arc::new(RetryPolicies::new(RetryPolicy::default().without_jitter()));
        let queue = ExecutionQueue::builder(
            Arc::new(MemoryQueue::new()),
            directory.clone(),
            credentials.clone(),
        )
        .clock(clock.clone())
        .retry_policies(policies)
        .build();
        (queue, directory, credentials, clock)
    }

    fn request(user: &str) -> NewJob {
        NewJob::new("summarizer", user, TriggerType::Api, json!({"text": "hello"}))
    }

    fn admission(err: QueueError) -> AdmissionError {
        match err {
            QueueError::Admission(e) => e,
            other => panic!("expected admission error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admission_order() {
        let (queue, directory, credentials, _) = setup().await;

        let err = queue
            .enqueue(NewJob::new("ghost", "alice", TriggerType::Api, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(admission(err), AdmissionError::AgentNotFound(_)));

        let err = queue.enqueue(request("bob")).await.unwrap_err();
        assert!(matches!(admission(err), AdmissionError::UserNotEntitled { .. }));

        let err = queue
            .enqueue(NewJob::new("summarizer", "alice", TriggerType::Api, json!([1, 2])))
            .await
            .unwrap_err();
        assert!(matches!(admission(err), AdmissionError::InvalidPayload(_)));

        credentials.deactivate("summarizer", "alice", "api_key").await;
        let err = queue.enqueue(request("alice")).await.unwrap_err();
        match admission(err) {
            AdmissionError::MissingCredential(field) => assert_eq!(field, "api_key"),
            other => panic!("unexpected {:?}", other),
        }

        directory.set_active("summarizer", false).await;
        let err = queue.enqueue(request("alice")).await.unwrap_err();
        assert!(matches!(admission(err), AdmissionError::AgentInactive(_)));
    }

    #[tokio::test]
    async fn test_rejected_request_creates_no_job() {
        let (queue, _, _, _) = setup().await;
        let _ = queue.enqueue(request("bob")).await;
        let jobs = queue.backend().list_jobs("bob", None, 10).await.unwrap();
        assert!(jobs.is_empty());
        assert_eq!(queue.metrics().snapshot().admissions_rejected, 1);
    }

    #[tokio::test]
    async fn test_init_history_written_on_enqueue() {
        let (queue, _, _, _) = setup().await;
        let id = queue.enqueue(request("alice")).await.unwrap();
        let entries = queue.history().entries_for_job(id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].phase, Phase::Init);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (queue, _, _, clock) = setup().await;
        let id = queue.enqueue(request("alice")).await.unwrap();

        let job = queue.claim_next("w1", 1).await.unwrap().unwrap();
        let status = queue
            .complete(job.id, "w1", Outcome::failure(ErrorClass::ServerError, "503"))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Queued);

        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.attempt, 1);
        assert_eq!(job.scheduled_for, clock.now() + Duration::seconds(5));
        assert!(job.lease_owner.is_none());

        assert!(queue.claim_next("w1", 1).await.unwrap().is_none());
        clock.advance(Duration::seconds(5));
        let job = queue.claim_next("w1", 1).await.unwrap().unwrap();
        let status = queue
            .complete(job.id, "w1", Outcome::Success(json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let (queue, _, _, _) = setup().await;
        let id = queue.enqueue(request("alice")).await.unwrap();
        queue.claim_next("w1", 1).await.unwrap().unwrap();
        let status = queue
            .complete(id, "w1", Outcome::failure(ErrorClass::ClientError, "400"))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Failed);
        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.error_class, Some(ErrorClass::ClientError));
        assert_eq!(job.attempt, 0);
    }

    #[tokio::test]
    async fn test_final_timeout_is_timed_out() {
        let (queue, _, _, clock) = setup().await;
        let id = queue
            .enqueue(request("alice").with_max_attempts(1))
            .await
            .unwrap();
        queue.claim_next("w1", 1).await.unwrap().unwrap();
        clock.advance(Duration::seconds(31));
        let status = queue.complete(id, "w1", Outcome::Timeout).await.unwrap();
        assert_eq!(status, JobStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_completion_from_wrong_worker_is_lease_lost() {
        let (queue, _, _, _) = setup().await;
        let id = queue.enqueue(request("alice")).await.unwrap();
        queue.claim_next("w1", 1).await.unwrap().unwrap();
        let err = queue
            .complete(id, "w2", Outcome::Success(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(_)));
        assert_eq!(queue.get_job(id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_cancel_only_while_queued() {
        let (queue, _, _, _) = setup().await;
        let first = queue.enqueue(request("alice")).await.unwrap();
        queue.cancel(first).await.unwrap();
        assert_eq!(queue.get_job(first).await.unwrap().status, JobStatus::Cancelled);

        let second = queue.enqueue(request("alice")).await.unwrap();
        queue.claim_next("w1", 1).await.unwrap().unwrap();
        let err = queue.cancel(second).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                status: JobStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_zero_capacity_claims_nothing() {
        let (queue, _, _, _) = setup().await;
        queue.enqueue(request("alice")).await.unwrap();
        assert!(queue.claim_next("w1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_agent_rate_limit_override() {
        let (queue, directory, _, _) = setup().await;
        directory
            .register(
                AgentRecord::new("summarizer", "Summarizer", "http://localhost/hook")
                    .with_required_fields(["api_key"])
                    .with_rate_limits(crate::rate_limit::RateLimits {
                        per_minute: Some(1),
                        per_hour: None,
                        per_day: None,
                    }),
            )
            .await;

        queue.enqueue(request("alice")).await.unwrap();
        let err = queue.enqueue(request("alice")).await.unwrap_err();
        assert!(matches!(
            admission(err),
            AdmissionError::RateLimitExceeded {
                window: LimitWindow::PerMinute,
                ..
            }
        ));
        assert_eq!(queue.metrics().snapshot().rate_limited, 1);
    }
}
