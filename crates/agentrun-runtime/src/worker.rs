//! Worker pool: claim, resolve credentials, dispatch, complete

use std::sync::Arc;
use std::time::Duration;

use agentrun_dispatch::{Dispatcher, WebhookPayload};
use agentrun_queue::{
    CredentialError, ErrorClass, ExecutionJob, ExecutionQueue, HistoryEntry, JobStatus,
    LeaseManager, Outcome, Phase, QueueError,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub capacity: u32,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl From<&RuntimeConfig> for WorkerConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            capacity: config.capacity,
            poll_interval: config.poll_interval,
            heartbeat_interval: config.heartbeat_interval,
        }
    }
}

/// One logical worker running up to `capacity` jobs at a time
pub struct WorkerPool {
    queue: Arc<ExecutionQueue>,
    dispatcher: Arc<dyn Dispatcher>,
    leases: LeaseManager,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<ExecutionQueue>,
        dispatcher: Arc<dyn Dispatcher>,
        config: WorkerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.capacity.max(1) as usize));
        Self {
            leases: LeaseManager::new(queue.clone()),
            queue,
            dispatcher,
            config,
            permits,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Jobs currently in flight
    pub fn current_load(&self) -> u32 {
        self.config.capacity.max(1) - self.permits.available_permits() as u32
    }

    pub async fn heartbeat(&self) -> Result<(), QueueError> {
        self.leases
            .heartbeat(&self.config.worker_id, self.config.capacity, self.current_load())
            .await
            .map(|_| ())
    }

    /// Claim and fully process at most one job inline.
    ///
    /// Returns the status the job was left in, or `None` if nothing was
    /// claimable.
    pub async fn run_once(&self) -> Result<Option<JobStatus>, QueueError> {
        let remaining = self.permits.available_permits() as u32;
        match self.queue.claim_next(&self.config.worker_id, remaining).await? {
            Some(job) => self.process(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Poll until `shutdown` fires, then wait for in-flight jobs
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            capacity = self.config.capacity,
            "Worker pool started"
        );

        let heartbeats = tokio::spawn(self.clone().heartbeat_loop(shutdown.child_token()));

        while !shutdown.is_cancelled() {
            if !self.claim_with_permit(&shutdown).await {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "Worker pool draining");
        if let Err(e) = self.permits.acquire_many(self.config.capacity.max(1)).await {
            warn!(error = %e, "Worker semaphore closed while draining");
        }
        if let Err(e) = heartbeats.await {
            warn!(error = %e, "Heartbeat task panicked");
        }
        if let Err(e) = self.heartbeat().await {
            debug!(error = %e, "Final heartbeat failed");
        }
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
    }

    async fn heartbeat_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(worker_id = %self.config.worker_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    }

    /// Wait for a free slot, claim one job and spawn it. False when nothing was claimed.
    async fn claim_with_permit(self: &Arc<Self>, shutdown: &CancellationToken) -> bool {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => return false,
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        // Our own permit is still held, so count it as remaining
        let remaining = self.permits.available_permits() as u32 + 1;
        match self.queue.claim_next(&self.config.worker_id, remaining).await {
            Ok(Some(job)) => {
                let pool = self.clone();
                tokio::spawn(async move {
                    let job_id = job.id;
                    match pool.process(job).await {
                        Ok(_) => {}
                        Err(QueueError::LeaseLost(_)) => {
                            warn!(job_id = %job_id, "Lease lost before completion; result discarded")
                        }
                        Err(e) => error!(job_id = %job_id, error = %e, "Job processing failed"),
                    }
                    drop(permit);
                });
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(worker_id = %self.config.worker_id, error = %e, "Claim failed");
                false
            }
        }
    }

    /// Resolve, dispatch and complete one claimed job
    pub async fn process(&self, job: ExecutionJob) -> Result<JobStatus, QueueError> {
        let outcome = self.execute(&job).await;
        self.queue
            .complete(job.id, &self.config.worker_id, outcome)
            .await
    }

    async fn execute(&self, job: &ExecutionJob) -> Outcome {
        let clock = self.queue.clock();

        let agent = match self.queue.directory().agent(&job.agent_id).await {
            Ok(Some(agent)) if agent.active => agent,
            Ok(Some(_)) => {
                return Outcome::failure(
                    ErrorClass::AgentUnavailable,
                    format!("agent {} is inactive", job.agent_id),
                )
            }
            Ok(None) => {
                return Outcome::failure(
                    ErrorClass::AgentUnavailable,
                    format!("agent {} no longer exists", job.agent_id),
                )
            }
            Err(e) => return Outcome::failure(ErrorClass::NetworkError, e.to_string()),
        };

        let credentials = match self
            .queue
            .credentials()
            .resolve(&job.agent_id, &job.user_id, &agent.required_fields)
            .await
        {
            Ok(bundle) => bundle,
            Err(CredentialError::Missing(field)) | Err(CredentialError::Decryption(field)) => {
                return Outcome::failure(
                    ErrorClass::MissingCredential,
                    format!("credential field {} is unavailable", field),
                )
            }
            Err(CredentialError::Backend(e)) => {
                return Outcome::failure(
                    ErrorClass::NetworkError,
                    format!("credential store unavailable: {}", e),
                )
            }
        };

        let payload = WebhookPayload::for_job(job, &agent, credentials, clock.now());

        self.queue
            .history()
            .record(
                HistoryEntry::for_job(job, Phase::Dispatching, clock.now())
                    .with_log(format!("POST {}", agent.webhook_url))
                    .with_log(format!("correlation_id {}", payload.correlation_id)),
            )
            .await;

        let timeout = Duration::from_secs(job.timeout_secs.max(1));
        let result = self
            .dispatcher
            .dispatch(&agent.webhook_url, &payload, timeout)
            .await;
        self.queue.metrics().record_dispatch(result.latency_ms);

        let mut entry = HistoryEntry::for_job(job, Phase::AwaitingResponse, clock.now())
            .with_duration_ms(result.latency_ms);
        entry = match (result.status_code, &result.error_class) {
            (Some(code), _) => entry.with_log(format!("HTTP {}", code)),
            (None, Some(class)) => entry.with_log(format!("no response: {}", class)),
            (None, None) => entry,
        };
        self.queue.history().record(entry).await;

        debug!(
            job_id = %job.id,
            success = result.success,
            latency_ms = result.latency_ms,
            "Dispatch finished"
        );
        result.into_outcome()
    }
}
