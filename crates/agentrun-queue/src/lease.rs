//! Worker leases: heartbeats, capacity and crash recovery

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::QueueError;
use crate::job::{ErrorClass, JobId, Outcome};
use crate::queue::ExecutionQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn for_load(current_load: u32) -> Self {
        if current_load == 0 {
            Self::Idle
        } else {
            Self::Busy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = crate::job::ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(crate::job::ParseLabelError::new("worker status", other)),
        }
    }
}

/// A registered worker, created on first heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub capacity: u32,
    pub current_load: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
}

impl Worker {
    pub fn new(id: &str, capacity: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            capacity,
            current_load: 0,
            last_heartbeat: now,
            status: WorkerStatus::Idle,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.status != WorkerStatus::Offline && self.current_load < self.capacity
    }
}

/// Summary of one reaper pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReapReport {
    /// Jobs completed as `worker_lost`
    pub reclaimed: Vec<JobId>,
    /// Orphans another completion got to first
    pub skipped: usize,
    pub workers_offline: Vec<String>,
}

/// Heartbeats and lease reaping on top of an [`ExecutionQueue`]
#[derive(Debug, Clone)]
pub struct LeaseManager {
    queue: Arc<ExecutionQueue>,
}

impl LeaseManager {
    pub fn new(queue: Arc<ExecutionQueue>) -> Self {
        Self { queue }
    }

    /// Upsert the worker and refresh `last_heartbeat`
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        capacity: u32,
        current_load: u32,
    ) -> Result<Worker, QueueError> {
        let now = self.queue.clock().now();
        self.queue
            .backend()
            .upsert_worker(worker_id, capacity, current_load, now)
            .await
    }

    pub async fn workers(&self) -> Result<Vec<Worker>, QueueError> {
        self.queue.backend().list_workers().await
    }

    /// Reclaim running jobs whose owner stopped heartbeating.
    ///
    /// Each orphan goes through the regular completion path as a
    /// `worker_lost` failure, so it is retried or failed under the normal
    /// attempt bound.
    pub async fn reap_expired_leases(&self, grace: Duration) -> Result<ReapReport, QueueError> {
        let cutoff = self.queue.clock().now() - grace;
        let mut report = ReapReport::default();

        for job in self.queue.backend().orphaned_jobs(cutoff).await? {
            let Some(owner) = job.lease_owner.clone() else {
                continue;
            };
            warn!(
                job_id = %job.id,
                worker_id = %owner,
                attempt = job.attempt,
                "Reclaiming job from lapsed worker"
            );
            let outcome = Outcome::failure(
                ErrorClass::WorkerLost,
                format!("worker {} stopped heartbeating", owner),
            );
            match self.queue.complete(job.id, &owner, outcome).await {
                Ok(_) => report.reclaimed.push(job.id),
                Err(QueueError::LeaseLost(_)) => report.skipped += 1,
                Err(e) => return Err(e),
            }
        }

        report.workers_offline = self.queue.backend().mark_workers_offline(cutoff).await?;
        for worker_id in &report.workers_offline {
            info!(worker_id = %worker_id, "Worker marked offline");
        }

        if !report.reclaimed.is_empty() {
            self.queue
                .metrics()
                .record_leases_reaped(report.reclaimed.len() as u64);
        }

        Ok(report)
    }
}
