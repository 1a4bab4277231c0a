//! In-memory queue implementation with priority scheduling

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::backend::{LeaseGuard, QueueBackend, QueueError, Transition};
use crate::job::{ExecutionJob, JobId, JobStatus};
use crate::lease::{Worker, WorkerStatus};

/// Claim ordering key - lowest priority value, then earliest run time, then insertion order
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct ClaimKey {
    priority: u8,
    scheduled_for: DateTime<Utc>,
    sequence: u64,
}

impl ClaimKey {
    fn of(job: &ExecutionJob) -> Self {
        Self {
            priority: job.priority,
            scheduled_for: job.scheduled_for,
            sequence: job.sequence,
        }
    }
}

impl Ord for ClaimKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.scheduled_for.cmp(&other.scheduled_for))
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for ClaimKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, ExecutionJob>,
    workers: HashMap<String, Worker>,
    next_sequence: u64,
}

impl State {
    fn adjust_load(&mut self, worker_id: &str, delta: i64) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.current_load = if delta < 0 {
                worker.current_load.saturating_sub(delta.unsigned_abs() as u32)
            } else {
                worker.current_load.saturating_add(delta as u32)
            };
            if worker.status != WorkerStatus::Offline {
                worker.status = WorkerStatus::for_load(worker.current_load);
            }
        }
    }
}

/// Process-local queue backend. Every mutation happens under one write lock,
/// which is what makes `claim_next` atomic across concurrent workers.
#[derive(Debug, Default, Clone)]
pub struct MemoryQueue {
    state: Arc<RwLock<State>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn insert(&self, mut job: ExecutionJob) -> Result<ExecutionJob, QueueError> {
        let mut state = self.state.write().await;
        state.next_sequence += 1;
        job.sequence = state.next_sequence;
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionJob>, QueueError> {
        let mut state = self.state.write().await;

        let next = state
            .jobs
            .values()
            .filter(|job| job.is_claimable_at(now))
            .min_by_key(|job| ClaimKey::of(job))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let claimed = match state.jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::Running;
                job.lease_owner = Some(worker_id.to_string());
                job.started_at = Some(now);
                job.clone()
            }
            None => return Ok(None),
        };
        state.adjust_load(worker_id, 1);

        Ok(Some(claimed))
    }

    async fn transition(
        &self,
        id: JobId,
        guard: &LeaseGuard,
        transition: Transition,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;

        if job.status != JobStatus::Running
            || job.lease_owner.as_deref() != Some(guard.owner.as_str())
            || job.attempt != guard.attempt
        {
            return Ok(false);
        }

        match transition {
            Transition::Requeue {
                attempt,
                scheduled_for,
                error_class,
                error_message,
            } => {
                job.status = JobStatus::Queued;
                job.attempt = attempt;
                job.scheduled_for = scheduled_for;
                job.lease_owner = None;
                job.error_class = Some(error_class);
                job.error_message = Some(error_message);
            }
            Transition::Finish {
                status,
                result,
                error_class,
                error_message,
                finished_at,
            } => {
                job.status = status;
                job.lease_owner = None;
                job.result = result;
                job.error_class = error_class;
                job.error_message = error_message;
                job.finished_at = Some(finished_at);
            }
        }
        state.adjust_load(&guard.owner, -1);

        Ok(true)
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;
        if job.status != JobStatus::Queued {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(now);
        Ok(true)
    }

    async fn get_job(&self, id: JobId) -> Result<ExecutionJob, QueueError> {
        let state = self.state.read().await;
        state.jobs.get(&id).cloned().ok_or(QueueError::NotFound)
    }

    async fn list_jobs(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionJob>, QueueError> {
        let state = self.state.read().await;
        let mut jobs: Vec<ExecutionJob> = state
            .jobs
            .values()
            .filter(|job| job.user_id == user_id)
            .filter(|job| agent_id.is_none_or(|agent| job.agent_id == agent))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn finished_jobs_for_agent(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExecutionJob>, QueueError> {
        let state = self.state.read().await;
        let mut jobs: Vec<ExecutionJob> = state
            .jobs
            .values()
            .filter(|job| job.agent_id == agent_id && job.status.is_terminal())
            .filter(|job| job.finished_at.is_some_and(|at| at >= since))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.finished_at);
        Ok(jobs)
    }

    async fn upsert_worker(
        &self,
        worker_id: &str,
        capacity: u32,
        current_load: u32,
        now: DateTime<Utc>,
    ) -> Result<Worker, QueueError> {
        let mut state = self.state.write().await;
        let worker = state
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| Worker::new(worker_id, capacity, now));
        worker.capacity = capacity;
        worker.current_load = current_load;
        worker.last_heartbeat = now;
        worker.status = WorkerStatus::for_load(current_load);
        Ok(worker.clone())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, QueueError> {
        let state = self.state.read().await;
        let mut workers: Vec<Worker> = state.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn orphaned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExecutionJob>, QueueError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .filter(|job| {
                job.lease_owner
                    .as_ref()
                    .and_then(|owner| state.workers.get(owner))
                    .is_none_or(|worker| worker.last_heartbeat < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn mark_workers_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, QueueError> {
        let mut state = self.state.write().await;
        let mut marked = Vec::new();
        for worker in state.workers.values_mut() {
            if worker.last_heartbeat < cutoff && worker.status != WorkerStatus::Offline {
                worker.status = WorkerStatus::Offline;
                marked.push(worker.id.clone());
            }
        }
        Ok(marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{NewJob, TriggerType};
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn job(priority: u8, scheduled_for: DateTime<Utc>) -> ExecutionJob {
        let new = NewJob::new("agent", "user", TriggerType::Api, json!({})).with_priority(priority);
        ExecutionJob {
            id: Uuid::new_v4(),
            agent_id: new.agent_id,
            user_id: new.user_id,
            trigger_type: new.trigger_type,
            payload: new.payload,
            priority: new.priority,
            scheduled_for,
            attempt: 0,
            max_attempts: new.max_attempts,
            timeout_secs: 30,
            status: JobStatus::Queued,
            lease_owner: None,
            schedule_id: None,
            result: None,
            error_message: None,
            error_class: None,
            created_at: scheduled_for,
            started_at: None,
            finished_at: None,
            sequence: 0,
        }
    }

    #[tokio::test]
    async fn test_claim_respects_scheduled_for() {
        let queue = MemoryQueue::new();
        let now = Utc::now();
        queue.insert(job(5, now + Duration::seconds(30))).await.unwrap();

        assert!(queue.claim_next("w1", now).await.unwrap().is_none());
        let claimed = queue
            .claim_next("w1", now + Duration::seconds(31))
            .await
            .unwrap()
            .expect("Should have job");
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.lease_owner.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_ties_break_on_insertion_order() {
        let queue = MemoryQueue::new();
        let now = Utc::now();
        let first = queue.insert(job(5, now)).await.unwrap();
        let _second = queue.insert(job(5, now)).await.unwrap();

        let claimed = queue.claim_next("w1", now).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[tokio::test]
    async fn test_stale_guard_is_rejected() {
        let queue = MemoryQueue::new();
        let now = Utc::now();
        let inserted = queue.insert(job(5, now)).await.unwrap();
        queue.claim_next("w1", now).await.unwrap().unwrap();

        let stale = LeaseGuard {
            owner: "w2".to_string(),
            attempt: 0,
        };
        let finish = Transition::Finish {
            status: JobStatus::Completed,
            result: None,
            error_class: None,
            error_message: None,
            finished_at: now,
        };
        assert!(!queue.transition(inserted.id, &stale, finish).await.unwrap());
        assert_eq!(
            queue.get_job(inserted.id).await.unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn test_claim_and_transition_track_load() {
        let queue = MemoryQueue::new();
        let now = Utc::now();
        queue.upsert_worker("w1", 2, 0, now).await.unwrap();
        let inserted = queue.insert(job(5, now)).await.unwrap();

        queue.claim_next("w1", now).await.unwrap().unwrap();
        let workers = queue.list_workers().await.unwrap();
        assert_eq!(workers[0].current_load, 1);
        assert_eq!(workers[0].status, WorkerStatus::Busy);

        let guard = LeaseGuard {
            owner: "w1".to_string(),
            attempt: 0,
        };
        let finish = Transition::Finish {
            status: JobStatus::Completed,
            result: Some(json!({"ok": true})),
            error_class: None,
            error_message: None,
            finished_at: now,
        };
        assert!(queue.transition(inserted.id, &guard, finish).await.unwrap());
        let workers = queue.list_workers().await.unwrap();
        assert_eq!(workers[0].current_load, 0);
        assert_eq!(workers[0].status, WorkerStatus::Idle);
    }
}
