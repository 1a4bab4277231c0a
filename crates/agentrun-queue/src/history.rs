//! Execution history: append-only phase log plus read-side summaries

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::backend::{QueueBackend, QueueError};
use crate::job::{ErrorClass, ExecutionJob, JobId, JobStatus, ParseLabelError, TriggerType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Dispatching,
    AwaitingResponse,
    Completed,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Dispatching => "dispatching",
            Self::AwaitingResponse => "awaiting_response",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "dispatching" => Ok(Self::Dispatching),
            "awaiting_response" => Ok(Self::AwaitingResponse),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(ParseLabelError::new("history phase", other)),
        }
    }
}

/// One append-only history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: JobId,
    pub agent_id: String,
    pub user_id: String,
    /// Failed attempts before the one this entry belongs to
    pub attempt: u32,
    pub phase: Phase,
    pub duration_ms: Option<u64>,
    pub log_lines: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn for_job(job: &ExecutionJob, phase: Phase, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            agent_id: job.agent_id.clone(),
            user_id: job.user_id.clone(),
            attempt: job.attempt,
            phase,
            duration_ms: None,
            log_lines: Vec::new(),
            timestamp,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.log_lines.push(line.into());
        self
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: HistoryEntry) -> Result<(), QueueError>;

    /// Entries of one job in write order
    async fn entries_for_job(&self, job_id: JobId) -> Result<Vec<HistoryEntry>, QueueError>;
}

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: RwLock<Vec<HistoryEntry>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<(), QueueError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn entries_for_job(&self, job_id: JobId) -> Result<Vec<HistoryEntry>, QueueError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}

/// Dashboard view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub agent_id: String,
    pub user_id: String,
    pub trigger_type: TriggerType,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub priority: u8,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl From<&ExecutionJob> for JobSummary {
    fn from(job: &ExecutionJob) -> Self {
        Self {
            job_id: job.id,
            agent_id: job.agent_id.clone(),
            user_id: job.user_id.clone(),
            trigger_type: job.trigger_type,
            status: job.status,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            priority: job.priority,
            error_class: job.error_class,
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            duration_ms: job.duration_ms(),
        }
    }
}

/// Per-UTC-day analytics for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRollup {
    pub day: NaiveDate,
    pub total_runs: u64,
    pub successful_runs: u64,
    /// Includes timed-out runs
    pub failed_runs: u64,
    pub unique_users: u64,
    pub avg_duration_ms: f64,
}

/// Group terminal, non-cancelled jobs by the UTC day they finished
pub fn rollup_by_day(jobs: &[ExecutionJob]) -> Vec<DailyRollup> {
    #[derive(Default)]
    struct Acc<'a> {
        total: u64,
        ok: u64,
        failed: u64,
        users: HashSet<&'a str>,
        duration_sum: i64,
        duration_n: u64,
    }

    let mut days: BTreeMap<NaiveDate, Acc<'_>> = BTreeMap::new();
    for job in jobs {
        if !job.status.is_terminal() || job.status == JobStatus::Cancelled {
            continue;
        }
        let Some(finished) = job.finished_at else {
            continue;
        };
        let acc = days.entry(finished.date_naive()).or_default();
        acc.total += 1;
        match job.status {
            JobStatus::Completed => acc.ok += 1,
            _ => acc.failed += 1,
        }
        acc.users.insert(job.user_id.as_str());
        if let Some(ms) = job.duration_ms() {
            acc.duration_sum += ms;
            acc.duration_n += 1;
        }
    }

    days.into_iter()
        .map(|(day, acc)| DailyRollup {
            day,
            total_runs: acc.total,
            successful_runs: acc.ok,
            failed_runs: acc.failed,
            unique_users: acc.users.len() as u64,
            avg_duration_ms: if acc.duration_n == 0 {
                0.0
            } else {
                acc.duration_sum as f64 / acc.duration_n as f64
            },
        })
        .collect()
}

/// Write side (phase entries) and read side (summaries, rollups) of execution history
#[derive(Clone)]
pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
    backend: Arc<dyn QueueBackend>,
}

impl fmt::Debug for HistoryRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryRecorder").finish_non_exhaustive()
    }
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>, backend: Arc<dyn QueueBackend>) -> Self {
        Self { store, backend }
    }

    /// Append an entry. History is best-effort: a failed write is logged, never
    /// surfaced to the job's state machine.
    pub async fn record(&self, entry: HistoryEntry) {
        let job_id = entry.job_id;
        let phase = entry.phase;
        if let Err(e) = self.store.append(entry).await {
            warn!(job_id = %job_id, phase = %phase, error = %e, "Failed to record history entry");
        }
    }

    pub async fn entries_for_job(&self, job_id: JobId) -> Result<Vec<HistoryEntry>, QueueError> {
        self.store.entries_for_job(job_id).await
    }

    /// Most recent jobs of a user, optionally narrowed to one agent
    pub async fn get_execution_history(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<JobSummary>, QueueError> {
        let jobs = self.backend.list_jobs(user_id, agent_id, limit).await?;
        Ok(jobs.iter().map(JobSummary::from).collect())
    }

    pub async fn daily_rollups(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DailyRollup>, QueueError> {
        let jobs = self.backend.finished_jobs_for_agent(agent_id, since).await?;
        Ok(rollup_by_day(&jobs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use uuid::Uuid;

    fn finished(user: &str, status: JobStatus, at: DateTime<Utc>, took_ms: i64) -> ExecutionJob {
        ExecutionJob {
            id: Uuid::new_v4(),
            agent_id: "agent".to_string(),
            user_id: user.to_string(),
            trigger_type: TriggerType::Api,
            payload: json!({}),
            priority: 5,
            scheduled_for: at,
            attempt: 0,
            max_attempts: 3,
            timeout_secs: 30,
            status,
            lease_owner: None,
            schedule_id: None,
            result: None,
            error_message: None,
            error_class: None,
            created_at: at,
            started_at: Some(at - Duration::milliseconds(took_ms)),
            finished_at: Some(at),
            sequence: 0,
        }
    }

    #[test]
    fn test_rollup_by_day() {
        let day1 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap();
        let jobs = vec![
            finished("alice", JobStatus::Completed, day1, 100),
            finished("bob", JobStatus::Failed, day1, 300),
            finished("alice", JobStatus::TimedOut, day1, 200),
            finished("alice", JobStatus::Cancelled, day1, 0),
            finished("carol", JobStatus::Completed, day2, 50),
        ];

        let rollups = rollup_by_day(&jobs);
        assert_eq!(rollups.len(), 2);
        assert_eq!(rollups[0].day, day1.date_naive());
        assert_eq!(rollups[0].total_runs, 3);
        assert_eq!(rollups[0].successful_runs, 1);
        assert_eq!(rollups[0].failed_runs, 2);
        assert_eq!(rollups[0].unique_users, 2);
        assert!((rollups[0].avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(rollups[1].total_runs, 1);
    }

    #[tokio::test]
    async fn test_entries_keep_write_order() {
        let store = MemoryHistoryStore::new();
        let job = finished("alice", JobStatus::Completed, Utc::now(), 10);
        for phase in [Phase::Init, Phase::Dispatching, Phase::Completed] {
            store
                .append(HistoryEntry::for_job(&job, phase, Utc::now()))
                .await
                .unwrap();
        }
        let phases: Vec<Phase> = store
            .entries_for_job(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.phase)
            .collect();
        assert_eq!(phases, vec![Phase::Init, Phase::Dispatching, Phase::Completed]);
    }
}
