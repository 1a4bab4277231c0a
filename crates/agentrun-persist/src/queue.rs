//! Durable queue backend using SQLite

use agentrun_queue::{
    ExecutionJob, JobId, LeaseGuard, QueueBackend, QueueError, Transition, Worker,
    WorkerStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{from_millis, from_millis_opt, parse_label, to_millis, StorageError};

const JOB_COLUMNS: &str = "seq, id, agent_id, user_id, trigger_type, payload, priority, \
    scheduled_for, attempt, max_attempts, timeout_secs, status, lease_owner, schedule_id, \
    result, error_message, error_class, created_at, started_at, finished_at";

fn job_from_row(row: &SqliteRow) -> Result<ExecutionJob, StorageError> {
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let result: Option<String> = row.try_get("result")?;
    let schedule_id: Option<String> = row.try_get("schedule_id")?;
    let error_class: Option<String> = row.try_get("error_class")?;
    let trigger_type: String = row.try_get("trigger_type")?;
    let status: String = row.try_get("status")?;

    Ok(ExecutionJob {
        id: Uuid::parse_str(&id).map_err(|e| StorageError::Serialization(e.to_string()))?,
        agent_id: row.try_get("agent_id")?,
        user_id: row.try_get("user_id")?,
        trigger_type: parse_label(&trigger_type)?,
        payload: serde_json::from_str(&payload)?,
        priority: row.try_get::<i64, _>("priority")? as u8,
        scheduled_for: from_millis(row.try_get("scheduled_for")?)?,
        attempt: row.try_get::<i64, _>("attempt")? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
        timeout_secs: row.try_get::<i64, _>("timeout_secs")? as u64,
        status: parse_label(&status)?,
        lease_owner: row.try_get("lease_owner")?,
        schedule_id: schedule_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        error_message: row.try_get("error_message")?,
        error_class: error_class.map(|c| parse_label(&c)).transpose()?,
        created_at: from_millis(row.try_get("created_at")?)?,
        started_at: from_millis_opt(row.try_get("started_at")?)?,
        finished_at: from_millis_opt(row.try_get("finished_at")?)?,
        sequence: row.try_get::<i64, _>("seq")? as u64,
    })
}

fn worker_from_row(row: &SqliteRow) -> Result<Worker, StorageError> {
    let status: String = row.try_get("status")?;
    Ok(Worker {
        id: row.try_get("id")?,
        capacity: row.try_get::<i64, _>("capacity")? as u32,
        current_load: row.try_get::<i64, _>("current_load")? as u32,
        last_heartbeat: from_millis(row.try_get("last_heartbeat")?)?,
        status: parse_label(&status)?,
    })
}

/// Durable queue backend using SQLite.
///
/// Several processes may share one database file; claim and completion are
/// single conditional `UPDATE` statements, so the database arbitrates races.
#[derive(Debug, Clone)]
pub struct SqliteQueueBackend {
    pool: SqlitePool,
}

impl SqliteQueueBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl QueueBackend for SqliteQueueBackend {
    async fn insert(&self, mut job: ExecutionJob) -> Result<ExecutionJob, QueueError> {
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, agent_id, user_id, trigger_type, payload, priority,
                scheduled_for, attempt, max_attempts, timeout_secs, status, lease_owner,
                schedule_id, result, error_message, error_class, created_at, started_at,
                finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING seq
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.agent_id)
        .bind(&job.user_id)
        .bind(job.trigger_type.as_str())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(job.priority as i64)
        .bind(to_millis(job.scheduled_for))
        .bind(job.attempt as i64)
        .bind(job.max_attempts as i64)
        .bind(job.timeout_secs as i64)
        .bind(job.status.as_str())
        .bind(&job.lease_owner)
        .bind(job.schedule_id.map(|id| id.to_string()))
        .bind(result)
        .bind(&job.error_message)
        .bind(job.error_class.map(|c| c.as_str()))
        .bind(to_millis(job.created_at))
        .bind(job.started_at.map(to_millis))
        .bind(job.finished_at.map(to_millis))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        job.sequence = row
            .try_get::<i64, _>("seq")
            .map_err(|e| QueueError::Backend(e.to_string()))? as u64;
        Ok(job)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionJob>, QueueError> {
        let now_ms = to_millis(now);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                lease_owner = ?,
                started_at = ?
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE status = 'queued'
                  AND scheduled_for <= ?
                  AND attempt < max_attempts
                ORDER BY priority ASC, scheduled_for ASC, seq ASC
                LIMIT 1
            )
            AND status = 'queued'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(worker_id)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;
            return Ok(None);
        };
        let job = job_from_row(&row)?;

        sqlx::query(
            r#"
            UPDATE workers
            SET current_load = current_load + 1,
                status = CASE WHEN status = 'offline' THEN status ELSE 'busy' END
            WHERE id = ?
            "#,
        )
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        debug!(job_id = %job.id, worker_id = %worker_id, "Claimed job row");
        Ok(Some(job))
    }

    async fn transition(
        &self,
        id: JobId,
        guard: &LeaseGuard,
        transition: Transition,
    ) -> Result<bool, QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let updated = match transition {
            Transition::Requeue {
                attempt,
                scheduled_for,
                error_class,
                error_message,
            } => sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'queued',
                    attempt = ?,
                    scheduled_for = ?,
                    lease_owner = NULL,
                    error_class = ?,
                    error_message = ?
                WHERE id = ? AND status = 'running' AND lease_owner = ? AND attempt = ?
                "#,
            )
            .bind(attempt as i64)
            .bind(to_millis(scheduled_for))
            .bind(error_class.as_str())
            .bind(error_message)
            .bind(id.to_string())
            .bind(&guard.owner)
            .bind(guard.attempt as i64)
            .execute(&mut *tx)
            .await,
            Transition::Finish {
                status,
                result,
                error_class,
                error_message,
                finished_at,
            } => {
                let result = result.as_ref().map(serde_json::to_string).transpose()?;
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = ?,
                        lease_owner = NULL,
                        result = ?,
                        error_class = ?,
                        error_message = ?,
                        finished_at = ?
                    WHERE id = ? AND status = 'running' AND lease_owner = ? AND attempt = ?
                    "#,
                )
                .bind(status.as_str())
                .bind(result)
                .bind(error_class.map(|c| c.as_str()))
                .bind(error_message)
                .bind(to_millis(finished_at))
                .bind(id.to_string())
                .bind(&guard.owner)
                .bind(guard.attempt as i64)
                .execute(&mut *tx)
                .await
            }
        }
        .map_err(|e| QueueError::Backend(e.to_string()))?
        .rows_affected();

        if updated == 0 {
            tx.rollback()
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;
            let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;
            return match exists {
                Some(_) => Ok(false),
                None => Err(QueueError::NotFound),
            };
        }

        sqlx::query(
            r#"
            UPDATE workers
            SET current_load = MAX(current_load - 1, 0),
                status = CASE
                    WHEN status = 'offline' THEN status
                    WHEN current_load - 1 <= 0 THEN 'idle'
                    ELSE 'busy'
                END
            WHERE id = ?
            "#,
        )
        .bind(&guard.owner)
        .execute(&mut *tx)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(true)
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', finished_at = ? WHERE id = ? AND status = 'queued'",
        )
        .bind(to_millis(now))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish "wrong state" from "no such job"
        self.get_job(id).await.map(|_| false)
    }

    async fn get_job(&self, id: JobId) -> Result<ExecutionJob, QueueError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?
            .ok_or(QueueError::NotFound)?;
        Ok(job_from_row(&row)?)
    }

    async fn list_jobs(
        &self,
        user_id: &str,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionJob>, QueueError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE user_id = ? AND (? IS NULL OR agent_id = ?)
            ORDER BY seq DESC
            LIMIT ?
            "#,
            JOB_COLUMNS
        ))
        .bind(user_id)
        .bind(agent_id)
        .bind(agent_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| job_from_row(row).map_err(QueueError::from))
            .collect()
    }

    async fn finished_jobs_for_agent(
        &self,
        agent_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ExecutionJob>, QueueError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE agent_id = ?
              AND status IN ('completed', 'failed', 'timed_out', 'cancelled')
              AND finished_at >= ?
            ORDER BY finished_at ASC
            "#,
            JOB_COLUMNS
        ))
        .bind(agent_id)
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| job_from_row(row).map_err(QueueError::from))
            .collect()
    }

    async fn upsert_worker(
        &self,
        worker_id: &str,
        capacity: u32,
        current_load: u32,
        now: DateTime<Utc>,
    ) -> Result<Worker, QueueError> {
        let status = WorkerStatus::for_load(current_load);
        sqlx::query(
            r#"
            INSERT INTO workers (id, capacity, current_load, last_heartbeat, status)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                capacity = excluded.capacity,
                current_load = excluded.current_load,
                last_heartbeat = excluded.last_heartbeat,
                status = excluded.status
            "#,
        )
        .bind(worker_id)
        .bind(capacity as i64)
        .bind(current_load as i64)
        .bind(to_millis(now))
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(Worker {
            id: worker_id.to_string(),
            capacity,
            current_load,
            last_heartbeat: from_millis(to_millis(now))?,
            status,
        })
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, QueueError> {
        let rows = sqlx::query(
            "SELECT id, capacity, current_load, last_heartbeat, status FROM workers ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| worker_from_row(row).map_err(QueueError::from))
            .collect()
    }

    async fn orphaned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExecutionJob>, QueueError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE status = 'running'
              AND (
                lease_owner IS NULL
                OR lease_owner NOT IN (SELECT id FROM workers WHERE last_heartbeat >= ?)
              )
            ORDER BY seq
            "#,
            JOB_COLUMNS
        ))
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| job_from_row(row).map_err(QueueError::from))
            .collect()
    }

    async fn mark_workers_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE workers SET status = 'offline'
            WHERE last_heartbeat < ? AND status != 'offline'
            RETURNING id
            "#,
        )
        .bind(to_millis(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("id")
                    .map_err(|e| QueueError::Backend(e.to_string()))
            })
            .collect()
    }
}
