//! Append-only execution history in SQLite

use agentrun_queue::{HistoryEntry, HistoryStore, JobId, QueueError};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::backend::{from_millis, parse_label, to_millis, StorageError};

fn entry_from_row(row: &SqliteRow) -> Result<HistoryEntry, StorageError> {
    let job_id: String = row.try_get("job_id")?;
    let phase: String = row.try_get("phase")?;
    let log_lines: String = row.try_get("log_lines")?;
    Ok(HistoryEntry {
        job_id: Uuid::parse_str(&job_id).map_err(|e| StorageError::Serialization(e.to_string()))?,
        agent_id: row.try_get("agent_id")?,
        user_id: row.try_get("user_id")?,
        attempt: row.try_get::<i64, _>("attempt")? as u32,
        phase: parse_label(&phase)?,
        duration_ms: row
            .try_get::<Option<i64>, _>("duration_ms")?
            .map(|ms| ms.max(0) as u64),
        log_lines: serde_json::from_str(&log_lines)?,
        timestamp: from_millis(row.try_get("recorded_at")?)?,
    })
}

#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO execution_history
                (job_id, agent_id, user_id, attempt, phase, duration_ms, log_lines, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.job_id.to_string())
        .bind(&entry.agent_id)
        .bind(&entry.user_id)
        .bind(entry.attempt as i64)
        .bind(entry.phase.as_str())
        .bind(entry.duration_ms.map(|ms| ms as i64))
        .bind(serde_json::to_string(&entry.log_lines)?)
        .bind(to_millis(entry.timestamp))
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn entries_for_job(&self, job_id: JobId) -> Result<Vec<HistoryEntry>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, agent_id, user_id, attempt, phase, duration_ms, log_lines, recorded_at
            FROM execution_history
            WHERE job_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| entry_from_row(row).map_err(QueueError::from))
            .collect()
    }
}
