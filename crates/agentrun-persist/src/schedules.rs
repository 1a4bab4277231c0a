//! Cron schedules in SQLite

use agentrun_queue::{Schedule, ScheduleError, ScheduleStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::backend::{from_millis, from_millis_opt, to_millis, StorageError};

const SCHEDULE_COLUMNS: &str = "id, agent_id, user_id, cron_expression, timezone, payload, \
    priority, next_run, last_run, consecutive_failures, max_consecutive_failures, active, created_at";

fn schedule_from_row(row: &SqliteRow) -> Result<Schedule, StorageError> {
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    Ok(Schedule {
        id: Uuid::parse_str(&id).map_err(|e| StorageError::Serialization(e.to_string()))?,
        agent_id: row.try_get("agent_id")?,
        user_id: row.try_get("user_id")?,
        cron_expression: row.try_get("cron_expression")?,
        timezone: row.try_get("timezone")?,
        payload: serde_json::from_str(&payload)?,
        priority: row.try_get::<i64, _>("priority")? as u8,
        next_run: from_millis(row.try_get("next_run")?)?,
        last_run: from_millis_opt(row.try_get("last_run")?)?,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
        max_consecutive_failures: row.try_get::<i64, _>("max_consecutive_failures")? as u32,
        active: row.try_get("active")?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

#[derive(Debug, Clone)]
pub struct SqliteScheduleStore {
    pool: SqlitePool,
}

impl SqliteScheduleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Schedule>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM schedules WHERE id = ?",
            SCHEDULE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn insert(&self, schedule: Schedule) -> Result<(), ScheduleError> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, agent_id, user_id, cron_expression, timezone, payload,
                priority, next_run, last_run, consecutive_failures, max_consecutive_failures,
                active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(schedule.id.to_string())
        .bind(&schedule.agent_id)
        .bind(&schedule.user_id)
        .bind(&schedule.cron_expression)
        .bind(&schedule.timezone)
        .bind(serde_json::to_string(&schedule.payload).map_err(StorageError::from)?)
        .bind(schedule.priority as i64)
        .bind(to_millis(schedule.next_run))
        .bind(schedule.last_run.map(to_millis))
        .bind(schedule.consecutive_failures as i64)
        .bind(schedule.max_consecutive_failures as i64)
        .bind(schedule.active)
        .bind(to_millis(schedule.created_at))
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Schedule>, ScheduleError> {
        Ok(self.fetch(id).await?)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Schedule>, ScheduleError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM schedules WHERE user_id = ? ORDER BY created_at",
            SCHEDULE_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(rows
            .iter()
            .map(schedule_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, ScheduleError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM schedules WHERE active = 1 AND next_run <= ? ORDER BY next_run",
            SCHEDULE_COLUMNS
        ))
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(rows
            .iter()
            .map(schedule_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn mark_fired(
        &self,
        id: Uuid,
        expected_next_run: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let result = sqlx::query(
            r#"
            UPDATE schedules SET last_run = ?, next_run = ?
            WHERE id = ? AND active = 1 AND next_run = ?
            "#,
        )
        .bind(to_millis(fired_at))
        .bind(to_millis(next_run))
        .bind(id.to_string())
        .bind(to_millis(expected_next_run))
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        succeeded: bool,
    ) -> Result<Option<Schedule>, ScheduleError> {
        // Single statement so concurrent completions cannot lose an increment
        let result = if succeeded {
            sqlx::query("UPDATE schedules SET consecutive_failures = 0 WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool)
                .await
        } else {
            sqlx::query(
                r#"
                UPDATE schedules
                SET consecutive_failures = consecutive_failures + 1,
                    active = CASE
                        WHEN consecutive_failures + 1 >= max_consecutive_failures THEN 0
                        ELSE active
                    END
                WHERE id = ?
                "#,
            )
            .bind(id.to_string())
            .execute(&self.pool)
            .await
        }
        .map_err(StorageError::from)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let schedule = self.fetch(id).await?;
        if let Some(s) = &schedule {
            if !succeeded && !s.active && s.consecutive_failures == s.max_consecutive_failures {
                tracing::warn!(
                    schedule_id = %s.id,
                    agent_id = %s.agent_id,
                    failures = s.consecutive_failures,
                    "Schedule disabled after consecutive failures"
                );
            }
        }
        Ok(schedule)
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool, ScheduleError> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET active = ?,
                consecutive_failures = CASE WHEN ? THEN 0 ELSE consecutive_failures END
            WHERE id = ?
            "#,
        )
        .bind(active)
        .bind(active)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(result.rows_affected() == 1)
    }
}
