//! Rate-limit counters in SQLite
//!
//! Reservation runs inside a `BEGIN IMMEDIATE` transaction so the
//! read-evaluate-write cycle holds the database write lock for its whole
//! duration.

use agentrun_queue::rate_limit::reserve;
use agentrun_queue::{QueueError, RateDecision, RateLimitBackend, RateLimitCounter, RateLimits};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::backend::{from_millis, parse_label, to_millis, StorageError};

fn counter_from_row(row: &SqliteRow) -> Result<RateLimitCounter, StorageError> {
    let window: String = row.try_get("limit_window")?;
    Ok(RateLimitCounter {
        agent_id: row.try_get("agent_id")?,
        user_id: row.try_get("user_id")?,
        window: parse_label(&window)?,
        count: row.try_get::<i64, _>("count")? as u32,
        limit: row.try_get::<i64, _>("limit_value")? as u32,
        window_reset_at: from_millis(row.try_get("window_reset_at")?)?,
        exceeded_count: row.try_get::<i64, _>("exceeded_count")? as u64,
    })
}

async fn load_counters(
    conn: &mut SqliteConnection,
    agent_id: &str,
    user_id: &str,
) -> Result<Vec<RateLimitCounter>, StorageError> {
    let rows = sqlx::query(
        r#"
        SELECT agent_id, user_id, limit_window, count, limit_value, window_reset_at, exceeded_count
        FROM rate_limit_counters
        WHERE agent_id = ? AND user_id = ?
        "#,
    )
    .bind(agent_id)
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(counter_from_row).collect()
}

async fn store_counters(
    conn: &mut SqliteConnection,
    counters: &[RateLimitCounter],
) -> Result<(), StorageError> {
    for counter in counters {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_counters
                (agent_id, user_id, limit_window, count, limit_value, window_reset_at, exceeded_count)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (agent_id, user_id, limit_window) DO UPDATE SET
                count = excluded.count,
                limit_value = excluded.limit_value,
                window_reset_at = excluded.window_reset_at,
                exceeded_count = excluded.exceeded_count
            "#,
        )
        .bind(&counter.agent_id)
        .bind(&counter.user_id)
        .bind(counter.window.as_str())
        .bind(counter.count as i64)
        .bind(counter.limit as i64)
        .bind(to_millis(counter.window_reset_at))
        .bind(counter.exceeded_count as i64)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SqliteRateLimitBackend {
    pool: SqlitePool,
}

impl SqliteRateLimitBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn reserve_locked(
        conn: &mut SqliteConnection,
        agent_id: &str,
        user_id: &str,
        limits: &RateLimits,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, StorageError> {
        let mut counters = load_counters(conn, agent_id, user_id).await?;
        let decision = reserve(&mut counters, agent_id, user_id, limits, now);
        store_counters(conn, &counters).await?;
        Ok(decision)
    }
}

#[async_trait]
impl RateLimitBackend for SqliteRateLimitBackend {
    async fn check_and_reserve(
        &self,
        agent_id: &str,
        user_id: &str,
        limits: &RateLimits,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, QueueError> {
        // Dropping the transaction (cancelled future, failed commit) rolls it back
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let decision = Self::reserve_locked(&mut tx, agent_id, user_id, limits, now).await?;
        tx.commit()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(decision)
    }

    async fn counters(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<Vec<RateLimitCounter>, QueueError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(load_counters(&mut conn, agent_id, user_id).await?)
    }
}
