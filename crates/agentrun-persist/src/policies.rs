//! Per-agent retry policy overrides

use agentrun_queue::{ErrorClass, RetryPolicies, RetryPolicy};
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::backend::{parse_label, StorageError};

/// Stored as '' in the `error_class` column
const ANY_CLASS: &str = "";

/// Build a registry from every stored override on top of `default`
pub async fn load_retry_policies(
    pool: &SqlitePool,
    default: RetryPolicy,
) -> Result<RetryPolicies, StorageError> {
    let rows = sqlx::query(
        "SELECT agent_id, error_class, max_retries, backoff, initial_delay_ms, max_delay_ms, jitter \
         FROM retry_policies",
    )
    .fetch_all(pool)
    .await?;

    let policies = RetryPolicies::new(default);
    for row in &rows {
        let agent_id: String = row.try_get("agent_id")?;
        let class: String = row.try_get("error_class")?;
        let class = if class == ANY_CLASS {
            None
        } else {
            Some(parse_label::<ErrorClass>(&class)?)
        };
        let backoff: String = row.try_get("backoff")?;
        let policy = RetryPolicy {
            max_retries: row.try_get::<i64, _>("max_retries")? as u32,
            backoff: parse_label(&backoff)?,
            initial_delay: Duration::from_millis(row.try_get::<i64, _>("initial_delay_ms")?.max(0) as u64),
            max_delay: Duration::from_millis(row.try_get::<i64, _>("max_delay_ms")?.max(0) as u64),
            jitter: row.try_get("jitter")?,
        };
        policies.set(&agent_id, class, policy);
    }

    tracing::debug!(overrides = rows.len(), "Loaded retry policies");
    Ok(policies)
}

/// Insert or replace the override for (agent, class)
pub async fn save_retry_policy(
    pool: &SqlitePool,
    agent_id: &str,
    class: Option<ErrorClass>,
    policy: &RetryPolicy,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO retry_policies
            (agent_id, error_class, max_retries, backoff, initial_delay_ms, max_delay_ms, jitter)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (agent_id, error_class) DO UPDATE SET
            max_retries = excluded.max_retries,
            backoff = excluded.backoff,
            initial_delay_ms = excluded.initial_delay_ms,
            max_delay_ms = excluded.max_delay_ms,
            jitter = excluded.jitter
        "#,
    )
    .bind(agent_id)
    .bind(class.map(|c| c.as_str()).unwrap_or(ANY_CLASS))
    .bind(policy.max_retries as i64)
    .bind(policy.backoff.as_str())
    .bind(policy.initial_delay.as_millis() as i64)
    .bind(policy.max_delay.as_millis() as i64)
    .bind(policy.jitter)
    .execute(pool)
    .await?;
    Ok(())
}
