//! Agent catalogue and installations in SQLite

use agentrun_queue::{AgentDirectory, AgentRecord, DirectoryError, RateLimits};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::backend::{to_millis, StorageError};

fn agent_from_row(row: &SqliteRow) -> Result<AgentRecord, StorageError> {
    let required_fields: String = row.try_get("required_fields")?;
    let rate_limits: Option<String> = row.try_get("rate_limits")?;
    Ok(AgentRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        webhook_url: row.try_get("webhook_url")?,
        active: row.try_get("active")?,
        required_fields: serde_json::from_str(&required_fields)?,
        default_timeout_secs: row
            .try_get::<Option<i64>, _>("default_timeout_secs")?
            .map(|secs| secs.max(0) as u64),
        rate_limits: rate_limits
            .map(|raw| serde_json::from_str::<RateLimits>(&raw))
            .transpose()?,
    })
}

#[derive(Debug, Clone)]
pub struct SqliteDirectory {
    pool: SqlitePool,
}

impl SqliteDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace an agent definition
    pub async fn register_agent(&self, agent: &AgentRecord) -> Result<(), StorageError> {
        let rate_limits = agent
            .rate_limits
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO agents (id, name, webhook_url, active, required_fields, default_timeout_secs, rate_limits)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                webhook_url = excluded.webhook_url,
                active = excluded.active,
                required_fields = excluded.required_fields,
                default_timeout_secs = excluded.default_timeout_secs,
                rate_limits = excluded.rate_limits
            "#,
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(&agent.webhook_url)
        .bind(agent.active)
        .bind(serde_json::to_string(&agent.required_fields)?)
        .bind(agent.default_timeout_secs.map(|secs| secs as i64))
        .bind(rate_limits)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_active(&self, agent_id: &str, active: bool) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE agents SET active = ? WHERE id = ?")
            .bind(active)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, name, webhook_url, active, required_fields, default_timeout_secs, rate_limits \
             FROM agents ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(agent_from_row).collect()
    }

    pub async fn install(
        &self,
        agent_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO installations (agent_id, user_id, installed_at) VALUES (?, ?, ?)
            ON CONFLICT (agent_id, user_id) DO NOTHING
            "#,
        )
        .bind(agent_id)
        .bind(user_id)
        .bind(to_millis(at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn uninstall(&self, agent_id: &str, user_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM installations WHERE agent_id = ? AND user_id = ?")
            .bind(agent_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AgentDirectory for SqliteDirectory {
    async fn agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, DirectoryError> {
        let row = sqlx::query(
            "SELECT id, name, webhook_url, active, required_fields, default_timeout_secs, rate_limits \
             FROM agents WHERE id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(row.as_ref().map(agent_from_row).transpose()?)
    }

    async fn is_entitled(&self, agent_id: &str, user_id: &str) -> Result<bool, DirectoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM installations WHERE agent_id = ? AND user_id = ?",
        )
        .bind(agent_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::from)?;
        Ok(count > 0)
    }
}
