//! Opens the database and wires the SQLite stores into an execution queue

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use agentrun_persist::{
    connect, load_retry_policies, SqliteConfig, SqliteCredentialVault, SqliteDirectory,
    SqliteHistoryStore, SqliteQueueBackend, SqliteRateLimitBackend, SqliteScheduleStore,
};
use agentrun_queue::{
    Clock, ExecutionQueue, HistoryRecorder, RateLimiter, RateLimits, RetryPolicy, SystemClock,
};

pub struct Database {
    url: String,
}

impl Database {
    pub fn new(url: String) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn config(&self) -> SqliteConfig {
        let mut config = SqliteConfig::from_env();
        if self.url.contains(":memory:") {
            config = SqliteConfig::memory();
        }
        config.url = self.url.clone();
        config
    }

    pub async fn pool(&self) -> Result<SqlitePool> {
        connect(&self.config())
            .await
            .with_context(|| format!("Failed to open database {}", self.url))
    }

    /// Full queue: needs `AGENTRUN_VAULT_KEY` to resolve credentials
    pub async fn queue(&self) -> Result<Arc<ExecutionQueue>> {
        let pool = self.pool().await?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let vault = SqliteCredentialVault::from_env(pool.clone())
            .context("Credential vault unavailable")?;
        let policies = load_retry_policies(&pool, RetryPolicy::default()).await?;

        let queue = ExecutionQueue::builder(
            Arc::new(SqliteQueueBackend::new(pool.clone())),
            Arc::new(SqliteDirectory::new(pool.clone())),
            Arc::new(vault),
        )
        .clock(clock.clone())
        .rate_limiter(RateLimiter::new(
            Arc::new(SqliteRateLimitBackend::new(pool.clone())),
            RateLimits::default(),
            clock,
        ))
        .retry_policies(Arc::new(policies))
        .history_store(Arc::new(SqliteHistoryStore::new(pool.clone())))
        .schedules(Arc::new(SqliteScheduleStore::new(pool)))
        .build();
        Ok(Arc::new(queue))
    }

    /// Read side of history only; works without the vault key
    pub async fn history(&self) -> Result<HistoryRecorder> {
        let pool = self.pool().await?;
        Ok(HistoryRecorder::new(
            Arc::new(SqliteHistoryStore::new(pool.clone())),
            Arc::new(SqliteQueueBackend::new(pool)),
        ))
    }
}
