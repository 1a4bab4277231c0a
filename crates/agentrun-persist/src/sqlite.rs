//! SQLite connection setup

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::backend::StorageError;

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:agentrun.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Enable foreign key enforcement
    pub foreign_keys: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:agentrun.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            foreign_keys: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            foreign_keys: true,
            busy_timeout_secs: 5,
        }
    }

    /// File-backed database at `path`, created if missing
    pub fn file(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            url: format!("sqlite:{}?mode=rwc", path.as_ref().display()),
            ..Self::default()
        }
    }

    /// Load from `AGENTRUN_DATABASE_URL`, `AGENTRUN_DB_MAX_CONNECTIONS`,
    /// `AGENTRUN_DB_BUSY_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let url = std::env::var("AGENTRUN_DATABASE_URL").unwrap_or(defaults.url);
        let in_memory = url.contains(":memory:");
        Self {
            max_connections: std::env::var("AGENTRUN_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(if in_memory { 1 } else { defaults.max_connections }),
            busy_timeout_secs: std::env::var("AGENTRUN_DB_BUSY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.busy_timeout_secs),
            wal_mode: !in_memory,
            foreign_keys: defaults.foreign_keys,
            url,
        }
    }
}

/// Open a pool, apply pragmas and run embedded migrations
pub async fn connect(config: &SqliteConfig) -> Result<SqlitePool, StorageError> {
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| StorageError::Connection(e.to_string()))?
        .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

    if config.foreign_keys {
        options = options.pragma("foreign_keys", "ON");
    }
    if config.wal_mode {
        options = options.pragma("journal_mode", "WAL");
    }

    let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
    if config.url.contains(":memory:") {
        // Every connection to :memory: is a separate database; keep the one we migrate
        pool_options = pool_options.min_connections(1).idle_timeout(None).max_lifetime(None);
    }

    let pool = pool_options
        .connect_with(options)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StorageError::Internal(format!("Migration failed: {}", e)))?;

    info!(
        url = %config.url,
        wal = config.wal_mode,
        max_connections = config.max_connections,
        "Connected to SQLite"
    );

    Ok(pool)
}
