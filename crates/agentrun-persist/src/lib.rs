//! # AgentRun Persistence
//!
//! SQLite implementations of the runtime's storage seams:
//! - [`SqliteQueueBackend`] for jobs and worker leases
//! - [`SqliteHistoryStore`] for the execution audit trail
//! - [`SqliteScheduleStore`] for cron schedules
//! - [`SqliteRateLimitBackend`] for windowed counters
//! - [`SqliteDirectory`] and [`SqliteCredentialVault`] for agents and their secrets
//!
//! All stores share one pool opened by [`connect`], which also runs the
//! embedded migrations.

pub mod backend;
pub mod directory;
pub mod history;
pub mod policies;
pub mod queue;
pub mod rate_limit;
pub mod schedules;
pub mod sqlite;
pub mod vault;

pub use backend::StorageError;
pub use directory::SqliteDirectory;
pub use history::SqliteHistoryStore;
pub use policies::{load_retry_policies, save_retry_policy};
pub use queue::SqliteQueueBackend;
pub use rate_limit::SqliteRateLimitBackend;
pub use schedules::SqliteScheduleStore;
pub use sqlite::{connect, SqliteConfig};
pub use vault::SqliteCredentialVault;
