//! Storage error types and row conversion helpers

use agentrun_queue::{CredentialError, DirectoryError, QueueError, ScheduleError};
use chrono::{DateTime, TimeZone, Utc};

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Query(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<StorageError> for QueueError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(_) => QueueError::NotFound,
            other => QueueError::Backend(other.to_string()),
        }
    }
}

impl From<StorageError> for ScheduleError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(_) => ScheduleError::NotFound,
            other => ScheduleError::Backend(other.to_string()),
        }
    }
}

impl From<StorageError> for DirectoryError {
    fn from(e: StorageError) -> Self {
        DirectoryError::Backend(e.to_string())
    }
}

impl From<StorageError> for CredentialError {
    fn from(e: StorageError) -> Self {
        CredentialError::Backend(e.to_string())
    }
}

/// Timestamps are stored as integer epoch milliseconds
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StorageError::Serialization(format!("invalid timestamp: {}", ms)))
}

pub(crate) fn from_millis_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StorageError> {
    ms.map(from_millis).transpose()
}

/// Parse a stored enum label
pub(crate) fn parse_label<T>(raw: &str) -> Result<T, StorageError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| StorageError::Serialization(e.to_string()))
}
