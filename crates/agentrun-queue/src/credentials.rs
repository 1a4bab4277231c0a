//! Credential resolution boundary
//!
//! Secrets are looked up per (agent, user, field), only at admission (presence
//! check) and at dispatch (values injected into the webhook payload). They are
//! never written to a job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use crate::clock::{Clock, SystemClock};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Absent, inactive or expired
    #[error("Missing credential: {0}")]
    Missing(String),
    #[error("Credential backend error: {0}")]
    Backend(String),
    #[error("Credential decryption failed for field {0}")]
    Decryption(String),
}

/// Resolved secret values, wiped from memory on drop
#[derive(Default, Clone)]
pub struct CredentialBundle {
    values: BTreeMap<String, Zeroizing<String>>,
}

impl CredentialBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.values.insert(field.into(), Zeroizing::new(value.into()));
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(|v| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

}

/// Serializes as a `field -> secret` map straight from the wiped buffers
impl Serialize for CredentialBundle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.values.iter().map(|(field, value)| (field, value.as_str())))
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Every field in `fields` must have an active, unexpired value
    async fn resolve(
        &self,
        agent_id: &str,
        user_id: &str,
        fields: &[String],
    ) -> Result<CredentialBundle, CredentialError>;
}

#[derive(Clone)]
struct StoredSecret {
    value: Zeroizing<String>,
    expires_at: Option<DateTime<Utc>>,
    active: bool,
}

/// In-memory credential store for tests and embedded deployments
pub struct MemoryCredentials {
    secrets: RwLock<HashMap<(String, String, String), StoredSecret>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCredentials {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl fmt::Debug for MemoryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCredentials").finish_non_exhaustive()
    }
}

impl MemoryCredentials {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            secrets: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn set(&self, agent_id: &str, user_id: &str, field: &str, value: &str) {
        self.set_with_expiry(agent_id, user_id, field, value, None).await;
    }

    pub async fn set_with_expiry(
        &self,
        agent_id: &str,
        user_id: &str,
        field: &str,
        value: &str,
        expires_at: Option<DateTime<Utc>>,
    ) {
        self.secrets.write().await.insert(
            (agent_id.to_string(), user_id.to_string(), field.to_string()),
            StoredSecret {
                value: Zeroizing::new(value.to_string()),
                expires_at,
                active: true,
            },
        );
    }

    pub async fn deactivate(&self, agent_id: &str, user_id: &str, field: &str) {
        if let Some(secret) = self.secrets.write().await.get_mut(&(
            agent_id.to_string(),
            user_id.to_string(),
            field.to_string(),
        )) {
            secret.active = false;
        }
    }
}

#[async_trait]
impl CredentialResolver for MemoryCredentials {
    async fn resolve(
        &self,
        agent_id: &str,
        user_id: &str,
        fields: &[String],
    ) -> Result<CredentialBundle, CredentialError> {
        let now = self.clock.now();
        let secrets = self.secrets.read().await;
        let mut bundle = CredentialBundle::new();

        for field in fields {
            let key = (agent_id.to_string(), user_id.to_string(), field.clone());
            match secrets.get(&key) {
                Some(secret)
                    if secret.active && secret.expires_at.is_none_or(|at| at > now) =>
                {
                    bundle.insert(field.clone(), secret.value.as_str());
                }
                _ => return Err(CredentialError::Missing(field.clone())),
            }
        }

        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    #[tokio::test]
    async fn test_resolve_fails_closed() {
        let clock = Arc::new(ManualClock::starting_now());
        let creds = MemoryCredentials::new(clock.clone());
        creds.set("a", "u", "api_key", "sk-1").await;
        creds
            .set_with_expiry("a", "u", "token", "t-1", Some(clock.now() + Duration::minutes(5)))
            .await;

        let fields = vec!["api_key".to_string(), "token".to_string()];
        let bundle = creds.resolve("a", "u", &fields).await.unwrap();
        assert_eq!(bundle.get("api_key"), Some("sk-1"));

        clock.advance(Duration::minutes(6));
        match creds.resolve("a", "u", &fields).await {
            Err(CredentialError::Missing(field)) => assert_eq!(field, "token"),
            other => panic!("expected missing token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inactive_secret_is_missing() {
        let creds = MemoryCredentials::default();
        creds.set("a", "u", "api_key", "sk-1").await;
        creds.deactivate("a", "u", "api_key").await;
        assert!(creds
            .resolve("a", "u", &["api_key".to_string()])
            .await
            .is_err());
    }

    #[test]
    fn test_serializes_as_field_map() {
        let mut bundle = CredentialBundle::new();
        bundle.insert("api_key", "sk-1");
        bundle.insert("region", "eu");
        assert_eq!(
            serde_json::to_value(&bundle).unwrap(),
            serde_json::json!({"api_key": "sk-1", "region": "eu"})
        );
    }

    #[test]
    fn test_debug_redacts_values() {
        let mut bundle = CredentialBundle::new();
        bundle.insert("api_key", "super-secret");
        let rendered = format!("{:?}", bundle);
        assert!(rendered.contains("api_key"));
        assert!(!rendered.contains("super-secret"));
    }
}
