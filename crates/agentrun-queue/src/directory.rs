//! Agent metadata and entitlement lookup

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::rate_limit::RateLimits;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Directory backend error: {0}")]
    Backend(String),
}

/// Published agent, as the runtime sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub webhook_url: String,
    pub active: bool,
    /// Credential fields that must resolve before the agent may run
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
    /// Overrides the system default ceilings
    #[serde(default)]
    pub rate_limits: Option<RateLimits>,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, webhook_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            webhook_url: webhook_url.into(),
            active: true,
            required_fields: Vec::new(),
            default_timeout_secs: None,
            rate_limits: None,
        }
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.rate_limits = Some(limits);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = Some(secs);
        self
    }
}

/// Lookup surface owned by the marketplace catalog
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, DirectoryError>;

    /// Whether `user_id` has installed (purchased) `agent_id`
    async fn is_entitled(&self, agent_id: &str, user_id: &str) -> Result<bool, DirectoryError>;
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    agents: RwLock<HashMap<String, AgentRecord>>,
    installs: RwLock<HashSet<(String, String)>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, agent: AgentRecord) {
        self.agents.write().await.insert(agent.id.clone(), agent);
    }

    pub async fn set_active(&self, agent_id: &str, active: bool) {
        if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
            agent.active = active;
        }
    }

    pub async fn install(&self, agent_id: &str, user_id: &str) {
        self.installs
            .write()
            .await
            .insert((agent_id.to_string(), user_id.to_string()));
    }

    pub async fn uninstall(&self, agent_id: &str, user_id: &str) {
        self.installs
            .write()
            .await
            .remove(&(agent_id.to_string(), user_id.to_string()));
    }
}

#[async_trait]
impl AgentDirectory for MemoryDirectory {
    async fn agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, DirectoryError> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn is_entitled(&self, agent_id: &str, user_id: &str) -> Result<bool, DirectoryError> {
        Ok(self
            .installs
            .read()
            .await
            .contains(&(agent_id.to_string(), user_id.to_string())))
    }
}
