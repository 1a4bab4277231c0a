//! Webhook request body

use agentrun_queue::{AgentRecord, CredentialBundle, ExecutionJob};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// JSON body POSTed to an agent's webhook. Secret values stay inside the
/// [`CredentialBundle`], so every copy of a payload wipes them on drop.
#[derive(Clone, Serialize)]
pub struct WebhookPayload {
    pub agent_id: String,
    pub agent_name: String,
    pub inputs: serde_json::Value,
    pub credentials: CredentialBundle,
    pub timestamp: DateTime<Utc>,
    /// Alias of `job_id` in the webhook contract
    pub execution_id: Uuid,
    pub job_id: Uuid,
    /// Fresh per attempt
    pub correlation_id: Uuid,
    /// Zero-based attempt number
    pub attempt: u32,
}

impl WebhookPayload {
    /// Build the body for the current attempt of `job`; takes ownership of
    /// the resolved credentials
    pub fn for_job(
        job: &ExecutionJob,
        agent: &AgentRecord,
        credentials: CredentialBundle,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: job.agent_id.clone(),
            agent_name: agent.name.clone(),
            inputs: job.payload.clone(),
            credentials,
            timestamp: now,
            execution_id: job.id,
            job_id: job.id,
            correlation_id: Uuid::new_v4(),
            attempt: job.attempt,
        }
    }
}

impl fmt::Debug for WebhookPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookPayload")
            .field("agent_id", &self.agent_id)
            .field("job_id", &self.job_id)
            .field("correlation_id", &self.correlation_id)
            .field("attempt", &self.attempt)
            .field("credentials", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}
