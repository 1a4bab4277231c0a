//! Dispatcher configuration

use serde::{Deserialize, Serialize};
use std::env;

/// HTTP client settings for outbound webhook calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Used when neither the job nor the agent sets a timeout (env: AGENTRUN_DISPATCH_TIMEOUT_SECS)
    pub default_timeout_secs: u64,
    /// TCP connect timeout (env: AGENTRUN_DISPATCH_CONNECT_TIMEOUT_SECS)
    pub connect_timeout_secs: u64,
    /// Response bodies beyond this are truncated in error messages
    pub max_error_body_chars: usize,
    /// Sent as the User-Agent header (env: AGENTRUN_DISPATCH_USER_AGENT)
    pub user_agent: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: agentrun_queue::job::DEFAULT_TIMEOUT_SECS,
            connect_timeout_secs: 10,
            max_error_body_chars: 512,
            user_agent: format!("agentrun-dispatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DispatchConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_timeout_secs: env::var("AGENTRUN_DISPATCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_timeout_secs),
            connect_timeout_secs: env::var("AGENTRUN_DISPATCH_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_timeout_secs),
            max_error_body_chars: defaults.max_error_body_chars,
            user_agent: env::var("AGENTRUN_DISPATCH_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }
}
