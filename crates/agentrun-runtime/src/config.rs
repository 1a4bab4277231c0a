//! Runtime loop configuration

use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Settings for the worker, reaper and scheduler loops of one process
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stable identity used for leases and heartbeats
    pub worker_id: String,
    /// Maximum jobs this worker runs concurrently
    pub capacity: u32,
    /// Sleep between claim attempts when the queue is empty
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// A worker silent for longer than this loses its leases
    pub lease_grace: Duration,
    pub reap_interval: Duration,
    pub scheduler_interval: Duration,
    pub run_reaper: bool,
    pub run_scheduler: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            capacity: 4,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(10),
            lease_grace: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
            scheduler_interval: Duration::from_secs(15),
            run_reaper: true,
            run_scheduler: true,
        }
    }
}

impl RuntimeConfig {
    /// Load from `AGENTRUN_WORKER_*`, `AGENTRUN_LEASE_*`, `AGENTRUN_SCHEDULER_*`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: std::env::var("AGENTRUN_WORKER_ID").unwrap_or(defaults.worker_id),
            capacity: env_u64("AGENTRUN_WORKER_CAPACITY", defaults.capacity as u64).max(1) as u32,
            poll_interval: Duration::from_millis(env_u64(
                "AGENTRUN_WORKER_POLL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            heartbeat_interval: Duration::from_secs(env_u64(
                "AGENTRUN_WORKER_HEARTBEAT_SECS",
                defaults.heartbeat_interval.as_secs(),
            )),
            lease_grace: Duration::from_secs(env_u64(
                "AGENTRUN_LEASE_GRACE_SECS",
                defaults.lease_grace.as_secs(),
            )),
            reap_interval: Duration::from_secs(env_u64(
                "AGENTRUN_LEASE_REAP_INTERVAL_SECS",
                defaults.reap_interval.as_secs(),
            )),
            scheduler_interval: Duration::from_secs(env_u64(
                "AGENTRUN_SCHEDULER_INTERVAL_SECS",
                defaults.scheduler_interval.as_secs(),
            )),
            run_reaper: std::env::var("AGENTRUN_DISABLE_REAPER").is_err(),
            run_scheduler: std::env::var("AGENTRUN_DISABLE_SCHEDULER").is_err(),
        }
    }
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}
