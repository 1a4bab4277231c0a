//! Worker command - runtime loops without the API
//!
//! Usage:
//! ```bash
//! agentrun worker --capacity 8 --worker-id worker-a
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use agentrun_api::shutdown_signal;
use agentrun_dispatch::{DispatchConfig, WebhookDispatcher};
use agentrun_runtime::{Runtime, RuntimeConfig};

use crate::context::Database;

/// Flags layered over `RuntimeConfig::from_env`
#[derive(Args)]
pub struct RuntimeOverrides {
    /// Stable worker identity used for leases
    #[arg(long)]
    worker_id: Option<String>,

    /// Maximum concurrent executions
    #[arg(long)]
    capacity: Option<u32>,

    /// Do not fire cron schedules from this process
    #[arg(long)]
    no_scheduler: bool,

    /// Do not reap expired leases from this process
    #[arg(long)]
    no_reaper: bool,
}

impl RuntimeOverrides {
    pub fn into_config(self) -> RuntimeConfig {
        let mut config = RuntimeConfig::from_env();
        if let Some(worker_id) = self.worker_id {
            config.worker_id = worker_id;
        }
        if let Some(capacity) = self.capacity {
            config.capacity = capacity.max(1);
        }
        if self.no_scheduler {
            config.run_scheduler = false;
        }
        if self.no_reaper {
            config.run_reaper = false;
        }
        config
    }
}

/// Arguments for the worker command
#[derive(Args)]
pub struct WorkerArgs {
    #[command(flatten)]
    runtime: RuntimeOverrides,
}

/// Run the worker command
pub async fn run(db: &Database, args: WorkerArgs) -> Result<()> {
    let queue = db.queue().await?;
    let dispatcher = WebhookDispatcher::new(DispatchConfig::from_env())
        .context("Failed to build webhook client")?;
    let config = args.runtime.into_config();
    tracing::info!(
        worker_id = %config.worker_id,
        capacity = config.capacity,
        "Starting AgentRun worker"
    );

    let handle = Runtime::new(queue, Arc::new(dispatcher), config).start();
    shutdown_signal().await;
    handle.shutdown().await;
    Ok(())
}
