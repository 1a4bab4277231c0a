//! Serve command - HTTP API with an embedded runtime
//!
//! Usage:
//! ```bash
//! agentrun serve --port 8080
//! agentrun serve --no-worker
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use agentrun_api::{shutdown_signal, ApiServer, AppState, ServerConfig};
use agentrun_dispatch::{DispatchConfig, WebhookDispatcher};
use agentrun_runtime::Runtime;

use crate::commands::worker::RuntimeOverrides;
use crate::context::Database;

/// Arguments for the serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "AGENTRUN_PORT", default_value_t = 8080)]
    port: u16,

    /// Serve the API only; jobs are left for separate `agentrun worker` processes
    #[arg(long)]
    no_worker: bool,

    #[command(flatten)]
    runtime: RuntimeOverrides,
}

/// Run the serve command
pub async fn run(db: &Database, args: ServeArgs) -> Result<()> {
    let queue = db.queue().await?;
    let config = ServerConfig::from_env().with_port(args.port);
    let server = ApiServer::new(config, AppState::new(queue.clone()));

    let runtime = if args.no_worker {
        None
    } else {
        let dispatcher = WebhookDispatcher::new(DispatchConfig::from_env())
            .context("Failed to build webhook client")?;
        let handle = Runtime::new(queue, Arc::new(dispatcher), args.runtime.into_config()).start();
        Some(handle)
    };

    tracing::info!(port = args.port, embedded_worker = runtime.is_some(), "Starting AgentRun server");
    let served = server.run_until(shutdown_signal()).await;

    if let Some(handle) = runtime {
        handle.shutdown().await;
    }
    served.context("API server failed")
}
