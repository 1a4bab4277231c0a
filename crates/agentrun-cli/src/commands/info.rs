//! Info command - Show version and effective configuration
//!
//! Usage:
//! ```bash
//! agentrun info
//! ```

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use agentrun_api::ServerConfig;
use agentrun_dispatch::DispatchConfig;
use agentrun_queue::{RateLimits, RetryPolicy};
use agentrun_runtime::RuntimeConfig;

use crate::context::Database;

/// Arguments for the info command
#[derive(Args)]
pub struct InfoArgs;

/// Run the info command
pub fn run(db: &Database, _args: InfoArgs) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let server = ServerConfig::from_env();
    let runtime = RuntimeConfig::from_env();
    let dispatch = DispatchConfig::from_env();
    let retry = RetryPolicy::default();
    let limits = RateLimits::default();

    println!("{}", "AgentRun - agent execution runtime".bold().cyan());
    println!("{}", "═".repeat(50).cyan());
    println!();

    println!("{}", "Version Information:".bold());
    println!("  {} {}", "CLI Version:".dimmed(), version.green());
    println!();

    println!("{}", "Storage:".bold());
    println!("  {} {}", "Database:".dimmed(), db.url());
    let vault = if std::env::var("AGENTRUN_VAULT_KEY").is_ok() {
        "configured".green()
    } else {
        "AGENTRUN_VAULT_KEY not set".red()
    };
    println!("  {} {}", "Credential vault:".dimmed(), vault);
    println!();

    println!("{}", "Server:".bold());
    println!("  {} {}", "Listen:".dimmed(), server.addr);
    println!("  {} {}s", "Request timeout:".dimmed(), server.timeout.as_secs());
    println!();

    println!("{}", "Runtime:".bold());
    println!("  {} {}", "Worker ID:".dimmed(), runtime.worker_id);
    println!("  {} {}", "Capacity:".dimmed(), runtime.capacity);
    println!("  {} {}s", "Lease grace:".dimmed(), runtime.lease_grace.as_secs());
    println!("  {} {}", "Reaper:".dimmed(), enabled(runtime.run_reaper));
    println!("  {} {}", "Scheduler:".dimmed(), enabled(runtime.run_scheduler));
    println!();

    println!("{}", "Dispatch:".bold());
    println!("  {} {}s", "Default timeout:".dimmed(), dispatch.default_timeout_secs);
    println!("  {} {}", "User agent:".dimmed(), dispatch.user_agent);
    println!();

    println!("{}", "Defaults:".bold());
    println!(
        "  {} {} retries, {} from {}s up to {}s",
        "Retry:".dimmed(),
        retry.max_retries,
        retry.backoff,
        retry.initial_delay.as_secs(),
        retry.max_delay.as_secs()
    );
    println!(
        "  {} {}/min, {}/hour, {}/day",
        "Rate limits:".dimmed(),
        limit(limits.per_minute),
        limit(limits.per_hour),
        limit(limits.per_day)
    );
    println!();

    Ok(())
}

fn enabled(on: bool) -> colored::ColoredString {
    if on {
        "enabled".green()
    } else {
        "disabled".yellow()
    }
}

fn limit(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "∞".to_string())
}
