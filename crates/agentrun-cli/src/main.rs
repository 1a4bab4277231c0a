//! AgentRun CLI - run and inspect the agent execution runtime
//!
//! # Usage
//!
//! ```bash
//! # API server plus an embedded worker, reaper and scheduler
//! agentrun serve --port 8080
//!
//! # Worker only (scale out against the same database)
//! agentrun worker --capacity 8
//!
//! # Register an agent and give a user access
//! agentrun agents register digest "Daily Digest" https://agents.example/digest --require api_key
//! agentrun agents install digest alice
//! agentrun agents secret digest alice api_key sk-live-123
//!
//! # Recent executions of a user
//! agentrun history alice --agent digest
//!
//! # Preview a cron expression
//! agentrun cron "0 9 * * MON-FRI" --tz Europe/Berlin
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;

mod commands;
mod context;

use commands::{agents, cron, history, info, serve, worker};

/// AgentRun - execution runtime for webhook-backed agents
#[derive(Parser)]
#[command(
    name = "agentrun",
    version,
    about = "AgentRun CLI - queue, dispatch and schedule agent executions",
    long_about = "AgentRun admits execution requests, leases them to workers,\n\
                  calls each agent's webhook with retries, and records the\n\
                  history of every attempt."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// SQLite database URL
    #[arg(
        long,
        env = "AGENTRUN_DATABASE_URL",
        default_value = "sqlite:agentrun.db?mode=rwc",
        global = true
    )]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API with an embedded runtime
    #[command(name = "serve")]
    Serve(serve::ServeArgs),

    /// Run worker, reaper and scheduler loops without the API
    #[command(name = "worker")]
    Worker(worker::WorkerArgs),

    /// Manage agents, installations and credentials
    #[command(name = "agents")]
    Agents(agents::AgentsArgs),

    /// Show execution history
    #[command(name = "history")]
    History(history::HistoryArgs),

    /// Preview the next occurrences of a cron expression
    #[command(name = "cron")]
    Cron(cron::CronArgs),

    /// Show version and configuration
    #[command(name = "info")]
    Info(info::InfoArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let long_running = matches!(cli.command, Commands::Serve(_) | Commands::Worker(_));
    setup_logging(cli.verbose, long_running);

    let db = context::Database::new(cli.database_url);
    match cli.command {
        Commands::Serve(args) => serve::run(&db, args).await,
        Commands::Worker(args) => worker::run(&db, args).await,
        Commands::Agents(args) => agents::run(&db, args).await,
        Commands::History(args) => history::run(&db, args).await,
        Commands::Cron(args) => cron::run(args),
        Commands::Info(args) => info::run(&db, args),
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8, long_running: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 if long_running => "info",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_worker_overrides() {
        let cli = Cli::try_parse_from([
            "agentrun",
            "-vv",
            "--database-url",
            "sqlite::memory:",
            "worker",
            "--capacity",
            "8",
            "--no-scheduler",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.database_url, "sqlite::memory:");
        assert!(matches!(cli.command, Commands::Worker(_)));
    }

    #[test]
    fn test_cli_rejects_unknown_backoff() {
        let parsed = Cli::try_parse_from([
            "agentrun", "agents", "retry", "digest", "--backoff", "quadratic",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
