//! Agents command - directory, installations, credentials and retry overrides
//!
//! Usage:
//! ```bash
//! agentrun agents register digest "Daily Digest" https://agents.example/digest --require api_key
//! agentrun agents list
//! agentrun agents install digest alice
//! agentrun agents secret digest alice api_key sk-live-123 --expires-in-days 90
//! agentrun agents retry digest --class server_error --max-retries 5 --backoff linear
//! ```

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use agentrun_persist::{save_retry_policy, SqliteCredentialVault, SqliteDirectory};
use agentrun_queue::{AgentRecord, BackoffStrategy, ErrorClass, RateLimits, RetryPolicy};

use crate::context::Database;
use crate::print_success;

/// Arguments for the agents command
#[derive(Args)]
pub struct AgentsArgs {
    #[command(subcommand)]
    command: AgentsCommand,
}

#[derive(Subcommand)]
pub enum AgentsCommand {
    /// Register or update an agent
    #[command(name = "register")]
    Register {
        id: String,
        name: String,
        webhook_url: String,

        /// Credential field that must be present before the agent runs (repeatable)
        #[arg(long = "require")]
        required_fields: Vec<String>,

        /// Default per-attempt timeout
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Per-user ceilings; any flag given replaces the system defaults
        #[arg(long)]
        per_minute: Option<u32>,
        #[arg(long)]
        per_hour: Option<u32>,
        #[arg(long)]
        per_day: Option<u32>,
    },

    /// List registered agents
    #[command(name = "list")]
    List,

    /// Allow new executions of an agent
    #[command(name = "enable")]
    Enable { id: String },

    /// Refuse new executions of an agent
    #[command(name = "disable")]
    Disable { id: String },

    /// Entitle a user to an agent
    #[command(name = "install")]
    Install { agent_id: String, user_id: String },

    /// Revoke a user's entitlement
    #[command(name = "uninstall")]
    Uninstall { agent_id: String, user_id: String },

    /// Store an encrypted credential (needs AGENTRUN_VAULT_KEY)
    #[command(name = "secret")]
    Secret {
        agent_id: String,
        user_id: String,
        field: String,
        value: String,

        #[arg(long)]
        expires_in_days: Option<i64>,
    },

    /// Override the retry policy of an agent
    #[command(name = "retry")]
    Retry {
        agent_id: String,

        /// Only for this error class (default: every class)
        #[arg(long)]
        class: Option<ErrorClass>,

        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        #[arg(long, default_value = "exponential")]
        backoff: BackoffStrategy,

        #[arg(long, default_value_t = 5)]
        initial_secs: u64,

        #[arg(long, default_value_t = 300)]
        max_secs: u64,

        #[arg(long)]
        no_jitter: bool,
    },
}

/// Run the agents command
pub async fn run(db: &Database, args: AgentsArgs) -> Result<()> {
    let pool = db.pool().await?;
    let directory = SqliteDirectory::new(pool.clone());

    match args.command {
        AgentsCommand::Register {
            id,
            name,
            webhook_url,
            required_fields,
            timeout_secs,
            per_minute,
            per_hour,
            per_day,
        } => {
            if !(webhook_url.starts_with("http://") || webhook_url.starts_with("https://")) {
                bail!("webhook_url must be an http(s) URL: {}", webhook_url);
            }
            let mut agent = AgentRecord::new(id, name, webhook_url).with_required_fields(required_fields);
            if let Some(secs) = timeout_secs {
                agent = agent.with_timeout_secs(secs);
            }
            if per_minute.is_some() || per_hour.is_some() || per_day.is_some() {
                agent = agent.with_rate_limits(RateLimits {
                    per_minute,
                    per_hour,
                    per_day,
                });
            }
            directory.register_agent(&agent).await?;
            print_success(&format!("Registered agent '{}'", agent.id));
        }
        AgentsCommand::List => list_agents(&directory).await?,
        AgentsCommand::Enable { id } => set_active(&directory, &id, true).await?,
        AgentsCommand::Disable { id } => set_active(&directory, &id, false).await?,
        AgentsCommand::Install { agent_id, user_id } => {
            directory.install(&agent_id, &user_id, chrono::Utc::now()).await?;
            print_success(&format!("Installed '{}' for {}", agent_id, user_id));
        }
        AgentsCommand::Uninstall { agent_id, user_id } => {
            if directory.uninstall(&agent_id, &user_id).await? {
                print_success(&format!("Uninstalled '{}' for {}", agent_id, user_id));
            } else {
                crate::print_warning(&format!("'{}' was not installed for {}", agent_id, user_id));
            }
        }
        AgentsCommand::Secret {
            agent_id,
            user_id,
            field,
            value,
            expires_in_days,
        } => {
            let vault = SqliteCredentialVault::from_env(pool)?;
            let expires_at = expires_in_days.map(|d| chrono::Utc::now() + chrono::Duration::days(d));
            vault
                .store_secret(&agent_id, &user_id, &field, &value, expires_at)
                .await?;
            print_success(&format!("Stored '{}' for {} / {}", field, agent_id, user_id));
        }
        AgentsCommand::Retry {
            agent_id,
            class,
            max_retries,
            backoff,
            initial_secs,
            max_secs,
            no_jitter,
        } => {
            if max_secs < initial_secs {
                bail!("--max-secs must not be below --initial-secs");
            }
            let policy = RetryPolicy {
                max_retries,
                backoff,
                initial_delay: Duration::from_secs(initial_secs),
                max_delay: Duration::from_secs(max_secs),
                jitter: !no_jitter,
            };
            save_retry_policy(&pool, &agent_id, class, &policy).await?;
            let scope = class.map(|c| c.to_string()).unwrap_or_else(|| "any error".to_string());
            print_success(&format!("Retry policy for '{}' ({}) saved", agent_id, scope));
        }
    }
    Ok(())
}

async fn set_active(directory: &SqliteDirectory, id: &str, active: bool) -> Result<()> {
    if !directory.set_active(id, active).await? {
        bail!("Agent '{}' not found", id);
    }
    let state = if active { "enabled" } else { "disabled" };
    print_success(&format!("Agent '{}' {}", id, state));
    Ok(())
}

async fn list_agents(directory: &SqliteDirectory) -> Result<()> {
    let agents = directory.list_agents().await?;
    if agents.is_empty() {
        println!("{}", "No agents registered".dimmed());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Webhook").fg(Color::Cyan),
            Cell::new("Active").fg(Color::Cyan),
            Cell::new("Requires").fg(Color::Cyan),
        ]);

    for agent in &agents {
        let active = if agent.active {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(&agent.id).fg(Color::Green),
            Cell::new(&agent.name),
            Cell::new(&agent.webhook_url),
            active,
            Cell::new(agent.required_fields.join(", ")).fg(Color::Yellow),
        ]);
    }

    println!("{table}");
    Ok(())
}
