//! History command - recent executions, per-job phases and daily rollups
//!
//! Usage:
//! ```bash
//! agentrun history alice --agent digest --limit 20
//! agentrun history --job 6f1c...
//! agentrun history --agent digest --rollups --days 7
//! ```

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use uuid::Uuid;

use agentrun_queue::{HistoryRecorder, JobStatus};

use crate::context::Database;

/// Arguments for the history command
#[derive(Args)]
pub struct HistoryArgs {
    /// User whose executions to show
    user_id: Option<String>,

    /// Narrow to one agent
    #[arg(long)]
    agent: Option<String>,

    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Show the phase log of one execution instead
    #[arg(long)]
    job: Option<Uuid>,

    /// Show per-day analytics for --agent
    #[arg(long)]
    rollups: bool,

    /// Rollup window
    #[arg(long, default_value_t = 30)]
    days: i64,

    /// Output raw JSON (no formatting)
    #[arg(long)]
    raw: bool,
}

/// Run the history command
pub async fn run(db: &Database, args: HistoryArgs) -> Result<()> {
    let history = db.history().await?;

    if let Some(job_id) = args.job {
        return show_job(&history, job_id, args.raw).await;
    }
    if args.rollups {
        let Some(agent) = args.agent.as_deref() else {
            bail!("--rollups needs --agent");
        };
        return show_rollups(&history, agent, args.days, args.raw).await;
    }

    let Some(user_id) = args.user_id.as_deref() else {
        bail!("a user id is required unless --job or --rollups is given");
    };
    let executions = history
        .get_execution_history(user_id, args.agent.as_deref(), args.limit.max(1))
        .await?;
    if args.raw {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }
    if executions.is_empty() {
        println!("{}", "No executions found".dimmed());
        return Ok(());
    }

    let mut table = header(&["Job", "Agent", "Trigger", "Status", "Attempts", "Created", "Duration", "Error"]);
    for run in &executions {
        table.add_row(vec![
            Cell::new(run.job_id.to_string()),
            Cell::new(&run.agent_id).fg(Color::Green),
            Cell::new(run.trigger_type.as_str()),
            status_cell(run.status),
            Cell::new(format!("{}/{}", run.attempt, run.max_attempts)),
            Cell::new(run.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(run.duration_ms.map(|ms| format!("{ms}ms")).unwrap_or_default()),
            Cell::new(run.error_message.clone().unwrap_or_default()).fg(Color::Red),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn show_job(history: &HistoryRecorder, job_id: Uuid, raw: bool) -> Result<()> {
    let entries = history.entries_for_job(job_id).await?;
    if raw {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        bail!("No history for execution {}", job_id);
    }

    println!("{} {}", "Execution".bold(), job_id.to_string().cyan());
    let mut table = header(&["Time", "Attempt", "Phase", "Duration", "Log"]);
    for entry in &entries {
        table.add_row(vec![
            Cell::new(entry.timestamp.format("%H:%M:%S%.3f").to_string()),
            Cell::new(entry.attempt),
            Cell::new(entry.phase.as_str()).fg(Color::Yellow),
            Cell::new(entry.duration_ms.map(|ms| format!("{ms}ms")).unwrap_or_default()),
            Cell::new(entry.log_lines.join("\n")),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn show_rollups(history: &HistoryRecorder, agent: &str, days: i64, raw: bool) -> Result<()> {
    if !(1..=365).contains(&days) {
        bail!("--days must be between 1 and 365");
    }
    let since = chrono::Utc::now() - chrono::Duration::days(days);
    let rollups = history.daily_rollups(agent, since).await?;
    if raw {
        println!("{}", serde_json::to_string_pretty(&rollups)?);
        return Ok(());
    }

    println!("{} {} (last {} days)", "Analytics for".bold(), agent.green(), days);
    let mut table = header(&["Day", "Runs", "Succeeded", "Failed", "Users", "Avg duration"]);
    for day in &rollups {
        table.add_row(vec![
            Cell::new(day.day.to_string()),
            Cell::new(day.total_runs),
            Cell::new(day.successful_runs).fg(Color::Green),
            Cell::new(day.failed_runs).fg(Color::Red),
            Cell::new(day.unique_users),
            Cell::new(format!("{:.0}ms", day.avg_duration_ms)),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn header(columns: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(columns.iter().map(|c| Cell::new(c).fg(Color::Cyan)).collect::<Vec<_>>());
    table
}

fn status_cell(status: JobStatus) -> Cell {
    let color = match status {
        JobStatus::Completed => Color::Green,
        JobStatus::Failed | JobStatus::TimedOut => Color::Red,
        JobStatus::Running => Color::Blue,
        JobStatus::Cancelled => Color::DarkGrey,
        JobStatus::Queued => Color::Yellow,
    };
    Cell::new(status.as_str()).fg(color)
}
