//! Cron command - preview when a schedule would fire
//!
//! Usage:
//! ```bash
//! agentrun cron "*/15 * * * *"
//! agentrun cron "0 9 * * MON-FRI" --tz America/New_York --count 10
//! ```

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use agentrun_queue::CronSchedule;

/// Arguments for the cron command
#[derive(Args)]
pub struct CronArgs {
    /// Five-field (minute precision) or six-field (with seconds) expression
    expression: String,

    /// IANA time zone the expression is evaluated in
    #[arg(long, default_value = "UTC")]
    tz: String,

    /// Number of occurrences to show
    #[arg(long, default_value_t = 5)]
    count: usize,
}

/// Run the cron command
pub fn run(args: CronArgs) -> Result<()> {
    let schedule = CronSchedule::parse(&args.expression, &args.tz)?;
    let upcoming = schedule.upcoming(chrono::Utc::now(), args.count.max(1));

    println!(
        "{} {} ({})",
        "Next runs of".bold(),
        schedule.expression().cyan(),
        args.tz
    );
    if upcoming.is_empty() {
        crate::print_warning("Expression has no upcoming occurrence");
        return Ok(());
    }
    for at in upcoming {
        println!("  {} {}", "•".cyan(), at.to_rfc3339().green());
    }
    Ok(())
}
