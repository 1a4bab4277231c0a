//! Cron schedules
//!
//! Accepts standard 5-field POSIX cron expressions (minute, hour,
//! day-of-month, month, day-of-week) and 6-field expressions with seconds.
//! Five-field expressions are rewritten for the `cron` crate: a zero seconds
//! field is prepended and the day-of-week field is renumbered from POSIX
//! (0-7, Sunday is 0 or 7) to the crate's 1-7 with Sunday = 1. When both
//! day fields are restricted they match if either one does, as in POSIX
//! cron. Six-field expressions are passed to the crate as written.
//! Occurrences are computed in the schedule's IANA time zone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::job::DEFAULT_PRIORITY;

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("Unknown time zone: {0}")]
    InvalidTimezone(String),
    #[error("Cron expression '{0}' has no upcoming occurrence")]
    NoUpcoming(String),
    #[error("Schedule not found")]
    NotFound,
    #[error("Schedule backend error: {0}")]
    Backend(String),
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn invalid_cron(expression: &str, reason: impl Into<String>) -> ScheduleError {
    ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

/// POSIX rule: a day field starting with `*` (or `?`) does not take part
/// in the day-of-month / day-of-week union
fn is_unrestricted(field: &str) -> bool {
    field.starts_with('*') || field == "?"
}

fn posix_day(token: &str, expression: &str) -> Result<usize, ScheduleError> {
    if let Some(day) = DAY_NAMES.iter().position(|name| name.eq_ignore_ascii_case(token)) {
        return Ok(day);
    }
    match token.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(invalid_cron(expression, format!("invalid day of week '{token}'"))),
    }
}

/// Days selected by a POSIX day-of-week field, indexed from Sunday = 0
fn expand_day_of_week(field: &str, expression: &str) -> Result<[bool; 7], ScheduleError> {
    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (range, step),
                _ => return Err(invalid_cron(expression, format!("invalid step in '{part}'"))),
            },
            None => (part, 1),
        };
        let (first, last) = if range == "*" {
            (0, 6)
        } else if let Some((first, last)) = range.split_once('-') {
            (posix_day(first, expression)?, posix_day(last, expression)?)
        } else {
            let day = posix_day(range, expression)?;
            (day, if step > 1 { 6 } else { day })
        };
        if first > last {
            return Err(invalid_cron(expression, format!("descending range '{range}'")));
        }
        for day in (first..=last).step_by(step) {
            days[day % 7] = true;
        }
    }
    Ok(days)
}

/// Renumber a POSIX day-of-week field for the `cron` crate (Sunday = 1)
fn crate_day_of_week(field: &str, expression: &str) -> Result<String, ScheduleError> {
    if field == "*" || field == "?" {
        return Ok("*".to_string());
    }
    let days = expand_day_of_week(field, expression)?;
    Ok(days
        .iter()
        .enumerate()
        .filter(|(_, selected)| **selected)
        .map(|(day, _)| (day + 1).to_string())
        .collect::<Vec<_>>()
        .join(","))
}

/// Expressions for the `cron` crate whose union is the given schedule
fn crate_expressions(expression: &str) -> Result<Vec<String>, ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let [minute, hour, day_of_month, month, day_of_week] = fields[..] else {
        return Ok(vec![expression.trim().to_string()]);
    };
    let weekdays = crate_day_of_week(day_of_week, expression)?;
    if is_unrestricted(day_of_month) || is_unrestricted(day_of_week) {
        return Ok(vec![format!(
            "0 {minute} {hour} {day_of_month} {month} {weekdays}"
        )]);
    }
    Ok(vec![
        format!("0 {minute} {hour} {day_of_month} {month} *"),
        format!("0 {minute} {hour} * {month} {weekdays}"),
    ])
}

/// A parsed cron expression bound to a time zone
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedules: Vec<cron::Schedule>,
    tz: Tz,
}

impl CronSchedule {
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let schedules = crate_expressions(expression)?
            .iter()
            .map(|expr| {
                cron::Schedule::from_str(expr).map_err(|e| invalid_cron(expression, e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let tz: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        Ok(Self {
            expression: expression.to_string(),
            schedules,
            tz,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let local = after.with_timezone(&self.tz);
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&local).next())
            .min()
            .map(|at| at.with_timezone(&Utc))
            .ok_or_else(|| ScheduleError::NoUpcoming(self.expression.clone()))
    }

    /// The next `count` occurrences after `after`
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut occurrences = Vec::with_capacity(count);
        let mut cursor = after;
        while occurrences.len() < count {
            match self.next_after(cursor) {
                Ok(at) => {
                    occurrences.push(at);
                    cursor = at;
                }
                Err(_) => break,
            }
        }
        occurrences
    }
}

/// Recurring execution of one agent for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub agent_id: String,
    pub user_id: String,
    pub cron_expression: String,
    pub timezone: String,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    /// Validate the expression and compute the first `next_run` after `now`
    pub fn new(
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        cron_expression: &str,
        timezone: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        let cron = CronSchedule::parse(cron_expression, timezone)?;
        Ok(Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            user_id: user_id.into(),
            cron_expression: cron_expression.to_string(),
            timezone: timezone.to_string(),
            payload,
            priority: DEFAULT_PRIORITY,
            next_run: cron.next_after(now)?,
            last_run: None,
            consecutive_failures: 0,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            active: true,
            created_at: now,
        })
    }

    pub fn cron(&self) -> Result<CronSchedule, ScheduleError> {
        CronSchedule::parse(&self.cron_expression, &self.timezone)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_run <= now
    }

    /// Fold one terminal outcome into the failure streak.
    ///
    /// Returns true when this outcome disabled the schedule.
    pub fn apply_outcome(&mut self, succeeded: bool) -> bool {
        if succeeded {
            self.consecutive_failures = 0;
            return false;
        }
        self.consecutive_failures += 1;
        if self.active && self.consecutive_failures >= self.max_consecutive_failures {
            self.active = false;
            warn!(
                schedule_id = %self.id,
                agent_id = %self.agent_id,
                failures = self.consecutive_failures,
                "Schedule disabled after consecutive failures"
            );
            return true;
        }
        false
    }
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert(&self, schedule: Schedule) -> Result<(), ScheduleError>;

    async fn get(&self, id: Uuid) -> Result<Option<Schedule>, ScheduleError>;

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Schedule>, ScheduleError>;

    /// Active schedules with `next_run <= now`
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, ScheduleError>;

    /// Compare-and-set on `next_run`: advances only if it still equals
    /// `expected_next_run`. Exactly one caller wins a given occurrence.
    async fn mark_fired(
        &self,
        id: Uuid,
        expected_next_run: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<bool, ScheduleError>;

    /// Apply a terminal outcome of a fired job; returns the updated schedule
    async fn record_outcome(
        &self,
        id: Uuid,
        succeeded: bool,
    ) -> Result<Option<Schedule>, ScheduleError>;

    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool, ScheduleError>;
}

#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    schedules: RwLock<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, schedule: Schedule) -> Result<(), ScheduleError> {
        self.schedules.write().await.insert(schedule.id, schedule);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Schedule>, ScheduleError> {
        Ok(self.schedules.read().await.get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Schedule>, ScheduleError> {
        let mut schedules: Vec<Schedule> = self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, ScheduleError> {
        let mut due: Vec<Schedule> = self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run);
        Ok(due)
    }

    async fn mark_fired(
        &self,
        id: Uuid,
        expected_next_run: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules.get_mut(&id).ok_or(ScheduleError::NotFound)?;
        if !schedule.active || schedule.next_run != expected_next_run {
            return Ok(false);
        }
        schedule.last_run = Some(fired_at);
        schedule.next_run = next_run;
        Ok(true)
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        succeeded: bool,
    ) -> Result<Option<Schedule>, ScheduleError> {
        let mut schedules = self.schedules.write().await;
        Ok(schedules.get_mut(&id).map(|schedule| {
            schedule.apply_outcome(succeeded);
            schedule.clone()
        }))
    }

    async fn set_active(&self, id: Uuid, active: bool) -> Result<bool, ScheduleError> {
        let mut schedules = self.schedules.write().await;
        match schedules.get_mut(&id) {
            Some(schedule) => {
                schedule.active = active;
                if active {
                    schedule.consecutive_failures = 0;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
