//! Cron scheduler: turns due schedules into queued jobs

use std::sync::Arc;
use std::time::Duration;

use agentrun_queue::{
    AdmissionError, ExecutionQueue, JobId, NewJob, QueueError, Schedule, ScheduleError,
    ScheduleStore, TriggerType,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one scheduler pass did
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    pub fired: Vec<JobId>,
    /// Another scheduler instance claimed the occurrence first
    pub lost_race: usize,
    /// Enqueue refused the fire
    pub rejected: usize,
}

pub struct Scheduler {
    queue: Arc<ExecutionQueue>,
    schedules: Arc<dyn ScheduleStore>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        queue: Arc<ExecutionQueue>,
        schedules: Arc<dyn ScheduleStore>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            schedules,
            interval,
        }
    }

    /// Validate and store a new schedule; `next_run` is the first occurrence after now
    pub async fn create_schedule(
        &self,
        agent_id: &str,
        user_id: &str,
        cron_expression: &str,
        timezone: &str,
        payload: serde_json::Value,
        priority: Option<u8>,
    ) -> Result<Schedule, ScheduleError> {
        let mut schedule = Schedule::new(
            agent_id,
            user_id,
            cron_expression,
            timezone,
            payload,
            self.queue.clock().now(),
        )?;
        if let Some(priority) = priority {
            schedule.priority = priority.clamp(
                agentrun_queue::job::HIGHEST_PRIORITY,
                agentrun_queue::job::LOWEST_PRIORITY,
            );
        }
        self.schedules.insert(schedule.clone()).await?;
        info!(
            schedule_id = %schedule.id,
            agent_id = %schedule.agent_id,
            cron = %schedule.cron_expression,
            next_run = %schedule.next_run,
            "Schedule created"
        );
        Ok(schedule)
    }

    /// Fire every due schedule once. A store failure on one schedule is
    /// logged and the pass moves on; only listing due schedules can fail it.
    pub async fn tick(&self) -> Result<TickReport, ScheduleError> {
        let now = self.queue.clock().now();
        let mut report = TickReport::default();

        for schedule in self.schedules.due(now).await? {
            // Missed occurrences are skipped: the next run is always after now
            let next_run = match schedule.cron().and_then(|cron| cron.next_after(now)) {
                Ok(next) => next,
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "Schedule has no valid next run; disabling");
                    if let Err(e) = self.schedules.set_active(schedule.id, false).await {
                        error!(schedule_id = %schedule.id, error = %e, "Failed to disable schedule");
                    }
                    continue;
                }
            };

            match self
                .schedules
                .mark_fired(schedule.id, schedule.next_run, now, next_run)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(schedule_id = %schedule.id, "Occurrence already fired elsewhere");
                    report.lost_race += 1;
                    continue;
                }
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "Failed to claim occurrence");
                    continue;
                }
            }

            let request = NewJob::new(
                schedule.agent_id.clone(),
                schedule.user_id.clone(),
                TriggerType::Schedule,
                schedule.payload.clone(),
            )
            .with_priority(schedule.priority)
            .from_schedule(schedule.id);

            match self.queue.enqueue(request).await {
                Ok(job_id) => {
                    info!(
                        schedule_id = %schedule.id,
                        job_id = %job_id,
                        next_run = %next_run,
                        "Schedule fired"
                    );
                    report.fired.push(job_id);
                }
                Err(QueueError::Admission(e @ AdmissionError::RateLimitExceeded { .. })) => {
                    info!(schedule_id = %schedule.id, error = %e, "Scheduled fire rate limited");
                    report.rejected += 1;
                }
                Err(QueueError::Admission(e)) => {
                    warn!(schedule_id = %schedule.id, error = %e, "Scheduled fire rejected");
                    report.rejected += 1;
                    if let Err(e) = self.schedules.record_outcome(schedule.id, false).await {
                        error!(schedule_id = %schedule.id, error = %e, "Failed to record rejected fire");
                    }
                }
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "Scheduled fire failed");
                    report.rejected += 1;
                }
            }
        }

        Ok(report)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Scheduler pass failed");
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }
}
