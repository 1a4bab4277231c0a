//! Background lease reaper

use std::time::Duration;

use agentrun_queue::{LeaseManager, QueueError, ReapReport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct Reaper {
    leases: LeaseManager,
    grace: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(leases: LeaseManager, grace: Duration, interval: Duration) -> Self {
        Self {
            leases,
            grace,
            interval,
        }
    }

    /// One reaping pass
    pub async fn tick(&self) -> Result<ReapReport, QueueError> {
        let grace = chrono::Duration::from_std(self.grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let report = self.leases.reap_expired_leases(grace).await?;
        if !report.reclaimed.is_empty() || !report.workers_offline.is_empty() {
            info!(
                reclaimed = report.reclaimed.len(),
                skipped = report.skipped,
                workers_offline = report.workers_offline.len(),
                "Lease reaper pass"
            );
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
                        error!(error = %e, "Lease reaper pass failed");
                    }
                }
            }
        }
        info!("Lease reaper stopped");
    }
}
