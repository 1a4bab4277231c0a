//! Runtime counters

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::job::JobStatus;

/// Process-wide execution counters
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Jobs admitted into the queue
    pub enqueued: AtomicU64,
    /// Enqueue calls rejected at admission (any reason)
    pub admissions_rejected: AtomicU64,
    /// Subset of rejections caused by rate limits
    pub rate_limited: AtomicU64,
    pub claimed: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub retried: AtomicU64,
    pub cancelled: AtomicU64,
    pub leases_reaped: AtomicU64,
    /// Webhook calls made
    pub dispatches: AtomicU64,
    pub dispatch_latency_ms_total: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, rate_limited: bool) {
        self.admissions_rejected.fetch_add(1, Ordering::Relaxed);
        if rate_limited {
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_claimed(&self) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job reaching `status`
    pub fn record_terminal(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Completed => &self.completed,
            JobStatus::Failed => &self.failed,
            JobStatus::TimedOut => &self.timed_out,
            JobStatus::Cancelled => &self.cancelled,
            JobStatus::Queued | JobStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leases_reaped(&self, count: u64) {
        self.leases_reaped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, latency_ms: u64) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.dispatch_latency_ms_total
            .fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            admissions_rejected: self.admissions_rejected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            leases_reaped: self.leases_reaped.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            dispatch_latency_ms_total: self.dispatch_latency_ms_total.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub admissions_rejected: u64,
    pub rate_limited: u64,
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub leases_reaped: u64,
    pub dispatches: u64,
    pub dispatch_latency_ms_total: u64,
}

impl MetricsSnapshot {
    pub fn avg_dispatch_latency_ms(&self) -> f64 {
        if self.dispatches == 0 {
            0.0
        } else {
            self.dispatch_latency_ms_total as f64 / self.dispatches as f64
        }
    }

    /// Export metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let counters: [(&str, &str, u64); 12] = [
            ("agentrun_jobs_enqueued_total", "Jobs admitted into the queue", self.enqueued),
            (
                "agentrun_admissions_rejected_total",
                "Execution requests rejected at admission",
                self.admissions_rejected,
            ),
            (
                "agentrun_rate_limited_total",
                "Execution requests rejected by rate limits",
                self.rate_limited,
            ),
            ("agentrun_jobs_claimed_total", "Attempts leased to workers", self.claimed),
            ("agentrun_jobs_completed_total", "Jobs that completed", self.completed),
            ("agentrun_jobs_failed_total", "Jobs that failed permanently", self.failed),
            ("agentrun_jobs_timed_out_total", "Jobs whose last attempt timed out", self.timed_out),
            ("agentrun_jobs_retried_total", "Attempts sent back for retry", self.retried),
            ("agentrun_jobs_cancelled_total", "Jobs cancelled while queued", self.cancelled),
            ("agentrun_leases_reaped_total", "Jobs reclaimed from lapsed workers", self.leases_reaped),
            ("agentrun_dispatches_total", "Webhook calls made", self.dispatches),
            (
                "agentrun_dispatch_latency_ms_total",
                "Cumulative webhook latency in milliseconds",
                self.dispatch_latency_ms_total,
            ),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {} {}", name, help);
            let _ = writeln!(output, "# TYPE {} counter", name);
            let _ = writeln!(output, "{} {}", name, value);
        }

        output.push_str("# HELP agentrun_dispatch_latency_ms_avg Mean webhook latency\n");
        output.push_str("# TYPE agentrun_dispatch_latency_ms_avg gauge\n");
        let _ = writeln!(
            output,
            "agentrun_dispatch_latency_ms_avg {:.2}",
            self.avg_dispatch_latency_ms()
        );

        output
    }
}
