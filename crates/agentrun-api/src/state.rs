//! Application State
//!
//! Shared handles to the execution queue and the services built on top of it.

use std::sync::Arc;
use std::time::Duration;

use agentrun_queue::{ExecutionQueue, LeaseManager, RuntimeMetrics};
use agentrun_runtime::Scheduler;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    queue: Arc<ExecutionQueue>,
    leases: LeaseManager,
    scheduler: Option<Arc<Scheduler>>,
}

impl AppState {
    /// Build state around a queue; schedule routes are enabled when the queue
    /// was built with a schedule store
    pub fn new(queue: Arc<ExecutionQueue>) -> Self {
        let scheduler = queue.schedules().map(|store| {
            // The interval only matters for `Scheduler::run`, which the API never calls
            Arc::new(Scheduler::new(queue.clone(), store.clone(), Duration::ZERO))
        });
        Self {
            leases: LeaseManager::new(queue.clone()),
            queue,
            scheduler,
        }
    }

    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn scheduler(&self) -> Option<&Arc<Scheduler>> {
        self.scheduler.as_ref()
    }

    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        self.queue.metrics()
    }
}
