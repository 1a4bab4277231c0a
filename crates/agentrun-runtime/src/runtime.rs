//! Wires the worker pool, reaper and scheduler into one process

use std::sync::Arc;

use agentrun_dispatch::Dispatcher;
use agentrun_queue::{ExecutionQueue, LeaseManager};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::reaper::Reaper;
use crate::scheduler::Scheduler;
use crate::worker::{WorkerConfig, WorkerPool};

pub struct Runtime {
    queue: Arc<ExecutionQueue>,
    dispatcher: Arc<dyn Dispatcher>,
    config: RuntimeConfig,
}

/// Running loops; dropping it does not stop them, call [`RuntimeHandle::shutdown`]
pub struct RuntimeHandle {
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    worker: Arc<WorkerPool>,
}

impl Runtime {
    pub fn new(
        queue: Arc<ExecutionQueue>,
        dispatcher: Arc<dyn Dispatcher>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            config,
        }
    }

    pub fn start(self) -> RuntimeHandle {
        let token = CancellationToken::new();
        let mut tasks = Vec::new();

        let worker = Arc::new(WorkerPool::new(
            self.queue.clone(),
            self.dispatcher.clone(),
            WorkerConfig::from(&self.config),
        ));
        tasks.push((
            "worker",
            tokio::spawn(worker.clone().run(token.child_token())),
        ));

        if self.config.run_reaper {
            let reaper = Reaper::new(
                LeaseManager::new(self.queue.clone()),
                self.config.lease_grace,
                self.config.reap_interval,
            );
            tasks.push(("reaper", tokio::spawn(reaper.run(token.child_token()))));
        }

        match (self.config.run_scheduler, self.queue.schedules()) {
            (true, Some(schedules)) => {
                let scheduler = Scheduler::new(
                    self.queue.clone(),
                    schedules.clone(),
                    self.config.scheduler_interval,
                );
                tasks.push(("scheduler", tokio::spawn(scheduler.run(token.child_token()))));
            }
            (true, None) => warn!("Scheduler enabled but no schedule store configured"),
            (false, _) => {}
        }

        info!(
            worker_id = %self.config.worker_id,
            tasks = tasks.len(),
            "Runtime started"
        );
        RuntimeHandle {
            token,
            tasks,
            worker,
        }
    }
}

impl RuntimeHandle {
    pub fn worker(&self) -> &Arc<WorkerPool> {
        &self.worker
    }

    /// Token that stops every loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop claiming, let in-flight jobs finish, then join every loop
    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Runtime task ended abnormally");
            }
        }
        info!("Runtime stopped");
    }
}
