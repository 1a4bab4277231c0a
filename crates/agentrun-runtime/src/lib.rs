//! # AgentRun Runtime
//!
//! Long-running loops around the execution queue:
//! - [`WorkerPool`]: heartbeat, claim, resolve credentials, dispatch, complete
//! - [`Reaper`]: reclaims leases from workers that stopped heartbeating
//! - [`Scheduler`]: fires due cron schedules into the queue
//!
//! [`Runtime`] starts all three and stops them on a shared cancellation token.

pub mod config;
pub mod reaper;
pub mod runtime;
pub mod scheduler;
pub mod worker;

pub use config::RuntimeConfig;
pub use reaper::Reaper;
pub use runtime::{Runtime, RuntimeHandle};
pub use scheduler::{Scheduler, TickReport};
pub use worker::{WorkerConfig, WorkerPool};
