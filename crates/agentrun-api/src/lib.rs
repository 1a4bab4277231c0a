//! # AgentRun API
//!
//! HTTP surface of the execution runtime.
//!
//! Features:
//! - Execution triggers with synchronous admission errors
//! - Job status, cancellation and per-job phase history
//! - Per-user history and per-agent daily analytics
//! - Cron schedule creation
//! - Prometheus metrics, request IDs, request tracing
//! - Graceful shutdown

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod state;
pub mod telemetry;

pub use error::{ApiError, ApiResult};
pub use routes::api_router;
pub use server::{shutdown_signal, ApiServer, ServerConfig};
pub use state::AppState;
pub use telemetry::{init_tracing, TelemetryConfig};
