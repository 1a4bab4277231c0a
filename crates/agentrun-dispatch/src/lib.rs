//! # AgentRun Dispatch
//!
//! Performs the outbound webhook call for one job attempt: builds the
//! [`WebhookPayload`] with freshly resolved credentials, POSTs it under a hard
//! timeout and classifies the result into an [`agentrun_queue::ErrorClass`].

pub mod config;
pub mod dispatcher;
pub mod mock;
pub mod payload;

pub use config::DispatchConfig;
pub use dispatcher::{
    classify_status, parse_body, DispatchError, DispatchResult, Dispatcher, WebhookDispatcher,
    CORRELATION_HEADER,
};
pub use mock::{MockDispatcher, RecordedCall};
pub use payload::WebhookPayload;
