//! Scripted dispatcher for tests

use agentrun_queue::ErrorClass;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::payload::WebhookPayload;

/// Call recorded by [`MockDispatcher`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub webhook_url: String,
    pub payload: WebhookPayload,
    pub timeout: Duration,
}

/// Returns queued results in order, then a fallback for every later call
#[derive(Debug)]
pub struct MockDispatcher {
    script: Mutex<VecDeque<DispatchResult>>,
    fallback: DispatchResult,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockDispatcher {
    pub fn new(script: Vec<DispatchResult>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: DispatchResult::ok(200, serde_json::json!({ "ok": true }), 1),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always answers 200 `{"ok": true}`
    pub fn succeeding() -> Self {
        Self::new(Vec::new())
    }

    /// Always answers with `status` classified as `class`
    pub fn failing(class: ErrorClass, status: u16) -> Self {
        Self {
            fallback: DispatchResult::failed(class, Some(status), format!("HTTP {}", status), 1),
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        webhook_url: &str,
        payload: &WebhookPayload,
        timeout: Duration,
    ) -> DispatchResult {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                webhook_url: webhook_url.to_string(),
                payload: payload.clone(),
                timeout,
            });
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}
