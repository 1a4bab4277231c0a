//! Outbound webhook call and outcome classification

use agentrun_queue::{ErrorClass, Outcome};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::DispatchConfig;
use crate::payload::WebhookPayload;

pub const CORRELATION_HEADER: &str = "X-Correlation-ID";

/// Dispatcher error types
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("HTTP client setup failed: {0}")]
    Client(String),
}

/// Result of a single webhook exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub success: bool,
    /// `None` when no response was received
    pub status_code: Option<u16>,
    /// Parsed response body; non-JSON bodies are wrapped as `{"message": raw}`
    pub body: serde_json::Value,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub latency_ms: u64,
}

impl DispatchResult {
    pub fn ok(status_code: u16, body: serde_json::Value, latency_ms: u64) -> Self {
        Self {
            success: true,
            status_code: Some(status_code),
            body,
            error_class: None,
            error_message: None,
            latency_ms,
        }
    }

    pub fn failed(
        class: ErrorClass,
        status_code: Option<u16>,
        message: impl Into<String>,
        latency_ms: u64,
    ) -> Self {
        Self {
            success: false,
            status_code,
            body: serde_json::Value::Null,
            error_class: Some(class),
            error_message: Some(message.into()),
            latency_ms,
        }
    }

    /// What the worker reports to `Complete`
    pub fn into_outcome(self) -> Outcome {
        match (self.success, self.error_class) {
            (true, _) => Outcome::Success(self.body),
            (false, Some(ErrorClass::Timeout)) => Outcome::Timeout,
            (false, class) => Outcome::failure(
                class.unwrap_or(ErrorClass::NetworkError),
                self.error_message.unwrap_or_default(),
            ),
        }
    }
}

/// Map an HTTP status to an error class; `None` means success
pub fn classify_status(status: StatusCode) -> Option<ErrorClass> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(ErrorClass::RateLimitedByRemote)
    } else if status.is_client_error() {
        Some(ErrorClass::ClientError)
    } else if status.is_server_error() {
        Some(ErrorClass::ServerError)
    } else {
        // 1xx/3xx after redirects are exhausted
        Some(ErrorClass::ClientError)
    }
}

/// Parse a response body as JSON, wrapping anything else
pub fn parse_body(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "message": raw }))
}

/// Outbound call seam; implemented over HTTP and by [`crate::MockDispatcher`]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        webhook_url: &str,
        payload: &WebhookPayload,
        timeout: Duration,
    ) -> DispatchResult;
}

/// reqwest-backed dispatcher
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    config: DispatchConfig,
}

impl WebhookDispatcher {
    pub fn new(config: DispatchConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| DispatchError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn truncate(&self, body: &str) -> String {
        if body.chars().count() <= self.config.max_error_body_chars {
            body.to_string()
        } else {
            let cut: String = body.chars().take(self.config.max_error_body_chars).collect();
            format!("{}...", cut)
        }
    }

    async fn exchange(
        &self,
        webhook_url: &str,
        payload: &WebhookPayload,
        body: Vec<u8>,
    ) -> Result<(StatusCode, String), reqwest::Error> {
        let response = self
            .client
            .post(webhook_url)
            .header(CONTENT_TYPE, "application/json")
            .header(CORRELATION_HEADER, payload.correlation_id.to_string())
            .body(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    async fn dispatch(
        &self,
        webhook_url: &str,
        payload: &WebhookPayload,
        timeout: Duration,
    ) -> DispatchResult {
        let start = Instant::now();

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                return DispatchResult::failed(
                    ErrorClass::MalformedPayload,
                    None,
                    format!("Payload serialization failed: {}", e),
                    0,
                )
            }
        };

        debug!(
            job_id = %payload.job_id,
            correlation_id = %payload.correlation_id,
            url = %webhook_url,
            timeout_secs = timeout.as_secs(),
            "Dispatching webhook"
        );

        let exchange = tokio::time::timeout(timeout, self.exchange(webhook_url, payload, body)).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let (status, text) = match exchange {
            Err(_) => {
                warn!(job_id = %payload.job_id, latency_ms, "Webhook timed out");
                return DispatchResult::failed(
                    ErrorClass::Timeout,
                    None,
                    format!("No response within {}s", timeout.as_secs()),
                    latency_ms,
                );
            }
            Ok(Err(e)) if e.is_timeout() => {
                return DispatchResult::failed(ErrorClass::Timeout, None, e.to_string(), latency_ms);
            }
            Ok(Err(e)) => {
                warn!(job_id = %payload.job_id, error = %e, "Webhook request failed");
                return DispatchResult::failed(
                    ErrorClass::NetworkError,
                    None,
                    e.to_string(),
                    latency_ms,
                );
            }
            Ok(Ok(exchange)) => exchange,
        };

        match classify_status(status) {
            None => DispatchResult::ok(status.as_u16(), parse_body(&text), latency_ms),
            Some(class) => {
                warn!(
                    job_id = %payload.job_id,
                    status = status.as_u16(),
                    error_class = %class,
                    "Webhook returned error status"
                );
                let mut result = DispatchResult::failed(
                    class,
                    Some(status.as_u16()),
                    format!("HTTP {}: {}", status.as_u16(), self.truncate(&text)),
                    latency_ms,
                );
                result.body = parse_body(&text);
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(classify_status(StatusCode::ACCEPTED), None);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(ErrorClass::RateLimitedByRemote)
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            Some(ErrorClass::ClientError)
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            Some(ErrorClass::ServerError)
        );
    }

    #[test]
    fn test_non_json_body_is_wrapped() {
        assert_eq!(parse_body(r#"{"ok":true}"#), serde_json::json!({"ok": true}));
        assert_eq!(
            parse_body("done"),
            serde_json::json!({"message": "done"})
        );
    }

    #[test]
    fn test_timeout_maps_to_timeout_outcome() {
        let result = DispatchResult::failed(ErrorClass::Timeout, None, "slow", 30_000);
        assert!(matches!(result.into_outcome(), Outcome::Timeout));

        let result = DispatchResult::failed(ErrorClass::ServerError, Some(503), "HTTP 503", 12);
        assert!(matches!(
            result.into_outcome(),
            Outcome::Failure { class: ErrorClass::ServerError, .. }
        ));
    }
}
