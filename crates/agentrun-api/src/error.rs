//! API error types with proper HTTP mapping

use agentrun_queue::{AdmissionError, QueueError, ScheduleError};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// API result type alias
pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent inactive: {0}")]
    AgentInactive(String),

    #[error("Not entitled: {0}")]
    NotEntitled(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: i64,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut details = None;
        let mut retry_after = None;
        let (status, code, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::AgentNotFound(msg) => {
                (StatusCode::NOT_FOUND, "AGENT_NOT_FOUND", msg.clone())
            }
            ApiError::AgentInactive(msg) => (StatusCode::CONFLICT, "AGENT_INACTIVE", msg.clone()),
            ApiError::NotEntitled(msg) => (StatusCode::FORBIDDEN, "NOT_ENTITLED", msg.clone()),
            ApiError::MissingCredential(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "MISSING_CREDENTIAL",
                msg.clone(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::RateLimited {
                message,
                retry_after_secs,
            } => {
                let secs = (*retry_after_secs).max(1);
                retry_after = Some(secs);
                details = Some(serde_json::json!({ "retry_after_secs": secs }));
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", message.clone())
            }
            ApiError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                msg.clone(),
            ),
            ApiError::Internal(msg) => {
                // Don't expose internal errors to clients
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
            ApiError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        let message = e.to_string();
        match e {
            AdmissionError::RateLimitExceeded {
                retry_after_secs, ..
            } => ApiError::RateLimited {
                message,
                retry_after_secs,
            },
            AdmissionError::AgentNotFound(_) => ApiError::AgentNotFound(message),
            AdmissionError::AgentInactive(_) => ApiError::AgentInactive(message),
            AdmissionError::UserNotEntitled { .. } => ApiError::NotEntitled(message),
            AdmissionError::MissingCredential(_) => ApiError::MissingCredential(message),
            AdmissionError::InvalidPayload(msg) => ApiError::Validation(msg),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Admission(e) => e.into(),
            QueueError::NotFound => ApiError::NotFound("Execution not found".to_string()),
            QueueError::InvalidTransition { .. } | QueueError::LeaseLost(_) => {
                ApiError::Conflict(e.to_string())
            }
            QueueError::Backend(_) | QueueError::Serialization(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<ScheduleError> for ApiError {
    fn from(e: ScheduleError) -> Self {
        match e {
            ScheduleError::InvalidCron { .. }
            | ScheduleError::InvalidTimezone(_)
            | ScheduleError::NoUpcoming(_) => ApiError::Validation(e.to_string()),
            ScheduleError::NotFound => ApiError::NotFound("Schedule not found".to_string()),
            ScheduleError::Backend(msg) => ApiError::Internal(msg),
        }
    }
}
