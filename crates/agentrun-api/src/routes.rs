//! API routes for AgentRun endpoints

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agentrun_queue::{
    job::{HIGHEST_PRIORITY, LOWEST_PRIORITY},
    DailyRollup, ExecutionJob, HistoryEntry, JobId, JobStatus, JobSummary, NewJob, Schedule,
    TriggerType, Worker,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;
const DEFAULT_ANALYTICS_DAYS: i64 = 30;
const MAX_ANALYTICS_DAYS: i64 = 365;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: state.queue().clock().now(),
    })
}

/// Prometheus text exposition of the runtime counters
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics().snapshot().to_prometheus(),
    )
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_trigger() -> TriggerType {
    TriggerType::Api
}

/// Execution trigger request
#[derive(Debug, Deserialize)]
pub struct ExecutionRequest {
    pub agent_id: String,
    pub user_id: String,
    #[serde(default = "default_trigger")]
    pub trigger_type: TriggerType,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
    pub priority: Option<u8>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl ExecutionRequest {
    fn validate(&self) -> ApiResult<()> {
        if self.agent_id.trim().is_empty() {
            return Err(ApiError::Validation("agent_id must not be empty".to_string()));
        }
        if self.user_id.trim().is_empty() {
            return Err(ApiError::Validation("user_id must not be empty".to_string()));
        }
        validate_priority(self.priority)?;
        if self.max_attempts == Some(0) {
            return Err(ApiError::Validation("max_attempts must be at least 1".to_string()));
        }
        if self.timeout_secs == Some(0) {
            return Err(ApiError::Validation("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    fn into_new_job(self) -> NewJob {
        let mut job = NewJob::new(self.agent_id, self.user_id, self.trigger_type, self.payload);
        if let Some(priority) = self.priority {
            job = job.with_priority(priority);
        }
        if let Some(at) = self.scheduled_for {
            job = job.scheduled_for(at);
        }
        if let Some(max_attempts) = self.max_attempts {
            job = job.with_max_attempts(max_attempts);
        }
        if let Some(secs) = self.timeout_secs {
            job = job.with_timeout_secs(secs);
        }
        job
    }
}

fn validate_priority(priority: Option<u8>) -> ApiResult<()> {
    match priority {
        Some(p) if !(HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&p) => Err(ApiError::Validation(
            format!("priority must be between {HIGHEST_PRIORITY} and {LOWEST_PRIORITY}"),
        )),
        _ => Ok(()),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionAccepted {
    pub job_id: JobId,
    pub status: JobStatus,
}

pub async fn create_execution(
    State(state): State<AppState>,
    Json(req): Json<ExecutionRequest>,
) -> ApiResult<(StatusCode, Json<ExecutionAccepted>)> {
    req.validate()?;
    let job_id = state.queue().enqueue(req.into_new_job()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ExecutionAccepted {
            job_id,
            status: JobStatus::Queued,
        }),
    ))
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionJob>> {
    Ok(Json(state.queue().get_job(id).await?))
}

pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionAccepted>> {
    state.queue().cancel(id).await?;
    Ok(Json(ExecutionAccepted {
        job_id: id,
        status: JobStatus::Cancelled,
    }))
}

#[derive(Debug, Serialize)]
pub struct ExecutionHistoryResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub entries: Vec<HistoryEntry>,
}

pub async fn execution_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ExecutionHistoryResponse>> {
    let job = state.queue().get_job(id).await?;
    let entries = state.queue().history().entries_for_job(id).await?;
    Ok(Json(ExecutionHistoryResponse {
        job_id: id,
        status: job.status,
        entries,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub user_id: String,
    pub executions: Vec<JobSummary>,
}

pub async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let user_id = query
        .user_id
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("user_id is required".to_string()))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let executions = state
        .queue()
        .history()
        .get_execution_history(&user_id, query.agent_id.as_deref(), limit)
        .await?;
    Ok(Json(HistoryResponse {
        user_id,
        executions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AnalyticsResponse {
    pub agent_id: String,
    pub days: i64,
    pub rollups: Vec<DailyRollup>,
}

pub async fn agent_analytics(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<AnalyticsQuery>,
) -> ApiResult<Json<AnalyticsResponse>> {
    let days = query.days.unwrap_or(DEFAULT_ANALYTICS_DAYS);
    if !(1..=MAX_ANALYTICS_DAYS).contains(&days) {
        return Err(ApiError::Validation(format!(
            "days must be between 1 and {MAX_ANALYTICS_DAYS}"
        )));
    }
    let since = state.queue().clock().now() - Duration::days(days);
    let rollups = state.queue().history().daily_rollups(&agent_id, since).await?;
    Ok(Json(AnalyticsResponse {
        agent_id,
        days,
        rollups,
    }))
}

pub async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<Vec<Worker>>> {
    Ok(Json(state.leases().workers().await?))
}

/// Schedule creation request
#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub agent_id: String,
    pub user_id: String,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
    pub priority: Option<u8>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<CreateScheduleRequest>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    let scheduler = state
        .scheduler()
        .ok_or_else(|| ApiError::ServiceUnavailable("Scheduling is not enabled".to_string()))?;
    validate_priority(req.priority)?;
    if !req.payload.is_object() {
        return Err(ApiError::Validation("payload must be a JSON object".to_string()));
    }

    let directory = state.queue().directory();
    let agent = directory
        .agent(&req.agent_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::AgentNotFound(req.agent_id.clone()))?;
    if !agent.active {
        return Err(ApiError::AgentInactive(req.agent_id));
    }
    let entitled = directory
        .is_entitled(&req.agent_id, &req.user_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if !entitled {
        return Err(ApiError::NotEntitled(format!(
            "User {} is not entitled to agent {}",
            req.user_id, req.agent_id
        )));
    }

    let schedule = scheduler
        .create_schedule(
            &req.agent_id,
            &req.user_id,
            &req.cron_expression,
            &req.timezone,
            req.payload,
            req.priority,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Schedule>> {
    let store = state
        .queue()
        .schedules()
        .ok_or_else(|| ApiError::ServiceUnavailable("Scheduling is not enabled".to_string()))?;
    store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Schedule not found".to_string()))
}

/// Build the API router
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/executions", post(create_execution))
        .route("/api/v1/executions/{id}", get(get_execution))
        .route("/api/v1/executions/{id}/cancel", post(cancel_execution))
        .route("/api/v1/executions/{id}/history", get(execution_history))
        .route("/api/v1/history", get(list_history))
        .route("/api/v1/agents/{agent_id}/analytics", get(agent_analytics))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/schedules", post(create_schedule))
        .route("/api/v1/schedules/{id}", get(get_schedule))
        .with_state(state)
}
