use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

use agentrun_api::{api_router, ApiServer, AppState, ServerConfig};
use agentrun_queue::{
    AgentRecord, ExecutionQueue, LeaseManager, ManualClock, MemoryCredentials, MemoryDirectory,
    MemoryQueue, MemoryRateLimitBackend, MemoryScheduleStore, Outcome, RateLimiter, RateLimits,
};

struct TestApp {
    router: Router,
    queue: Arc<ExecutionQueue>,
}

async fn setup(with_schedules: bool) -> TestApp {
    let clock = Arc::new(ManualClock::starting_now());

    let directory = Arc::new(MemoryDirectory::new());
    directory
        .register(
            AgentRecord::new("digest", "Daily Digest", "https://agents.example/digest")
                .with_required_fields(["api_key"]),
        )
        .await;
    directory
        .register(
            AgentRecord::new("scarce", "Scarce", "https://agents.example/scarce").with_rate_limits(
                RateLimits {
                    per_minute: Some(1),
                    per_hour: None,
                    per_day: None,
                },
            ),
        )
        .await;
    directory
        .register(AgentRecord::new("retired", "Retired", "https://agents.example/retired"))
        .await;
    directory.set_active("retired", false).await;
    for agent in ["digest", "scarce", "retired"] {
        directory.install(agent, "alice").await;
    }
    directory.install("digest", "bob").await;

    let credentials = Arc::new(MemoryCredentials::new(clock.clone()));
    credentials.set("digest", "alice", "api_key", "sk-alice").await;

    let mut builder =
        ExecutionQueue::builder(Arc::new(MemoryQueue::new()), directory, credentials)
            .clock(clock.clone())
            .rate_limiter(RateLimiter::new(
                Arc::new(MemoryRateLimitBackend::new()),
                RateLimits::unlimited(),
                clock.clone(),
            ));
    if with_schedules {
        builder = builder.schedules(Arc::new(MemoryScheduleStore::new()));
    }
    let queue = Arc::new(builder.build());

    TestApp {
        router: api_router(AppState::new(queue.clone())),
        queue,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    router.clone().oneshot(req).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn error_code(response: Response) -> String {
    json_body(response).await["error"]["code"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn execution(agent: &str, user: &str) -> Value {
    json!({
        "agent_id": agent,
        "user_id": user,
        "trigger_type": "manual",
        "payload": {"topic": "rust"}
    })
}

#[tokio::test]
async fn test_health() {
    let app = setup(false).await;
    let response = send(&app.router, "GET", "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "healthy");
}

#[tokio::test]
async fn test_execution_lifecycle() {
    let app = setup(false).await;

    let response = send(&app.router, "POST", "/api/v1/executions", Some(execution("digest", "alice"))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["status"], "queued");
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let response = send(&app.router, "GET", &format!("/api/v1/executions/{job_id}"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = json_body(response).await;
    assert_eq!(job["agent_id"], "digest");
    assert_eq!(job["trigger_type"], "manual");
    assert_eq!(job["payload"]["topic"], "rust");

    let response = send(&app.router, "GET", &format!("/api/v1/executions/{job_id}/history"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let history = json_body(response).await;
    assert_eq!(history["entries"][0]["phase"], "init");

    let response = send(&app.router, "POST", &format!("/api/v1/executions/{job_id}/cancel"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "cancelled");

    // Terminal jobs cannot be cancelled again
    let response = send(&app.router, "POST", &format!("/api/v1/executions/{job_id}/cancel"), None).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_admission_errors() {
    let app = setup(false).await;

    let response = send(&app.router, "POST", "/api/v1/executions", Some(execution("ghost", "alice"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "AGENT_NOT_FOUND");

    let response = send(&app.router, "POST", "/api/v1/executions", Some(execution("retired", "alice"))).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(error_code(response).await, "AGENT_INACTIVE");

    let response = send(&app.router, "POST", "/api/v1/executions", Some(execution("scarce", "mallory"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "NOT_ENTITLED");

    // bob is entitled but never stored an api_key
    let response = send(&app.router, "POST", "/api/v1/executions", Some(execution("digest", "bob"))).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(response).await, "MISSING_CREDENTIAL");

    let response = send(&app.router, "POST", "/api/v1/executions", Some(execution("scarce", "alice"))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let response = send(&app.router, "POST", "/api/v1/executions", Some(execution("scarce", "alice"))).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    assert_eq!(error_code(response).await, "RATE_LIMITED");

    let snapshot = app.queue.metrics().snapshot();
    assert_eq!(snapshot.enqueued, 1);
    assert_eq!(snapshot.rate_limited, 1);
}

#[tokio::test]
async fn test_request_validation() {
    let app = setup(false).await;

    let mut bad_priority = execution("digest", "alice");
    bad_priority["priority"] = json!(11);
    let response = send(&app.router, "POST", "/api/v1/executions", Some(bad_priority)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(response).await, "VALIDATION_ERROR");

    let mut bad_payload = execution("digest", "alice");
    bad_payload["payload"] = json!([1, 2, 3]);
    let response = send(&app.router, "POST", "/api/v1/executions", Some(bad_payload)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(response).await, "VALIDATION_ERROR");

    let response = send(&app.router, "GET", "/api/v1/history", None).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = send(&app.router, "GET", "/api/v1/agents/digest/analytics?days=0", None).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let missing = uuid::Uuid::new_v4();
    let response = send(&app.router, "GET", &format!("/api/v1/executions/{missing}"), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_history_and_analytics() {
    let app = setup(false).await;
    for _ in 0..3 {
        let response = send(&app.router, "POST", "/api/v1/executions", Some(execution("digest", "alice"))).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let first = app.queue.claim_next("w1", 2).await.unwrap().unwrap();
    app.queue
        .complete(first.id, "w1", Outcome::Success(json!({"ok": true})))
        .await
        .unwrap();
    let second = app.queue.claim_next("w1", 2).await.unwrap().unwrap();
    app.queue
        .complete(second.id, "w1", Outcome::failure(agentrun_queue::ErrorClass::ClientError, "HTTP 400"))
        .await
        .unwrap();

    let response = send(&app.router, "GET", "/api/v1/history?user_id=alice&agent_id=digest&limit=2", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["executions"].as_array().unwrap().len(), 2);

    let response = send(&app.router, "GET", "/api/v1/agents/digest/analytics?days=7", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let rollups = body["rollups"].as_array().unwrap();
    assert_eq!(rollups.len(), 1);
    assert_eq!(rollups[0]["total_runs"], 2);
    assert_eq!(rollups[0]["successful_runs"], 1);
    assert_eq!(rollups[0]["failed_runs"], 1);
    assert_eq!(rollups[0]["unique_users"], 1);
}

#[tokio::test]
async fn test_workers_and_metrics() {
    let app = setup(false).await;
    LeaseManager::new(app.queue.clone())
        .heartbeat("worker-a", 4, 1)
        .await
        .unwrap();

    let response = send(&app.router, "GET", "/api/v1/workers", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let workers = json_body(response).await;
    assert_eq!(workers[0]["id"], "worker-a");
    assert_eq!(workers[0]["capacity"], 4);

    send(&app.router, "POST", "/api/v1/executions", Some(execution("digest", "alice"))).await;
    let response = send(&app.router, "GET", "/metrics", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("agentrun_jobs_enqueued_total 1"));
}

#[tokio::test]
async fn test_schedules() {
    let app = setup(true).await;

    let response = send(
        &app.router,
        "POST",
        "/api/v1/schedules",
        Some(json!({
            "agent_id": "digest",
            "user_id": "alice",
            "cron_expression": "0 9 * * *",
            "timezone": "Europe/Berlin",
            "payload": {"kind": "morning"},
            "priority": 2
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let schedule = json_body(response).await;
    assert_eq!(schedule["active"], true);
    assert_eq!(schedule["priority"], 2);
    let id = schedule["id"].as_str().unwrap().to_string();

    let response = send(&app.router, "GET", &format!("/api/v1/schedules/{id}"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["timezone"], "Europe/Berlin");

    let response = send(
        &app.router,
        "POST",
        "/api/v1/schedules",
        Some(json!({"agent_id": "digest", "user_id": "alice", "cron_expression": "every day"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = send(
        &app.router,
        "POST",
        "/api/v1/schedules",
        Some(json!({"agent_id": "digest", "user_id": "mallory", "cron_expression": "0 9 * * *"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_schedules_disabled_without_store() {
    let app = setup(false).await;
    let response = send(
        &app.router,
        "POST",
        "/api/v1/schedules",
        Some(json!({"agent_id": "digest", "user_id": "alice", "cron_expression": "0 9 * * *"})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = setup(false).await;
    let router = ApiServer::new(ServerConfig::default(), AppState::new(app.queue.clone())).router();

    let req = Request::builder()
        .uri("/health")
        .header("X-Request-ID", "req-123")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "req-123");

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = router.oneshot(req).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}
