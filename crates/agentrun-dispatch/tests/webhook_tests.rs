//! WebhookDispatcher against a local axum server

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use agentrun_dispatch::{
    DispatchConfig, Dispatcher, WebhookDispatcher, WebhookPayload, CORRELATION_HEADER,
};
use agentrun_queue::{CredentialBundle, ErrorClass};

#[derive(Clone, Default)]
struct Seen {
    bodies: Arc<Mutex<Vec<Value>>>,
    correlation_ids: Arc<Mutex<Vec<String>>>,
}

async fn echo(State(seen): State<Seen>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    if let Some(id) = headers.get(CORRELATION_HEADER).and_then(|v| v.to_str().ok()) {
        seen.correlation_ids.lock().unwrap().push(id.to_string());
    }
    seen.bodies.lock().unwrap().push(body);
    Json(json!({"ok": true}))
}

async fn spawn_server() -> (String, Seen) {
    let seen = Seen::default();
    let app = Router::new()
        .route("/ok", post(echo))
        .route("/text", post(|| async { "done" }))
        .route(
            "/busy",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "try later") }),
        )
        .route(
            "/throttle",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, Json(json!({"retry": 60}))) }),
        )
        .route(
            "/bad",
            post(|| async { (StatusCode::BAD_REQUEST, Json(json!({"error": "missing x"}))) }),
        )
        .route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        )
        .with_state(seen.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), seen)
}

fn payload() -> WebhookPayload {
    let job_id = Uuid::new_v4();
    let mut credentials = CredentialBundle::new();
    credentials.insert("api_key", "sk-1");
    WebhookPayload {
        agent_id: "digest".into(),
        agent_name: "Daily Digest".into(),
        inputs: json!({"x": 1}),
        credentials,
        timestamp: Utc::now(),
        execution_id: job_id,
        job_id,
        correlation_id: Uuid::new_v4(),
        attempt: 0,
    }
}

fn dispatcher() -> WebhookDispatcher {
    WebhookDispatcher::new(DispatchConfig::default()).unwrap()
}

#[tokio::test]
async fn test_success_delivers_payload_and_correlation_header() {
    let (base, seen) = spawn_server().await;
    let payload = payload();

    let result = dispatcher()
        .dispatch(&format!("{}/ok", base), &payload, Duration::from_secs(5))
        .await;

    assert!(result.success);
    assert_eq!(result.status_code, Some(200));
    assert_eq!(result.body, json!({"ok": true}));
    assert!(result.error_class.is_none());

    let bodies = seen.bodies.lock().unwrap();
    assert_eq!(bodies[0]["inputs"], json!({"x": 1}));
    assert_eq!(bodies[0]["credentials"]["api_key"], "sk-1");
    assert_eq!(bodies[0]["execution_id"], payload.job_id.to_string());
    assert_eq!(
        seen.correlation_ids.lock().unwrap()[0],
        payload.correlation_id.to_string()
    );
}

#[tokio::test]
async fn test_plain_text_body_is_wrapped() {
    let (base, _) = spawn_server().await;
    let result = dispatcher()
        .dispatch(&format!("{}/text", base), &payload(), Duration::from_secs(5))
        .await;
    assert!(result.success);
    assert_eq!(result.body, json!({"message": "done"}));
}

#[tokio::test]
async fn test_status_classification() {
    let (base, _) = spawn_server().await;
    let d = dispatcher();

    let cases = [
        ("busy", 503, ErrorClass::ServerError),
        ("throttle", 429, ErrorClass::RateLimitedByRemote),
        ("bad", 400, ErrorClass::ClientError),
        ("missing", 404, ErrorClass::ClientError),
    ];
    for (path, status, class) in cases {
        let result = d
            .dispatch(&format!("{}/{}", base, path), &payload(), Duration::from_secs(5))
            .await;
        assert!(!result.success, "{path}");
        assert_eq!(result.status_code, Some(status), "{path}");
        assert_eq!(result.error_class, Some(class), "{path}");
    }
}

#[tokio::test]
async fn test_timeout_is_distinct_from_network_error() {
    let (base, _) = spawn_server().await;
    let d = dispatcher();

    let slow = d
        .dispatch(&format!("{}/slow", base), &payload(), Duration::from_millis(200))
        .await;
    assert_eq!(slow.error_class, Some(ErrorClass::Timeout));
    assert!(slow.status_code.is_none());

    // Grab a free port and close it again
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let refused = d
        .dispatch(&format!("http://{}/ok", addr), &payload(), Duration::from_secs(5))
        .await;
    assert_eq!(refused.error_class, Some(ErrorClass::NetworkError));
}
