//! HTTP API 통합 테스트 (HostEngine, tower oneshot)

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use labterm_foundation::EngineConfig;
use labterm_server::{create_router, AppState};
use labterm_session::{HostEngine, LabEngine};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn app() -> (Router, Arc<LabEngine>) {
    let host = Arc::new(HostEngine::new());
    let engine = Arc::new(LabEngine::with_engine(EngineConfig::default(), host).expect("engine"));
    (create_router(AppState::new(engine.clone())), engine)
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_exec(owner: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/exec")
        .header("content-type", "application/json");
    if let Some(owner) = owner {
        builder = builder.header("x-owner-id", owner);
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

fn get(uri: &str, owner: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(owner) = owner {
        builder = builder.header("x-owner-id", owner);
    }
    builder.body(Body::empty()).expect("request")
}

#[tokio::test]
async fn test_health() {
    let (app, _engine) = app();
    let (status, body) = call(&app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["engine"], "host");
    assert_eq!(body["engine_available"], true);
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn test_exec_rejected_is_422() {
    let (app, engine) = app();
    let (status, body) = call(&app, post_exec(Some("alice"), json!({"command": "rm -rf /"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation_rejected");
    assert!(body["error"].as_str().is_some());
    assert!(engine.manager().registry().is_empty().await);
}

#[tokio::test]
async fn test_exec_requires_owner() {
    let (app, _engine) = app();
    let (status, body) = call(&app, post_exec(None, json!({"command": "ls"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "owner_missing");
}

#[tokio::test]
async fn test_exec_accepted_and_job_visible() {
    let (app, _engine) = app();
    let (status, body) = call(
        &app,
        post_exec(Some("alice"), json!({"command": "echo hi", "options": {"timeout_secs": 5}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().expect("job id").to_string();

    let uri = format!("/api/jobs/{}", job_id);
    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let (status, body) = call(&app, get(&uri, Some("alice"))).await;
            assert_eq!(status, StatusCode::OK);
            if body["state"] == "completed" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("job finished");
    assert_eq!(finished["result"]["stdout"].as_str().map(str::trim), Some("hi"));

    // someone else's job is not found
    let (status, _) = call(&app, get(&uri, Some("mallory"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_job_id_must_parse() {
    let (app, _engine) = app();
    let (status, body) = call(&app, get("/api/jobs/not-a-uuid", Some("alice"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");
}

#[tokio::test]
async fn test_sessions_listing_is_per_owner() {
    let (app, _engine) = app();
    let (status, body) = call(&app, get("/api/sessions", Some("alice"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = call(&app, get("/api/sessions", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
