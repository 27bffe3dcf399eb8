//! In-process scenario tests for the local UI endpoints.
//!
//! The router is driven via `tower::ServiceExt::oneshot` over an agent built
//! from testkit fakes; no socket is bound.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use tower::ServiceExt; // oneshot

use payo_daemon::{routes, state};
use payo_runtime::{Agent, AgentNotice};
use payo_schemas::{HeartbeatResponse, NextPayment};
use payo_testkit::{lock_command, ok_response, response_with, TestRig};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn boot() -> (TestRig, Agent, Arc<state::AppState>) {
    let rig = TestRig::new();
    let agent = rig.agent().await.expect("agent boot");
    let st = Arc::new(state::AppState::new(
        Arc::clone(&agent.manager),
        Arc::clone(&agent.transport),
        Arc::clone(&agent.payment),
        agent.flags.clone(),
    ));
    (rig, agent, st)
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    (status, body)
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

fn overdue_schedule(code: &str) -> HeartbeatResponse {
    HeartbeatResponse {
        next_payment: Some(NextPayment {
            date_time: (Utc::now() - chrono::Duration::days(5)).to_rfc3339(),
            unlock_password: Some(code.to_string()),
        }),
        ..ok_response()
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health, /v1/status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_service_name() {
    let (_rig, _agent, st) = boot().await;
    let (status, body) = call(routes::build_router(st), get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "payo-daemon");
}

#[tokio::test]
async fn status_reports_unlocked_device_with_empty_queues() {
    let (_rig, _agent, st) = boot().await;
    let (status, body) = call(routes::build_router(st), get("/v1/status")).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["lock_state"], "NONE");
    assert_eq!(json["reason"], "UNLOCKED");
    assert_eq!(json["queued_heartbeats"], 0);
    assert_eq!(json["queued_reports"], 0);
    assert_eq!(json["tamper_flags"], serde_json::json!([]));
    assert!(json["payment_due_at"].is_null());
}

#[tokio::test]
async fn status_follows_server_lock_and_offline_queue() {
    let (rig, agent, st) = boot().await;
    rig.backend.push_response(response_with(lock_command("c1", "hard")));
    agent.heartbeat.tick().await.unwrap();
    rig.backend.set_down(true);
    agent.heartbeat.tick().await.unwrap_err();

    let (_, body) = call(routes::build_router(st), get("/v1/status")).await;
    let json = parse_json(body);
    assert_eq!(json["lock_state"], "HARD_LOCKED");
    assert_eq!(json["reason"], "ADMIN_ACTION");
    assert_eq!(json["queued_heartbeats"], 1);
    assert!(json["seq"].as_u64().unwrap() >= 1);
}

// ---------------------------------------------------------------------------
// POST /v1/unlock-code
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unlock_code_without_schedule_is_conflict() {
    let (_rig, _agent, st) = boot().await;
    let (status, body) = call(
        routes::build_router(st),
        post_json("/v1/unlock-code", serde_json::json!({ "code": "1234" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(parse_json(body)["error"].is_string());
}

#[tokio::test]
async fn unlock_code_mismatch_then_match_then_reuse() {
    let (rig, agent, st) = boot().await;
    rig.backend.push_response(overdue_schedule("778899"));
    agent.heartbeat.tick().await.unwrap();
    agent.payment.tick(Utc::now()).await;

    let router = routes::build_router(Arc::clone(&st));
    let (status, _) = call(
        router.clone(),
        post_json("/v1/unlock-code", serde_json::json!({ "code": "000000" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(
        router.clone(),
        post_json("/v1/unlock-code", serde_json::json!({ "code": " 778899 " })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parse_json(body)["lock_state"], "NONE");

    let (status, _) = call(
        router,
        post_json("/v1/unlock-code", serde_json::json!({ "code": "778899" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unlock_code_missing_field_is_unprocessable() {
    let (_rig, _agent, st) = boot().await;
    let (status, _) = call(
        routes::build_router(st),
        post_json("/v1/unlock-code", serde_json::json!({ "pin": "1" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

// ---------------------------------------------------------------------------
// GET /v1/stream and the bus
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stream_is_event_stream() {
    let (_rig, _agent, st) = boot().await;
    let resp = routes::build_router(st)
        .oneshot(get("/v1/stream"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let ct = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(ct.starts_with("text/event-stream"), "{ct}");
}

#[tokio::test]
async fn lock_changes_and_notices_reach_the_bus() {
    let (rig, agent, st) = boot().await;
    let mut rx = st.bus.subscribe();
    state::spawn_lock_forwarder(Arc::clone(&st));
    state::spawn_notice_forwarder(Arc::clone(&st), agent.notices.subscribe(), None);
    // Let the forwarders take their first watch snapshot.
    tokio::time::sleep(Duration::from_millis(20)).await;

    rig.backend.push_response(response_with(lock_command("c1", "soft")));
    agent.heartbeat.tick().await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match msg {
        state::BusMsg::LockChanged {
            previous, state, ..
        } => {
            assert_eq!(previous, "NONE");
            assert_eq!(state, "SOFT_LOCKED");
        }
        other => panic!("expected lock_changed, got {other:?}"),
    }

    agent
        .notices
        .send(AgentNotice::Log {
            level: "WARN".to_string(),
            msg: "probe".to_string(),
        })
        .unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.event_name(), "log");
    assert_eq!(
        msg,
        state::BusMsg::LogLine {
            level: "WARN".to_string(),
            msg: "probe".to_string(),
        }
    );
}
