use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use payo_schemas::{HeartbeatRequest, TamperReport};
use payo_transport::{
    verify_signature, BackendClient, HeartbeatTransport, HttpBackend, MemoryQueue, OfflineQueue,
    RetryPolicy, TransportError, HEADER_API_KEY, HEADER_SIGNATURE,
};
use serde_json::json;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(1),
        factor: 2,
        max_attempts: 2,
    }
}

fn snapshot(ts: i64) -> HeartbeatRequest {
    HeartbeatRequest {
        device_id: "dev-1".to_string(),
        timestamp_ms: ts,
        identity: Default::default(),
        security: Default::default(),
        tamper_flags: vec![],
        lock_state: "NONE".to_string(),
        acknowledged_command_ids: vec![],
        battery_level: None,
    }
}

struct Rig {
    transport: HeartbeatTransport,
    queue: Arc<MemoryQueue<HeartbeatRequest>>,
    reports: Arc<MemoryQueue<TamperReport>>,
}

fn rig(server: &MockServer) -> Rig {
    let backend = HttpBackend::new(
        server.base_url(),
        Duration::from_secs(5),
        "dak_test_key",
        Some("sig-secret".to_string()),
    )
    .unwrap();
    let queue = Arc::new(MemoryQueue::<HeartbeatRequest>::new());
    let reports = Arc::new(MemoryQueue::<TamperReport>::new());
    let transport = HeartbeatTransport::new(
        Arc::new(backend),
        queue.clone(),
        reports.clone(),
        fast_retry(),
    );
    Rig {
        transport,
        queue,
        reports,
    }
}

#[tokio::test]
async fn heartbeats_queued_while_offline_flush_in_order() {
    let server = MockServer::start_async().await;
    let r = rig(&server);

    let down = server
        .mock_async(|when, then| {
            when.method(POST).path("/devices/dev-1/data/");
            then.status(503).body("maintenance");
        })
        .await;

    for ts in [100, 200, 300] {
        let err = r.transport.send(snapshot(ts)).await.unwrap_err();
        assert!(err.is_transient());
    }
    assert_eq!(r.queue.len().await.unwrap(), 3);
    down.delete_async().await;

    // Each queued record is accepted only in order; the mocks are keyed on
    // the timestamp so an out-of-order flush leaves a mock unhit.
    let mut mocks = Vec::new();
    for ts in [100, 200, 300, 400] {
        let m = server
            .mock_async(move |when, then| {
                when.method(POST)
                    .path("/devices/dev-1/data/")
                    .header_exists(HEADER_SIGNATURE)
                    .header(HEADER_API_KEY, "dak_test_key")
                    .json_body_partial(json!({ "timestamp_ms": ts }).to_string());
                then.status(200).json_body(json!({
                    "success": true,
                    "message": format!("ok {ts}")
                }));
            })
            .await;
        mocks.push(m);
    }

    let delivery = r.transport.send(snapshot(400)).await.unwrap();
    assert_eq!(delivery.flushed.len(), 3);
    let messages: Vec<_> = delivery
        .responses()
        .map(|resp| resp.message.clone().unwrap())
        .collect();
    assert_eq!(messages, vec!["ok 100", "ok 200", "ok 300", "ok 400"]);
    assert_eq!(r.queue.len().await.unwrap(), 0);
    for m in &mocks {
        m.assert_async().await;
    }
}

#[tokio::test]
async fn failure_mid_flush_returns_what_was_delivered() {
    let server = MockServer::start_async().await;
    let r = rig(&server);
    r.queue.push(&snapshot(100)).await.unwrap();
    r.queue.push(&snapshot(200)).await.unwrap();

    let first = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/devices/dev-1/data/")
                .json_body_partial(json!({ "timestamp_ms": 100 }).to_string());
            then.status(200).json_body(json!({
                "success": true,
                "message": "ok 100",
                "next_payment": {
                    "date_time": "2026-03-10T20:59:00Z",
                    "unlock_password": "481516"
                }
            }));
        })
        .await;
    for ts in [200, 300] {
        server
            .mock_async(move |when, then| {
                when.method(POST)
                    .path("/devices/dev-1/data/")
                    .json_body_partial(json!({ "timestamp_ms": ts }).to_string());
                then.status(503).body("maintenance");
            })
            .await;
    }

    let err = r.transport.send(snapshot(300)).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(err.flushed.len(), 1);
    assert_eq!(err.flushed[0].message.as_deref(), Some("ok 100"));
    assert!(err.flushed[0].next_payment.is_some());
    // 200 stays queued ahead of the new snapshot.
    assert_eq!(r.queue.len().await.unwrap(), 2);
    assert_eq!(r.queue.oldest().await.unwrap().unwrap().item.timestamp_ms, 200);
    first.assert_async().await;
}

#[tokio::test]
async fn rejected_heartbeat_is_not_queued() {
    let server = MockServer::start_async().await;
    let r = rig(&server);
    let m = server
        .mock_async(|when, then| {
            when.method(POST).path("/devices/dev-1/data/");
            then.status(401).body("bad key");
        })
        .await;

    let err = r.transport.send(snapshot(1)).await.unwrap_err();
    assert!(matches!(err.error, TransportError::Rejected { status: 401, .. }));
    assert_eq!(r.queue.len().await.unwrap(), 0);
    // 4xx is not retried
    assert_eq!(m.hits_async().await, 1);
}

#[tokio::test]
async fn success_false_envelope_is_rejection() {
    let server = MockServer::start_async().await;
    let r = rig(&server);
    server
        .mock_async(|when, then| {
            when.method(POST).path("/devices/dev-1/data/");
            then.status(200)
                .json_body(json!({"success": false, "message": "unknown device"}));
        })
        .await;

    let err = r.transport.send(snapshot(1)).await.unwrap_err();
    match err.error {
        TransportError::Rejected { message, .. } => assert_eq!(message, "unknown device"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn tamper_reports_queue_then_flush() {
    let server = MockServer::start_async().await;
    let r = rig(&server);
    let down = server
        .mock_async(|when, then| {
            when.method(POST).path("/tamper/mobile/dev-1/report/");
            then.status(502);
        })
        .await;

    let report = TamperReport {
        event_id: uuid::Uuid::new_v4(),
        device_id: "dev-1".to_string(),
        tamper_type: "DEVELOPER_MODE".to_string(),
        severity: "HIGH".to_string(),
        detected_at: chrono::Utc::now(),
        details: "developer options enabled".to_string(),
        timestamp_ms: 10,
        lock_state: "HARD_LOCKED".to_string(),
    };
    assert!(!r.transport.report_tamper(report.clone()).await.unwrap());
    assert_eq!(r.reports.len().await.unwrap(), 1);
    down.delete_async().await;

    let up = server
        .mock_async(|when, then| {
            when.method(POST).path("/tamper/mobile/dev-1/report/");
            then.status(201).json_body(json!({"success": true}));
        })
        .await;
    let outcome = r.transport.flush_reports().await.unwrap();
    assert!(outcome.drained);
    assert_eq!(outcome.delivered, 1);
    assert_eq!(r.reports.len().await.unwrap(), 0);
    up.assert_async().await;
}

#[tokio::test]
async fn signature_header_verifies() {
    let server = MockServer::start_async().await;
    let backend = HttpBackend::new(
        server.base_url(),
        Duration::from_secs(5),
        "dak_k",
        Some("sig-secret".to_string()),
    )
    .unwrap();
    let m = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/devices/dev-1/confirm-deactivation/")
                .matches(|req| {
                    let header = |name: &str| {
                        req.headers.as_ref().and_then(|hs| {
                            hs.iter()
                                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                                .map(|(_, v)| v.clone())
                        })
                    };
                    let (Some(ts), Some(sig)) = (header("X-Timestamp"), header("X-Signature"))
                    else {
                        return false;
                    };
                    let body = req.body.clone().unwrap_or_default();
                    verify_signature("sig-secret", &ts, &body, &sig)
                });
            then.status(200).json_body(json!({"success": true}));
        })
        .await;

    backend
        .confirm_deactivation(
            "dev-1",
            &payo_schemas::DeactivationConfirm {
                status: payo_schemas::ConfirmStatus::Success,
                message: "done".to_string(),
            },
        )
        .await
        .unwrap();
    m.assert_async().await;
}
