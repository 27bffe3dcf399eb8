//! Axum router and HTTP handlers for the local lock-screen UI.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)` so the router is the only
//! surface tests compose.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use payo_lock::LockError;
use payo_runtime::UnlockCodeError;

use crate::{
    api_types::{
        ErrorResponse, HealthResponse, StatusResponse, UnlockCodeRequest, UnlockCodeResponse,
    },
    state::{uptime_secs, AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/unlock-code", post(unlock_code))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let record = st.manager.record();
    let queued_heartbeats = st.transport.queued_heartbeats().await.ok();
    let queued_reports = st.transport.queued_reports().await.ok();

    Json(StatusResponse {
        daemon_uptime_secs: uptime_secs(),
        lock_state: record.state,
        reason: record.reason.category,
        severity: record.reason.severity,
        message: record.reason.message,
        seq: record.seq,
        changed_at_ms: record.changed_at_ms,
        queued_heartbeats,
        queued_reports,
        tamper_flags: st.flags.names(),
        payment_due_at: st.payment.due_at().map(|d| d.to_rfc3339()),
    })
}

// ---------------------------------------------------------------------------
// POST /v1/unlock-code
// ---------------------------------------------------------------------------

pub(crate) async fn unlock_code(
    State(st): State<Arc<AppState>>,
    Json(req): Json<UnlockCodeRequest>,
) -> Response {
    match st.payment.unlock_with_code(req.code.trim()).await {
        Ok(lock_state) => {
            info!(lock_state = %lock_state.as_str(), "offline unlock code accepted");
            let _ = st.bus.send(BusMsg::LogLine {
                level: "INFO".to_string(),
                msg: "unlock code accepted".to_string(),
            });
            (StatusCode::OK, Json(UnlockCodeResponse { lock_state })).into_response()
        }
        Err(e) => {
            let status = unlock_error_status(&e);
            info!(status = status.as_u16(), error = %e, "offline unlock code refused");
            (
                status,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

fn unlock_error_status(e: &UnlockCodeError) -> StatusCode {
    match e {
        UnlockCodeError::Mismatch | UnlockCodeError::AlreadyUsed => StatusCode::FORBIDDEN,
        UnlockCodeError::NoCode | UnlockCodeError::Lock(LockError::Rejected(_)) => {
            StatusCode::CONFLICT
        }
        UnlockCodeError::Lock(LockError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(m.event_name()).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
