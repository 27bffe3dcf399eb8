//! Shared runtime state for payo-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The agent owns all
//! behaviour; this module only holds handles into it plus the SSE bus, and
//! the forwarders that feed that bus.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use payo_db::HeartbeatHistoryRow;
use payo_lock::LockStateManager;
use payo_runtime::{AgentHandle, AgentNotice, PaymentTracker, TamperFlags};
use payo_transport::HeartbeatTransport;

const BUS_CAPACITY: usize = 1024;
const HEARTBEAT_HISTORY_KEEP: i64 = 500;

// ---------------------------------------------------------------------------
// BusMsg (SSE event bus payload)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    LockChanged {
        previous: String,
        state: String,
        reason: String,
        message: String,
        seq: u64,
    },
    Heartbeat {
        ts_millis: i64,
        delivered: bool,
        queued_heartbeats: usize,
    },
    Tamper {
        tamper_type: String,
        severity: String,
        lock_state: String,
    },
    LogLine {
        level: String,
        msg: String,
    },
}

impl BusMsg {
    pub fn event_name(&self) -> &'static str {
        match self {
            BusMsg::LockChanged { .. } => "lock_changed",
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::Tamper { .. } => "tamper",
            BusMsg::LogLine { .. } => "log",
        }
    }
}

impl From<AgentNotice> for BusMsg {
    fn from(n: AgentNotice) -> Self {
        match n {
            AgentNotice::Heartbeat {
                ts_millis,
                delivered,
                queued_heartbeats,
            } => BusMsg::Heartbeat {
                ts_millis,
                delivered,
                queued_heartbeats,
            },
            AgentNotice::Tamper {
                tamper_type,
                severity,
                lock_state,
            } => BusMsg::Tamper {
                tamper_type,
                severity,
                lock_state,
            },
            AgentNotice::Log { level, msg } => BusMsg::LogLine { level, msg },
        }
    }
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub manager: Arc<LockStateManager>,
    pub transport: Arc<HeartbeatTransport>,
    pub payment: Arc<PaymentTracker>,
    pub flags: TamperFlags,
}

impl AppState {
    pub fn new(
        manager: Arc<LockStateManager>,
        transport: Arc<HeartbeatTransport>,
        payment: Arc<PaymentTracker>,
        flags: TamperFlags,
    ) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(BUS_CAPACITY);
        Self {
            bus,
            build: BuildInfo {
                service: "payo-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            manager,
            transport,
            payment,
            flags,
        }
    }

    pub fn from_handle(handle: &AgentHandle) -> Self {
        Self::new(
            Arc::clone(&handle.manager),
            Arc::clone(&handle.transport),
            Arc::clone(&handle.payment),
            handle.flags.clone(),
        )
    }
}

// ---------------------------------------------------------------------------
// Forwarders
// ---------------------------------------------------------------------------

/// Publishes every lock record change on the bus.
pub fn spawn_lock_forwarder(state: Arc<AppState>) -> JoinHandle<()> {
    let mut rx = state.manager.subscribe();
    tokio::spawn(async move {
        let mut previous = rx.borrow_and_update().state;
        while rx.changed().await.is_ok() {
            let record = rx.borrow_and_update().clone();
            let _ = state.bus.send(BusMsg::LockChanged {
                previous: previous.as_str().to_string(),
                state: record.state.as_str().to_string(),
                reason: serde_json::to_value(record.reason.category)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                message: record.reason.message.clone(),
                seq: record.seq,
            });
            previous = record.state;
        }
    })
}

/// Relays agent notices onto the bus. With a pool, heartbeats are also kept
/// in the local history table.
pub fn spawn_notice_forwarder(
    state: Arc<AppState>,
    mut notices: broadcast::Receiver<AgentNotice>,
    history: Option<SqlitePool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let notice = match notices.recv().await {
                Ok(n) => n,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notice forwarder lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if let (Some(pool), AgentNotice::Heartbeat { ts_millis, delivered, queued_heartbeats }) =
                (&history, &notice)
            {
                let row = HeartbeatHistoryRow {
                    timestamp_ms: *ts_millis,
                    delivered: *delivered,
                    lock_state: state.manager.state().as_str().to_string(),
                    detail: Some(format!("queued={queued_heartbeats}")),
                };
                if let Err(e) = payo_db::record_heartbeat(pool, &row).await {
                    tracing::warn!(error = %e, "heartbeat history write failed");
                } else if let Err(e) =
                    payo_db::prune_heartbeat_history(pool, HEARTBEAT_HISTORY_KEEP).await
                {
                    tracing::warn!(error = %e, "heartbeat history prune failed");
                }
            }
            let _ = state.bus.send(BusMsg::from(notice));
        }
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}
