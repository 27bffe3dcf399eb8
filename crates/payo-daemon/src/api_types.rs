//! Request and response types for the local UI endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests. No business logic lives here.

use serde::{Deserialize, Serialize};

use payo_lock::{LockState, ReasonCategory, Severity};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
}

// ---------------------------------------------------------------------------
// /v1/status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    pub lock_state: LockState,
    pub reason: ReasonCategory,
    pub severity: Severity,
    /// Headline shown on the lock overlay.
    pub message: String,
    pub seq: u64,
    pub changed_at_ms: i64,
    /// `None` when the queue could not be read.
    pub queued_heartbeats: Option<usize>,
    pub queued_reports: Option<usize>,
    pub tamper_flags: Vec<String>,
    /// RFC 3339.
    pub payment_due_at: Option<String>,
}

// ---------------------------------------------------------------------------
// /v1/unlock-code
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockCodeRequest {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockCodeResponse {
    pub lock_state: LockState,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
