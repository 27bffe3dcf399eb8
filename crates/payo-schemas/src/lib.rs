//! Wire types exchanged between the device agent and the loan backend.
//!
//! Field names follow the backend's JSON contract exactly; no business logic
//! lives here beyond small accessors over optional fields.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Command value the backend uses inside the `deactivation` block.
pub const DEACTIVATE_NOW: &str = "DEACTIVATE_NOW";

// ---------------------------------------------------------------------------
// Heartbeat request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub android_id: Option<String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    pub os_version: Option<String>,
    pub sdk_version: Option<String>,
    pub security_patch_level: Option<String>,
    #[serde(default)]
    pub device_imeis: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFlags {
    pub is_device_rooted: bool,
    pub is_usb_debugging_enabled: bool,
    pub is_developer_mode_enabled: bool,
    pub is_bootloader_unlocked: bool,
    pub is_custom_rom: bool,
}

/// Periodic status snapshot posted to `POST /devices/{id}/data/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub device_id: String,
    /// Strictly increasing per device; the offline queue flushes in this order.
    pub timestamp_ms: i64,
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    #[serde(flatten)]
    pub security: SecurityFlags,
    #[serde(default)]
    pub tamper_flags: Vec<String>,
    /// Persisted lock state at snapshot time ("NONE", "HARD_LOCKED", ...).
    pub lock_state: String,
    /// Command ids processed since the last delivered heartbeat.
    #[serde(default)]
    pub acknowledged_command_ids: Vec<String>,
    pub battery_level: Option<u8>,
}

// ---------------------------------------------------------------------------
// Heartbeat response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockContent {
    pub is_locked: bool,
    pub reason: Option<String>,
}

impl LockContent {
    /// Translate the lock flag into a typed command.
    ///
    /// The flag repeats on every response, so callers only translate a
    /// change. `seq` scopes the id to the lock record the change was seen
    /// against; the same change seen twice collapses into one ledger entry.
    pub fn as_command(&self, seq: u64) -> PendingCommand {
        let kind = if self.is_locked {
            CommandKind::Lock
        } else {
            CommandKind::Unlock
        };
        PendingCommand {
            command_id: format!("content:{}:{seq}", kind.as_str()),
            kind,
            reason: self.reason.clone(),
            severity: None,
            parameters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextPayment {
    /// RFC 3339 end-of-day due time.
    pub date_time: String,
    pub unlock_password: Option<String>,
}

impl NextPayment {
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.date_time)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationDirective {
    /// "requested" | "none"
    pub status: String,
    pub command: Option<String>,
    pub reason: Option<String>,
    pub agent_notice: Option<String>,
    pub loan_number: Option<String>,
}

impl DeactivationDirective {
    pub fn is_requested(&self) -> bool {
        self.command.as_deref() == Some(DEACTIVATE_NOW)
    }

    /// Translate the directive into a typed command.
    ///
    /// The id is derived from the loan so repeated directives across
    /// heartbeats collapse into one ledger entry.
    pub fn as_command(&self) -> Option<PendingCommand> {
        if !self.is_requested() {
            return None;
        }
        let scope = self.loan_number.as_deref().unwrap_or("device");
        Some(PendingCommand {
            command_id: format!("deactivate:{scope}"),
            kind: CommandKind::Deactivate,
            reason: self.reason.clone(),
            severity: None,
            parameters: BTreeMap::new(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub success: bool,
    pub message: Option<String>,
    pub content: Option<LockContent>,
    pub server_time: Option<String>,
    pub next_payment: Option<NextPayment>,
    pub deactivation: Option<DeactivationDirective>,
    pub command: Option<PendingCommand>,
}

impl HeartbeatResponse {
    /// All commands carried by this response, explicit command first.
    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        let mut out = Vec::new();
        if let Some(cmd) = &self.command {
            out.push(cmd.clone());
        }
        let explicit_deactivate = matches!(
            self.command.as_ref().map(|c| c.kind),
            Some(CommandKind::Deactivate)
        );
        if !explicit_deactivate {
            if let Some(cmd) = self.deactivation.as_ref().and_then(|d| d.as_command()) {
                out.push(cmd);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Lock,
    Unlock,
    Wipe,
    Deactivate,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Lock => "lock",
            CommandKind::Unlock => "unlock",
            CommandKind::Wipe => "wipe",
            CommandKind::Deactivate => "deactivate",
        }
    }
}

/// Server-issued instruction. `command_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub command_id: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub reason: Option<String>,
    pub severity: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl PendingCommand {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Deactivation confirmation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmStatus {
    Success,
    Failed,
}

/// Body of `POST /devices/{id}/confirm-deactivation/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationConfirm {
    pub status: ConfirmStatus,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Tamper report
// ---------------------------------------------------------------------------

/// Body of `POST /tamper/mobile/{id}/report/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperReport {
    pub event_id: Uuid,
    pub device_id: String,
    pub tamper_type: String,
    pub severity: String,
    pub detected_at: DateTime<Utc>,
    pub details: String,
    /// Queue ordering key (detection time in epoch millis).
    pub timestamp_ms: i64,
    /// Lock state the agent settled on after handling this event.
    pub lock_state: String,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// The single active registration row for this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub serial_number: Option<String>,
    #[serde(default)]
    pub sim_serials: Vec<String>,
    pub loan_number: Option<String>,
}
