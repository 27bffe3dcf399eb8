//! payo-testkit
//!
//! Fakes and a wiring helper for scenario tests. [`TestRig`] owns every
//! in-memory store so a test can build an agent, drop it and build another
//! over the same state to simulate a reboot.

mod backend;
mod device;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use payo_db::{MemoryCommandLedger, MemoryRegistrationStore};
use payo_lock::{LockError, MemoryLockStore, MemoryScheduleStore};
use payo_runtime::{Agent, AgentDeps, AgentSettings, ConfirmSettings};
use payo_schemas::{
    CommandKind, DeactivationDirective, HeartbeatRequest, HeartbeatResponse, LockContent,
    PendingCommand, TamperReport, DEACTIVATE_NOW,
};
use payo_tamper::CollectorSettings;
use payo_transport::{HeartbeatTransport, MemoryQueue, RetryPolicy};

pub use backend::{ok_response, FakeBackend};
pub use device::{AdminOp, FakeDevice};

pub const TEST_DEVICE_ID: &str = "dev-test-0001";

pub struct TestRig {
    pub device: Arc<FakeDevice>,
    pub backend: Arc<FakeBackend>,
    pub lock_store: Arc<MemoryLockStore>,
    pub schedule: Arc<MemoryScheduleStore>,
    pub ledger: Arc<MemoryCommandLedger>,
    pub registration: Arc<MemoryRegistrationStore>,
    pub heartbeats: Arc<MemoryQueue<HeartbeatRequest>>,
    pub reports: Arc<MemoryQueue<TamperReport>>,
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRig {
    pub fn new() -> Self {
        Self {
            device: Arc::new(FakeDevice::new()),
            backend: Arc::new(FakeBackend::new()),
            lock_store: Arc::new(MemoryLockStore::new()),
            schedule: Arc::new(MemoryScheduleStore::new()),
            ledger: Arc::new(MemoryCommandLedger::new()),
            registration: Arc::new(MemoryRegistrationStore::new(None)),
            heartbeats: Arc::new(MemoryQueue::new()),
            reports: Arc::new(MemoryQueue::new()),
        }
    }

    /// Single attempt, no backoff: tests see transient failures immediately.
    pub fn transport(&self) -> Arc<HeartbeatTransport> {
        Arc::new(HeartbeatTransport::new(
            self.backend.clone(),
            self.heartbeats.clone(),
            self.reports.clone(),
            RetryPolicy {
                base: Duration::from_millis(1),
                factor: 1,
                max_attempts: 1,
            },
        ))
    }

    pub fn deps(&self) -> AgentDeps {
        AgentDeps {
            device_id: TEST_DEVICE_ID.to_string(),
            probe: self.device.clone(),
            policy: self.device.clone(),
            admin: self.device.clone(),
            info: self.device.clone(),
            lock_store: self.lock_store.clone(),
            schedule_store: self.schedule.clone(),
            ledger: self.ledger.clone(),
            registration: self.registration.clone(),
            transport: self.transport(),
            tamper_log: None,
            listeners: Vec::new(),
        }
    }

    /// Build an agent over this rig's stores. Call again to "reboot".
    pub async fn agent(&self) -> Result<Agent, LockError> {
        Agent::build(self.deps(), fast_settings()).await
    }
}

/// Millisecond cadences so started loops react within a test's patience.
pub fn fast_settings() -> AgentSettings {
    let tick = Duration::from_millis(10);
    AgentSettings {
        collectors: CollectorSettings {
            developer_options: tick,
            usb_debugging: tick,
            bootloader: tick,
            root: tick,
            accessibility: tick,
            sim_change: tick,
            device_owner: tick,
            ..CollectorSettings::default()
        },
        heartbeat_interval: Duration::from_millis(25),
        watchdog_interval: tick,
        payment_interval: tick,
        confirm: ConfirmSettings {
            attempts: 3,
            delay: Duration::from_millis(1),
        },
        ..AgentSettings::default()
    }
}

pub fn command(id: &str, kind: CommandKind) -> PendingCommand {
    PendingCommand {
        command_id: id.to_string(),
        kind,
        reason: None,
        severity: None,
        parameters: BTreeMap::new(),
    }
}

pub fn lock_command(id: &str, level: &str) -> PendingCommand {
    let mut cmd = command(id, CommandKind::Lock);
    cmd.parameters
        .insert("level".to_string(), serde_json::Value::String(level.to_string()));
    cmd
}

pub fn response_with(cmd: PendingCommand) -> HeartbeatResponse {
    HeartbeatResponse {
        command: Some(cmd),
        ..ok_response()
    }
}

/// A response carrying only the backend's `content` lock flag.
pub fn lock_flag_response(is_locked: bool, reason: Option<&str>) -> HeartbeatResponse {
    HeartbeatResponse {
        content: Some(LockContent {
            is_locked,
            reason: reason.map(str::to_string),
        }),
        ..ok_response()
    }
}

/// A response carrying the backend's `deactivation` block.
pub fn deactivation_response(loan_number: &str) -> HeartbeatResponse {
    HeartbeatResponse {
        deactivation: Some(DeactivationDirective {
            status: "requested".to_string(),
            command: Some(DEACTIVATE_NOW.to_string()),
            reason: Some("loan settled".to_string()),
            agent_notice: None,
            loan_number: Some(loan_number.to_string()),
        }),
        ..ok_response()
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
