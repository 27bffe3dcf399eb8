use std::sync::{Arc, Mutex, MutexGuard};

use payo_db::CommandLedger;
use payo_lock::{LockStateManager, TransitionSource};
use payo_schemas::{
    DeviceIdentity, HeartbeatRequest, HeartbeatResponse, LockContent, PendingCommand,
};
use payo_transport::{HeartbeatTransport, TransportError};

use crate::commands::{CommandOutcome, CommandProcessor};
use crate::events::TamperFlags;
use crate::payment::PaymentTracker;

/// Device facts that change rarely and are read when building a heartbeat.
pub trait DeviceInfo: Send + Sync {
    fn identity(&self) -> DeviceIdentity;
    fn battery_level(&self) -> Option<u8>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatTick {
    pub timestamp_ms: i64,
    pub flushed: usize,
    pub commands: Vec<(String, CommandOutcome)>,
}

pub struct HeartbeatLoop {
    device_id: String,
    transport: Arc<HeartbeatTransport>,
    manager: Arc<LockStateManager>,
    ledger: Arc<dyn CommandLedger>,
    processor: Arc<CommandProcessor>,
    payment: Arc<PaymentTracker>,
    info: Arc<dyn DeviceInfo>,
    flags: TamperFlags,
    /// Last lock flag seen in `content`. `None` until the first response.
    server_locked: Mutex<Option<bool>>,
}

impl HeartbeatLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: impl Into<String>,
        transport: Arc<HeartbeatTransport>,
        manager: Arc<LockStateManager>,
        ledger: Arc<dyn CommandLedger>,
        processor: Arc<CommandProcessor>,
        payment: Arc<PaymentTracker>,
        info: Arc<dyn DeviceInfo>,
        flags: TamperFlags,
    ) -> Self {
        // A lock the server issued before a reboot is still its intent.
        let record = manager.record();
        let server_locked = (record.state.is_locked()
            && record.source == TransitionSource::ServerCommand)
            .then_some(true);
        Self {
            device_id: device_id.into(),
            transport,
            manager,
            ledger,
            processor,
            payment,
            info,
            flags,
            server_locked: Mutex::new(server_locked),
        }
    }

    fn server_locked(&self) -> MutexGuard<'_, Option<bool>> {
        self.server_locked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Command for a change in the server's lock flag, if any.
    ///
    /// A lock is issued the first time the flag is seen set. An unlock is
    /// only issued when the flag drops after being seen set, so a steady
    /// `is_locked: false` never clears a lock raised on the device.
    fn content_edge(&self, content: &LockContent) -> Option<PendingCommand> {
        let mut last = self.server_locked();
        let prev = last.replace(content.is_locked);
        let changed = if content.is_locked {
            prev != Some(true)
        } else {
            prev == Some(true)
        };
        changed.then(|| content.as_command(self.manager.record().seq))
    }

    pub async fn snapshot(&self) -> HeartbeatRequest {
        let acknowledged_command_ids = match self.ledger.unacked().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "could not read unacked commands");
                Vec::new()
            }
        };
        HeartbeatRequest {
            device_id: self.device_id.clone(),
            timestamp_ms: self.transport.stamp(),
            identity: self.info.identity(),
            security: self.flags.security_flags(),
            tamper_flags: self.flags.names(),
            lock_state: self.manager.state().as_str().to_string(),
            acknowledged_command_ids,
            battery_level: self.info.battery_level(),
        }
    }

    /// Build, send and act on one heartbeat.
    ///
    /// When the live send fails after the queue flush delivered some
    /// heartbeats, their responses are applied before the error is returned.
    pub async fn tick(&self) -> Result<HeartbeatTick, TransportError> {
        let req = self.snapshot().await;
        let ts = req.timestamp_ms;
        let acks = req.acknowledged_command_ids.clone();

        let delivery = match self.transport.send(req).await {
            Ok(delivery) => delivery,
            Err(failure) => {
                // Replies to queued heartbeats still count.
                for resp in &failure.flushed {
                    self.apply_response(resp).await;
                }
                return Err(failure.error);
            }
        };

        if !acks.is_empty() {
            if let Err(e) = self.ledger.mark_acked(&acks).await {
                tracing::warn!(error = %e, "command acks not recorded");
            }
        }

        let mut commands = Vec::new();
        for resp in delivery.responses() {
            commands.extend(self.apply_response(resp).await);
        }

        if let Err(e) = self.transport.flush_reports().await {
            tracing::debug!(error = %e, "tamper report flush deferred");
        }

        Ok(HeartbeatTick {
            timestamp_ms: ts,
            flushed: delivery.flushed.len(),
            commands,
        })
    }

    async fn apply_response(&self, resp: &HeartbeatResponse) -> Vec<(String, CommandOutcome)> {
        if let Some(next) = &resp.next_payment {
            self.payment.update(next).await;
        }
        let mut pending = resp.pending_commands();
        if let Some(cmd) = resp.content.as_ref().and_then(|c| self.content_edge(c)) {
            tracing::info!(
                command_id = %cmd.command_id,
                reason = cmd.reason.as_deref().unwrap_or(""),
                "server lock flag changed"
            );
            pending.push(cmd);
        }
        let mut out = Vec::new();
        for cmd in pending {
            match self.processor.process(&cmd).await {
                Ok(outcome) => out.push((cmd.command_id.clone(), outcome)),
                Err(e) => {
                    tracing::error!(command_id = %cmd.command_id, error = %e, "command not processed");
                }
            }
        }
        out
    }
}
