//! Server command execution with at-most-once semantics per `command_id`.
//!
//! # Invariants
//! - A command id already in the ledger is never executed again.
//! - Lock, unlock and wipe are recorded after their effect; a storage
//!   failure leaves the id unrecorded so the redelivered command retries.
//! - Deactivate is recorded before the sequencer runs because the sequencer
//!   clears the ledger itself.

use std::sync::Arc;

use tokio::sync::Mutex;

use payo_db::{CommandLedger, LedgerError};
use payo_enforce::DeviceAdmin;
use payo_lock::{
    categorize_legacy, LockError, LockReason, LockState, LockStateManager, ReasonCategory,
    Severity, TransitionRejected, TransitionSource,
};
use payo_schemas::{CommandKind, PendingCommand};

use crate::deactivation::{DeactivationResult, DeactivationSequencer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Duplicate,
    Applied(LockState),
    /// Valid but already covered by a stricter state.
    Superseded(LockState),
    Refused(String),
    WipeIssued,
    WipeFailed(String),
    Deactivated(DeactivationResult),
}

impl CommandOutcome {
    fn ledger_label(&self) -> String {
        match self {
            CommandOutcome::Duplicate => "duplicate".to_string(),
            CommandOutcome::Applied(s) => format!("applied:{s}"),
            CommandOutcome::Superseded(s) => format!("superseded:{s}"),
            CommandOutcome::Refused(r) => format!("refused:{r}"),
            CommandOutcome::WipeIssued => "wipe_issued".to_string(),
            CommandOutcome::WipeFailed(e) => format!("wipe_failed:{e}"),
            CommandOutcome::Deactivated(_) => "deactivation_started".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

pub struct CommandProcessor {
    manager: Arc<LockStateManager>,
    ledger: Arc<dyn CommandLedger>,
    admin: Arc<dyn DeviceAdmin>,
    sequencer: Arc<DeactivationSequencer>,
    gate: Mutex<()>,
}

impl CommandProcessor {
    pub fn new(
        manager: Arc<LockStateManager>,
        ledger: Arc<dyn CommandLedger>,
        admin: Arc<dyn DeviceAdmin>,
        sequencer: Arc<DeactivationSequencer>,
    ) -> Self {
        Self {
            manager,
            ledger,
            admin,
            sequencer,
            gate: Mutex::new(()),
        }
    }

    pub async fn process(&self, cmd: &PendingCommand) -> Result<CommandOutcome, CommandError> {
        let _gate = self.gate.lock().await;
        if self.ledger.is_processed(&cmd.command_id).await? {
            tracing::debug!(command_id = %cmd.command_id, "duplicate command ignored");
            return Ok(CommandOutcome::Duplicate);
        }
        tracing::info!(command_id = %cmd.command_id, kind = cmd.kind.as_str(), "processing command");

        let outcome = match cmd.kind {
            CommandKind::Lock => self.lock(cmd).await?,
            CommandKind::Unlock => self.unlock(cmd).await?,
            CommandKind::Wipe => self.wipe(cmd),
            CommandKind::Deactivate => return self.deactivate(cmd).await,
        };

        self.ledger
            .record(&cmd.command_id, cmd.kind, &outcome.ledger_label())
            .await?;
        Ok(outcome)
    }

    async fn lock(&self, cmd: &PendingCommand) -> Result<CommandOutcome, CommandError> {
        let target = cmd
            .param_str("level")
            .and_then(LockState::parse)
            .filter(|s| s.is_locked())
            .unwrap_or(LockState::HardLocked);
        let category = cmd
            .reason
            .as_deref()
            .map(categorize_legacy)
            .filter(|c| *c != ReasonCategory::Unlocked)
            .unwrap_or(ReasonCategory::AdminAction);
        let severity = cmd
            .severity
            .as_deref()
            .and_then(Severity::parse)
            .unwrap_or(Severity::High);
        let mut reason = LockReason::new(category, severity);
        if let Some(text) = &cmd.reason {
            reason = reason.with_detail(text.clone());
        }

        match self
            .manager
            .request_transition(target, reason, TransitionSource::ServerCommand)
            .await
        {
            Ok(s) => Ok(CommandOutcome::Applied(s)),
            Err(LockError::Rejected(TransitionRejected::Downgrade { from, .. })) => {
                Ok(CommandOutcome::Superseded(from))
            }
            Err(LockError::Rejected(r)) => Ok(CommandOutcome::Refused(r.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, cmd: &PendingCommand) -> Result<CommandOutcome, CommandError> {
        let mut reason = LockReason::unlocked();
        if let Some(text) = &cmd.reason {
            reason = reason.with_detail(text.clone());
        }
        match self
            .manager
            .request_transition(LockState::None, reason, TransitionSource::ServerUnlock)
            .await
        {
            Ok(s) => Ok(CommandOutcome::Applied(s)),
            Err(LockError::Rejected(r)) => Ok(CommandOutcome::Refused(r.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn wipe(&self, cmd: &PendingCommand) -> CommandOutcome {
        let reason = cmd.reason.as_deref().unwrap_or("server wipe command");
        match self.admin.wipe_data(reason) {
            Ok(()) => CommandOutcome::WipeIssued,
            Err(e) => {
                tracing::error!(command_id = %cmd.command_id, error = %e, "wipe failed");
                CommandOutcome::WipeFailed(e.to_string())
            }
        }
    }

    async fn deactivate(&self, cmd: &PendingCommand) -> Result<CommandOutcome, CommandError> {
        let mut reason = LockReason::new(ReasonCategory::AdminAction, Severity::Low);
        if let Some(text) = &cmd.reason {
            reason = reason.with_detail(text.clone());
        }
        match self
            .manager
            .request_transition(LockState::Deactivating, reason, TransitionSource::ServerDeactivate)
            .await
        {
            Ok(_) => {}
            Err(LockError::Rejected(r)) => return Ok(CommandOutcome::Refused(r.to_string())),
            Err(e) => return Err(e.into()),
        }

        self.ledger
            .record(&cmd.command_id, cmd.kind, "deactivation_started")
            .await?;
        let result = self.sequencer.deactivate().await;
        Ok(CommandOutcome::Deactivated(result))
    }
}
