//! Payment schedule tracking and offline unlock codes.
//!
//! Only the SHA-256 of the unlock code is kept. A code works once per due
//! date; after it has lowered the lock, schedule locking for that due date is
//! suspended until the backend sends a new schedule. The schedule is written
//! through [`ScheduleStore`] before memory changes, so a restart neither
//! forgets a used code nor re-locks for a settled due date.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use payo_lock::{
    LockError, LockReason, LockState, LockStateManager, PaymentPolicy, PaymentSchedule,
    ScheduleStore, StoreError, TransitionSource,
};
use payo_schemas::NextPayment;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnlockCodeError {
    #[error("no unlock code issued")]
    NoCode,
    #[error("unlock code does not match")]
    Mismatch,
    #[error("unlock code already used")]
    AlreadyUsed,
    #[error(transparent)]
    Lock(#[from] LockError),
}

pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.trim().as_bytes()))
}

pub struct PaymentTracker {
    policy: PaymentPolicy,
    manager: Arc<LockStateManager>,
    store: Arc<dyn ScheduleStore>,
    schedule: Mutex<Option<PaymentSchedule>>,
}

impl PaymentTracker {
    pub fn new(
        policy: PaymentPolicy,
        manager: Arc<LockStateManager>,
        store: Arc<dyn ScheduleStore>,
    ) -> Self {
        Self {
            policy,
            manager,
            store,
            schedule: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PaymentSchedule>> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the persisted schedule. Called once at boot.
    pub async fn restore(&self) -> Result<(), StoreError> {
        let restored = self.store.load_schedule().await?;
        if let Some(s) = &restored {
            tracing::info!(
                due = %s.due.to_rfc3339(),
                code_used = s.code_used,
                "payment schedule restored"
            );
        }
        *self.lock() = restored;
        Ok(())
    }

    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        self.lock().as_ref().map(|s| s.due)
    }

    /// Absorb `next_payment` from a heartbeat response.
    pub async fn update(&self, next: &NextPayment) {
        let Some(due) = next.due_at() else {
            tracing::warn!(date_time = %next.date_time, "unparseable payment due date ignored");
            return;
        };
        let code_hash = next
            .unlock_password
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(hash_code);

        let prev = self.lock().clone();
        let code_used = match &prev {
            Some(p) if p.due == due && p.code_hash == code_hash => p.code_used,
            _ => false,
        };
        let next = PaymentSchedule {
            due,
            code_hash,
            code_used,
        };
        if prev.as_ref() == Some(&next) {
            return;
        }

        if let Err(e) = self.store.save_schedule(&next).await {
            tracing::error!(error = %e, "payment schedule not persisted; keeping previous");
            return;
        }
        if prev.map(|p| p.due) != Some(due) {
            tracing::info!(due = %due.to_rfc3339(), "payment schedule updated");
        }
        *self.lock() = Some(next);
    }

    /// Lock the schedule warrants at `now`, if any.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Option<(LockState, LockReason)> {
        let g = self.lock();
        let s = g.as_ref()?;
        if s.code_used {
            return None;
        }
        self.policy.evaluate(s.due, now)
    }

    /// Apply the schedule. Schedule locks only ever raise the state.
    pub async fn tick(&self, now: DateTime<Utc>) -> Option<LockState> {
        let (target, reason) = self.evaluate(now)?;
        match self
            .manager
            .request_transition(target, reason, TransitionSource::PaymentSchedule)
            .await
        {
            Ok(s) => Some(s),
            Err(LockError::Rejected(r)) => {
                tracing::debug!(reason = %r, "payment lock not applied");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "payment lock not persisted");
                None
            }
        }
    }

    /// The code is consumed only when it actually lowered the lock.
    pub async fn unlock_with_code(&self, code: &str) -> Result<LockState, UnlockCodeError> {
        let candidate = hash_code(code);
        {
            let g = self.lock();
            let s = g.as_ref().ok_or(UnlockCodeError::NoCode)?;
            let expected = s.code_hash.as_deref().ok_or(UnlockCodeError::NoCode)?;
            if s.code_used {
                return Err(UnlockCodeError::AlreadyUsed);
            }
            if expected != candidate {
                tracing::warn!("unlock code mismatch");
                return Err(UnlockCodeError::Mismatch);
            }
        }

        let before = self.manager.state();
        let reason = LockReason::unlocked().with_detail("offline unlock code");
        let state = self
            .manager
            .request_transition(LockState::None, reason, TransitionSource::UnlockCode)
            .await?;
        if state == before {
            tracing::info!(state = %state, "unlock code matched but nothing to clear; code kept");
            return Ok(state);
        }

        let used = self.lock().clone().map(|s| PaymentSchedule {
            code_used: true,
            ..s
        });
        if let Some(used) = used {
            if let Err(e) = self.store.save_schedule(&used).await {
                tracing::error!(error = %e, "used unlock code not persisted");
            }
            *self.lock() = Some(used);
        }
        tracing::info!("device unlocked with payment code");
        Ok(state)
    }

    /// Forget the schedule. Part of deactivation.
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear_schedule().await?;
        *self.lock() = None;
        Ok(())
    }
}
