//! Payment schedule policy and its persisted record.
//!
//! [`PaymentPolicy`] maps a due date to the lock it warrants. The
//! [`PaymentSchedule`] row survives restarts so a used unlock code stays used.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::reason::{LockReason, ReasonCategory, Severity};
use crate::record::StoreError;
use crate::state::LockState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentPolicy {
    pub soft_lock_hours_before_due: i64,
    pub hard_lock_after_overdue_days: i64,
}

impl Default for PaymentPolicy {
    fn default() -> Self {
        Self {
            soft_lock_hours_before_due: 24,
            hard_lock_after_overdue_days: 3,
        }
    }
}

impl PaymentPolicy {
    /// `None` when the due date is far enough away to need no lock.
    pub fn evaluate(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> Option<(LockState, LockReason)> {
        let hard_at = due + Duration::days(self.hard_lock_after_overdue_days);
        let soft_at = due - Duration::hours(self.soft_lock_hours_before_due);

        if now >= hard_at {
            let overdue_days = (now - due).num_days();
            Some((
                LockState::HardLocked,
                LockReason::new(ReasonCategory::PaymentOverdue, Severity::High)
                    .with_detail(format!("overdue by {overdue_days} day(s)")),
            ))
        } else if now > due {
            Some((
                LockState::SoftLocked,
                LockReason::new(ReasonCategory::PaymentOverdue, Severity::Medium),
            ))
        } else if now >= soft_at {
            Some((
                LockState::SoftLocked,
                LockReason::new(ReasonCategory::PaymentDueSoon, Severity::Low)
                    .with_detail(format!("due at {}", due.to_rfc3339())),
            ))
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted schedule
// ---------------------------------------------------------------------------

/// Current due date and unlock code. Only the SHA-256 of the code is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSchedule {
    pub due: DateTime<Utc>,
    pub code_hash: Option<String>,
    pub code_used: bool,
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn load_schedule(&self) -> Result<Option<PaymentSchedule>, StoreError>;
    async fn save_schedule(&self, schedule: &PaymentSchedule) -> Result<(), StoreError>;
    async fn clear_schedule(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    row: Mutex<Option<PaymentSchedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<PaymentSchedule> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PaymentSchedule>> {
        self.row.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn load_schedule(&self) -> Result<Option<PaymentSchedule>, StoreError> {
        Ok(self.lock().clone())
    }

    async fn save_schedule(&self, schedule: &PaymentSchedule) -> Result<(), StoreError> {
        *self.lock() = Some(schedule.clone());
        Ok(())
    }

    async fn clear_schedule(&self) -> Result<(), StoreError> {
        *self.lock() = None;
        Ok(())
    }
}
