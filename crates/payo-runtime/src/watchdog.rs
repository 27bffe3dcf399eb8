//! Periodic self-check: device-owner privilege and restriction drift.
//!
//! # Invariants
//! - Privilege loss triggers containment once per breach: a lock request and
//!   a wipe attempt, both always attempted. The latch resets only when
//!   privilege is observed again.
//! - The watchdog never lowers the lock state; its request is at least the
//!   current state.
//! - Stands down while deactivation runs or the state is `Deactivating`.
//! - Healing runs under the lock manager's writer lock against the committed
//!   state, so it cannot re-apply a restriction set a concurrent transition
//!   has just replaced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use payo_enforce::{DeviceAdmin, DriftReport, EnforcementResult, Enforcer, PolicyError};
use payo_lock::{
    LockError, LockReason, LockState, LockStateManager, ReasonCategory, Severity,
    TransitionSource,
};
use payo_tamper::DeviceProbe;

use crate::deactivation::DeactivationSequencer;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device owner privilege lost")]
pub struct PrivilegeLost {
    /// Outcome of the containment lock request.
    pub lock: Result<LockState, LockError>,
    /// Outcome of the wipe attempt.
    pub wipe: Result<(), PolicyError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Healed {
        drift: DriftReport,
        result: EnforcementResult,
    },
    PrivilegeLost(PrivilegeLost),
    /// Privilege still missing; containment already ran for this breach.
    Contained,
    StoodDown,
}

pub struct Watchdog {
    probe: Arc<dyn DeviceProbe>,
    enforcer: Arc<Enforcer>,
    manager: Arc<LockStateManager>,
    admin: Arc<dyn DeviceAdmin>,
    sequencer: Option<Arc<DeactivationSequencer>>,
    contained: AtomicBool,
}

impl Watchdog {
    pub fn new(
        probe: Arc<dyn DeviceProbe>,
        enforcer: Arc<Enforcer>,
        manager: Arc<LockStateManager>,
        admin: Arc<dyn DeviceAdmin>,
    ) -> Self {
        Self {
            probe,
            enforcer,
            manager,
            admin,
            sequencer: None,
            contained: AtomicBool::new(false),
        }
    }

    pub fn with_sequencer(mut self, sequencer: Arc<DeactivationSequencer>) -> Self {
        self.sequencer = Some(sequencer);
        self
    }

    fn privilege_held(&self) -> Option<bool> {
        let owner = self.probe.is_device_owner();
        let admin = self.probe.is_admin_active();
        match (owner, admin) {
            (Ok(o), Ok(a)) => Some(o && a),
            (Err(e), _) | (_, Err(e)) => {
                tracing::debug!(error = %e, "privilege probe unavailable");
                None
            }
        }
    }

    pub async fn verify(&self) -> Health {
        let deactivating = self
            .sequencer
            .as_ref()
            .is_some_and(|s| s.is_in_progress());
        let state = self.manager.state();
        if deactivating || state == LockState::Deactivating {
            return Health::StoodDown;
        }

        match self.privilege_held() {
            Some(false) => return self.contain(state).await,
            Some(true) => {
                if self.contained.swap(false, Ordering::SeqCst) {
                    tracing::info!("device owner privilege restored");
                }
            }
            None => {}
        }

        let enforcer = &self.enforcer;
        let healed = self
            .manager
            .with_record(|r| match r.state {
                LockState::Deactivating => None,
                current => Some(enforcer.heal(current)),
            })
            .await;
        match healed {
            None => Health::StoodDown,
            Some(None) => Health::Healthy,
            Some(Some((drift, result))) => Health::Healed { drift, result },
        }
    }

    async fn contain(&self, current: LockState) -> Health {
        if self.contained.swap(true, Ordering::SeqCst) {
            return Health::Contained;
        }
        tracing::error!(state = %current, "device owner privilege lost; containing");

        let target = LockState::HardLocked.max_severity(current);
        let reason = LockReason::new(ReasonCategory::SecurityBreach, Severity::Critical)
            .with_detail("device owner or admin privilege removed");
        let lock = self
            .manager
            .request_transition(target, reason, TransitionSource::Watchdog)
            .await;
        if let Err(e) = &lock {
            tracing::error!(error = %e, "containment lock failed");
        }

        let wipe = self.admin.wipe_data("device owner privilege lost");
        if let Err(e) = &wipe {
            tracing::error!(error = %e, "containment wipe failed");
        }

        Health::PrivilegeLost(PrivilegeLost { lock, wipe })
    }
}
