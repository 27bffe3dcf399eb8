//! payo-enforce
//!
//! Maps lock states to restriction sets and pushes them to the platform
//! through [`DevicePolicy`]. [`EnforcementListener`] hooks the enforcer to the
//! lock manager so every committed transition is enforced before the
//! transition call returns.

mod enforcer;
mod platform;
mod restriction;

use std::sync::Arc;

use payo_lock::{LockChange, LockListener};

pub use enforcer::{
    DriftReport, EnforcementPartialFailure, EnforcementResult, Enforcer, ItemFailure, Op,
};
pub use platform::{DeviceAdmin, DevicePolicy, PolicyError};
pub use restriction::{restrictions_for, Restriction};

pub struct EnforcementListener {
    enforcer: Arc<Enforcer>,
}

impl EnforcementListener {
    pub fn new(enforcer: Arc<Enforcer>) -> Self {
        Self { enforcer }
    }
}

impl LockListener for EnforcementListener {
    fn on_lock_changed(&self, change: &LockChange) {
        let result = self.enforcer.enforce(change.record.state);
        if let Err(partial) = result.into_result() {
            // Remembered by the enforcer; the watchdog heals on its next pass.
            tracing::warn!(error = %partial, "enforcement after lock change incomplete");
        }
    }
}
