//! Drives the platform toward the restriction set of a lock state.
//!
//! # Invariants
//!
//! - **Item independence**: every restriction is attempted on its own; one
//!   failure never skips the rest.
//! - **Exact set**: items outside the target set are cleared, not left behind.
//! - **Failures are remembered** until a later pass succeeds for that item,
//!   so `verify` reports them even if the platform query looks clean.
//! - **Idempotent**: enforcing the same state twice yields the same observed set.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use payo_lock::LockState;

use crate::platform::{DevicePolicy, PolicyError};
use crate::restriction::{restrictions_for, Restriction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Apply,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub restriction: Restriction,
    pub op: Op,
    pub error: PolicyError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementResult {
    pub state: LockState,
    pub applied: BTreeSet<Restriction>,
    pub cleared: BTreeSet<Restriction>,
    pub failures: Vec<ItemFailure>,
}

impl EnforcementResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<Self, EnforcementPartialFailure> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(EnforcementPartialFailure {
                state: self.state,
                failures: self.failures,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("enforcement of {state} incomplete: {} item(s) failed", .failures.len())]
pub struct EnforcementPartialFailure {
    pub state: LockState,
    pub failures: Vec<ItemFailure>,
}

/// Difference between what the platform shows and what `state` requires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    pub missing: BTreeSet<Restriction>,
    pub unexpected: BTreeSet<Restriction>,
    /// Items whose status could not be read.
    pub unknown: BTreeSet<Restriction>,
    /// Items that failed on an earlier pass and have not succeeded since.
    pub pending_failures: BTreeSet<Restriction>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
            && self.unexpected.is_empty()
            && self.unknown.is_empty()
            && self.pending_failures.is_empty()
    }
}

pub struct Enforcer {
    policy: Arc<dyn DevicePolicy>,
    pending: Mutex<BTreeSet<Restriction>>,
}

impl Enforcer {
    pub fn new(policy: Arc<dyn DevicePolicy>) -> Self {
        Self {
            policy,
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn enforce(&self, state: LockState) -> EnforcementResult {
        let target = restrictions_for(state);
        let mut result = EnforcementResult {
            state,
            applied: BTreeSet::new(),
            cleared: BTreeSet::new(),
            failures: Vec::new(),
        };

        for r in Restriction::ALL {
            let (op, outcome) = if target.contains(&r) {
                (Op::Apply, self.policy.apply(r))
            } else {
                (Op::Clear, self.policy.clear(r))
            };
            match outcome {
                Ok(()) => {
                    match op {
                        Op::Apply => result.applied.insert(r),
                        Op::Clear => result.cleared.insert(r),
                    };
                }
                Err(error) => {
                    tracing::warn!(restriction = %r, ?op, error = %error, state = %state, "restriction not enforced");
                    result.failures.push(ItemFailure {
                        restriction: r,
                        op,
                        error,
                    });
                }
            }
        }

        let failed: BTreeSet<Restriction> = result.failures.iter().map(|f| f.restriction).collect();
        *self.pending_lock() = failed;

        if result.is_complete() {
            tracing::info!(state = %state, applied = result.applied.len(), "restrictions enforced");
        }
        result
    }

    /// Remove everything. Used by deactivation.
    pub fn clear_all(&self) -> EnforcementResult {
        self.enforce(LockState::Deactivating)
    }

    pub fn verify(&self, state: LockState) -> DriftReport {
        let expected = restrictions_for(state);
        let mut report = DriftReport {
            pending_failures: self.pending_lock().clone(),
            ..Default::default()
        };
        for r in Restriction::ALL {
            match self.policy.is_applied(r) {
                Ok(true) if !expected.contains(&r) => {
                    report.unexpected.insert(r);
                }
                Ok(false) if expected.contains(&r) => {
                    report.missing.insert(r);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(restriction = %r, error = %e, "restriction status unreadable");
                    report.unknown.insert(r);
                }
            }
        }
        report
    }

    /// Re-enforce when `verify` shows drift. Returns `None` when already clean.
    pub fn heal(&self, state: LockState) -> Option<(DriftReport, EnforcementResult)> {
        let drift = self.verify(state);
        if drift.is_clean() {
            return None;
        }
        tracing::warn!(
            state = %state,
            missing = drift.missing.len(),
            unexpected = drift.unexpected.len(),
            pending = drift.pending_failures.len(),
            "restriction drift detected; re-enforcing"
        );
        let result = self.enforce(state);
        Some((drift, result))
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<Restriction>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
