//! Restriction enforcement against an in-memory policy.
//!
//! Invariants under test:
//! - enforce(s) twice == enforce(s) once (observable set and call outcome),
//! - one failing item never blocks the others,
//! - failures are remembered and reported by verify until healed,
//! - lowering the state clears the items the new state does not need.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use payo_enforce::{restrictions_for, DevicePolicy, Enforcer, Op, PolicyError, Restriction};
use payo_lock::LockState;

#[derive(Default)]
struct MemPolicy {
    applied: Mutex<BTreeSet<Restriction>>,
    failing: Mutex<BTreeSet<Restriction>>,
}

impl MemPolicy {
    fn observed(&self) -> BTreeSet<Restriction> {
        self.applied.lock().unwrap().clone()
    }
    fn fail(&self, r: Restriction, on: bool) {
        let mut f = self.failing.lock().unwrap();
        if on {
            f.insert(r);
        } else {
            f.remove(&r);
        }
    }
    fn check(&self, r: Restriction) -> Result<(), PolicyError> {
        if self.failing.lock().unwrap().contains(&r) {
            Err(PolicyError::Denied(r.to_string()))
        } else {
            Ok(())
        }
    }
}

impl DevicePolicy for MemPolicy {
    fn apply(&self, r: Restriction) -> Result<(), PolicyError> {
        self.check(r)?;
        self.applied.lock().unwrap().insert(r);
        Ok(())
    }
    fn clear(&self, r: Restriction) -> Result<(), PolicyError> {
        self.check(r)?;
        self.applied.lock().unwrap().remove(&r);
        Ok(())
    }
    fn is_applied(&self, r: Restriction) -> Result<bool, PolicyError> {
        Ok(self.applied.lock().unwrap().contains(&r))
    }
}

const STATES: [LockState; 5] = [
    LockState::None,
    LockState::SoftLocked,
    LockState::HardLocked,
    LockState::PermanentLocked,
    LockState::Deactivating,
];

#[test]
fn enforce_is_idempotent_for_every_state_pair() {
    for from in STATES {
        for to in STATES {
            let policy = Arc::new(MemPolicy::default());
            let enforcer = Enforcer::new(policy.clone());
            enforcer.enforce(from);

            let once = enforcer.enforce(to);
            let after_once = policy.observed();
            let twice = enforcer.enforce(to);
            let after_twice = policy.observed();

            assert_eq!(after_once, restrictions_for(to), "{from} -> {to}");
            assert_eq!(after_once, after_twice, "{from} -> {to}");
            assert_eq!(once, twice);
            assert!(enforcer.verify(to).is_clean());
        }
    }
}

#[test]
fn failing_item_does_not_block_others() {
    let policy = Arc::new(MemPolicy::default());
    policy.fail(Restriction::StatusBarDisabled, true);
    let enforcer = Enforcer::new(policy.clone());

    let result = enforcer.enforce(LockState::HardLocked);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].restriction, Restriction::StatusBarDisabled);
    assert_eq!(result.failures[0].op, Op::Apply);

    let mut expected = restrictions_for(LockState::HardLocked);
    expected.remove(&Restriction::StatusBarDisabled);
    assert_eq!(policy.observed(), expected);
    assert!(result.into_result().is_err());
}

#[test]
fn verify_reports_pending_and_heal_recovers() {
    let policy = Arc::new(MemPolicy::default());
    policy.fail(Restriction::SmsBlocked, true);
    let enforcer = Enforcer::new(policy.clone());
    enforcer.enforce(LockState::PermanentLocked);

    let drift = enforcer.verify(LockState::PermanentLocked);
    assert!(drift.pending_failures.contains(&Restriction::SmsBlocked));
    assert!(drift.missing.contains(&Restriction::SmsBlocked));

    // platform recovers
    policy.fail(Restriction::SmsBlocked, false);
    let (_, healed) = enforcer.heal(LockState::PermanentLocked).unwrap();
    assert!(healed.is_complete());
    assert!(enforcer.verify(LockState::PermanentLocked).is_clean());
    assert!(enforcer.heal(LockState::PermanentLocked).is_none());
}

#[test]
fn external_removal_is_detected_as_drift() {
    let policy = Arc::new(MemPolicy::default());
    let enforcer = Enforcer::new(policy.clone());
    enforcer.enforce(LockState::HardLocked);

    // someone lifts the keyguard restriction behind our back
    policy
        .applied
        .lock()
        .unwrap()
        .remove(&Restriction::KeyguardBypassDisabled);
    policy
        .applied
        .lock()
        .unwrap()
        .insert(Restriction::ExternalMediaDisallowed);

    let drift = enforcer.verify(LockState::HardLocked);
    assert_eq!(
        drift.missing,
        BTreeSet::from([Restriction::KeyguardBypassDisabled])
    );
    assert_eq!(
        drift.unexpected,
        BTreeSet::from([Restriction::ExternalMediaDisallowed])
    );
    enforcer.heal(LockState::HardLocked).unwrap();
    assert_eq!(policy.observed(), restrictions_for(LockState::HardLocked));
}

#[test]
fn clear_all_empties_the_device() {
    let policy = Arc::new(MemPolicy::default());
    let enforcer = Enforcer::new(policy.clone());
    enforcer.enforce(LockState::PermanentLocked);
    let r = enforcer.clear_all();
    assert!(r.is_complete());
    assert!(policy.observed().is_empty());
}
