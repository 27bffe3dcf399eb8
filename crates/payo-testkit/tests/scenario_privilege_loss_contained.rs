//! Scenario: device-owner or admin privilege disappears.
//!
//! # Invariants under test
//!
//! 1. Loss of privilege hard-locks and attempts a wipe, once per breach.
//! 2. A failed wipe does not prevent the lock, and vice versa.
//! 3. The watchdog never lowers a stricter state.
//! 4. Privilege coming back re-arms containment for the next breach.
//! 5. Restriction drift is healed while privilege is held.

use payo_enforce::Restriction;
use payo_lock::{LockState, ReasonCategory};
use payo_runtime::Health;
use payo_testkit::{lock_command, response_with, AdminOp, TestRig};

#[tokio::test]
async fn privilege_loss_hard_locks_and_wipes_once() {
    let rig = TestRig::new();
    let agent = rig.agent().await.unwrap();
    assert_eq!(agent.watchdog.verify().await, Health::Healthy);

    rig.device.set_privilege(true, false);
    match agent.watchdog.verify().await {
        Health::PrivilegeLost(p) => {
            assert_eq!(p.lock, Ok(LockState::HardLocked));
            assert_eq!(p.wipe, Ok(()));
        }
        other => panic!("expected containment, got {other:?}"),
    }
    assert_eq!(agent.manager.state(), LockState::HardLocked);
    assert_eq!(
        agent.manager.record().reason.category,
        ReasonCategory::SecurityBreach
    );
    assert_eq!(rig.device.admin_calls(), vec![AdminOp::Wipe]);

    assert_eq!(agent.watchdog.verify().await, Health::Contained);
    assert_eq!(rig.device.admin_calls(), vec![AdminOp::Wipe]);

    rig.device.set_privilege(true, true);
    assert!(matches!(
        agent.watchdog.verify().await,
        Health::Healthy | Health::Healed { .. }
    ));

    rig.device.set_privilege(false, true);
    assert!(matches!(
        agent.watchdog.verify().await,
        Health::PrivilegeLost(_)
    ));
    assert_eq!(rig.device.admin_calls(), vec![AdminOp::Wipe, AdminOp::Wipe]);
}

#[tokio::test]
async fn failed_wipe_still_locks_and_permanent_is_kept() {
    let rig = TestRig::new();
    let agent = rig.agent().await.unwrap();

    rig.backend
        .push_response(response_with(lock_command("c1", "permanent")));
    agent.heartbeat.tick().await.unwrap();
    assert_eq!(agent.manager.state(), LockState::PermanentLocked);

    rig.device.fail_admin(AdminOp::Wipe);
    rig.device.set_privilege(false, false);
    let Health::PrivilegeLost(p) = agent.watchdog.verify().await else {
        panic!("expected containment");
    };
    assert_eq!(p.lock, Ok(LockState::PermanentLocked));
    assert!(p.wipe.is_err());
    assert_eq!(agent.manager.state(), LockState::PermanentLocked);
}

#[tokio::test]
async fn drift_is_healed() {
    let rig = TestRig::new();
    let agent = rig.agent().await.unwrap();
    rig.backend.push_response(response_with(lock_command("c1", "hard")));
    agent.heartbeat.tick().await.unwrap();
    assert!(rig.device.applied().contains(&Restriction::StatusBarDisabled));

    rig.device.drift(Restriction::StatusBarDisabled);
    assert!(matches!(
        agent.watchdog.verify().await,
        Health::Healed { .. }
    ));
    assert!(rig.device.applied().contains(&Restriction::StatusBarDisabled));
    assert_eq!(agent.watchdog.verify().await, Health::Healthy);
}
