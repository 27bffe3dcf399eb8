//! Scenario: the backend signals lock intent only through `content.is_locked`.
//!
//! # Invariants under test
//!
//! 1. The flag turning on locks the device with the categorized reason.
//! 2. A repeated flag issues nothing.
//! 3. The flag turning off after being on unlocks the device.
//! 4. A steady `is_locked: false` never clears a lock raised on the device.
//! 5. A server lock persisted across a reboot is released when the flag
//!    is first seen off.

use payo_lock::{LockReason, LockState, ReasonCategory, Severity, TransitionSource};
use payo_runtime::CommandOutcome;
use payo_testkit::{lock_flag_response, TestRig};

#[tokio::test]
async fn flag_edges_lock_and_unlock_once() {
    let rig = TestRig::new();
    let agent = rig.agent().await.unwrap();

    rig.backend
        .push_response(lock_flag_response(true, Some("Payment overdue")));
    let t1 = agent.heartbeat.tick().await.unwrap();
    assert_eq!(t1.commands.len(), 1);
    assert!(t1.commands[0].0.starts_with("content:lock:"));
    assert_eq!(t1.commands[0].1, CommandOutcome::Applied(LockState::HardLocked));
    let record = agent.manager.record();
    assert_eq!(record.state, LockState::HardLocked);
    assert_eq!(record.reason.category, ReasonCategory::PaymentOverdue);
    assert_eq!(record.source, TransitionSource::ServerCommand);

    rig.backend
        .push_response(lock_flag_response(true, Some("Payment overdue")));
    let t2 = agent.heartbeat.tick().await.unwrap();
    assert!(t2.commands.is_empty());

    rig.backend.push_response(lock_flag_response(false, None));
    let t3 = agent.heartbeat.tick().await.unwrap();
    assert_eq!(t3.commands.len(), 1);
    assert!(t3.commands[0].0.starts_with("content:unlock:"));
    assert_eq!(agent.manager.state(), LockState::None);

    rig.backend.push_response(lock_flag_response(false, None));
    let t4 = agent.heartbeat.tick().await.unwrap();
    assert!(t4.commands.is_empty());

    // Relocking after an unlock is a new change, not a duplicate.
    rig.backend
        .push_response(lock_flag_response(true, Some("Security issue")));
    let t5 = agent.heartbeat.tick().await.unwrap();
    assert_eq!(t5.commands[0].1, CommandOutcome::Applied(LockState::HardLocked));
    assert_eq!(
        agent.manager.record().reason.category,
        ReasonCategory::SecurityBreach
    );
}

#[tokio::test]
async fn steady_unlocked_flag_keeps_device_lock() {
    let rig = TestRig::new();
    let agent = rig.agent().await.unwrap();

    agent
        .manager
        .request_transition(
            LockState::HardLocked,
            LockReason::new(ReasonCategory::DeviceTampering, Severity::High),
            TransitionSource::TamperCollector,
        )
        .await
        .unwrap();

    for _ in 0..2 {
        rig.backend.push_response(lock_flag_response(false, None));
        let tick = agent.heartbeat.tick().await.unwrap();
        assert!(tick.commands.is_empty());
    }
    assert_eq!(agent.manager.state(), LockState::HardLocked);
    assert_eq!(
        agent.manager.record().reason.category,
        ReasonCategory::DeviceTampering
    );
}

#[tokio::test]
async fn server_lock_released_after_reboot() {
    let rig = TestRig::new();
    {
        let agent = rig.agent().await.unwrap();
        rig.backend
            .push_response(lock_flag_response(true, Some("Payment overdue")));
        agent.heartbeat.tick().await.unwrap();
        assert_eq!(agent.manager.state(), LockState::HardLocked);
    }

    let agent = rig.agent().await.unwrap();
    assert_eq!(agent.boot_record.state, LockState::HardLocked);
    rig.backend.push_response(lock_flag_response(false, None));
    let tick = agent.heartbeat.tick().await.unwrap();
    assert_eq!(tick.commands.len(), 1);
    assert_eq!(agent.manager.state(), LockState::None);
}
