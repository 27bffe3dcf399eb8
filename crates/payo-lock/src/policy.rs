//! Transition authority rules.
//!
//! # Invariants
//!
//! - **No silent downgrade**: a request that lowers severity is rejected
//!   unless it comes from `ServerUnlock` or `DeactivationSequencer`. An
//!   `UnlockCode` may only clear a Soft/Hard lock held for a payment reason.
//! - **Deactivating is terminal**: every request while deactivating is
//!   rejected except the sequencer's.
//! - **Deactivation needs the server**: only `ServerDeactivate` may enter it.
//! - **Same state is a no-op**: re-requesting the current state never writes.
//!
//! Pure: no IO, no clock.

use crate::reason::ReasonCategory;
use crate::record::LockRecord;
use crate::state::{LockState, TransitionSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Target equals current state.
    NoChange,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionRejected {
    #[error("downgrade {from} -> {to} not permitted for source {requested_by}")]
    Downgrade {
        from: LockState,
        to: LockState,
        requested_by: TransitionSource,
    },
    #[error("device is deactivating; request from {requested_by} ignored")]
    Terminal { requested_by: TransitionSource },
    #[error("deactivation may only be entered by the server, not {requested_by}")]
    DeactivationNotAuthorized { requested_by: TransitionSource },
    #[error("unlock code cannot clear {from} held for {category:?}")]
    UnlockCodeNotApplicable {
        from: LockState,
        category: ReasonCategory,
    },
}

pub fn decide(
    current: &LockRecord,
    target: LockState,
    source: TransitionSource,
) -> Result<Decision, TransitionRejected> {
    use TransitionSource as S;

    if target == LockState::Deactivating
        && current.state != LockState::Deactivating
        && source != S::ServerDeactivate
    {
        return Err(TransitionRejected::DeactivationNotAuthorized {
            requested_by: source,
        });
    }

    if target == current.state {
        return Ok(Decision::NoChange);
    }

    if current.state == LockState::Deactivating {
        return if source == S::DeactivationSequencer {
            Ok(Decision::Apply)
        } else {
            Err(TransitionRejected::Terminal {
                requested_by: source,
            })
        };
    }

    let is_downgrade = match (current.state.rank(), target.rank()) {
        (Some(from), Some(to)) => to < from,
        _ => false,
    };
    if !is_downgrade {
        return Ok(Decision::Apply);
    }

    match source {
        S::ServerUnlock | S::DeactivationSequencer => Ok(Decision::Apply),
        S::UnlockCode => {
            let from_clearable = matches!(
                current.state,
                LockState::SoftLocked | LockState::HardLocked
            );
            if from_clearable && target == LockState::None && current.reason.category.is_payment()
            {
                Ok(Decision::Apply)
            } else {
                Err(TransitionRejected::UnlockCodeNotApplicable {
                    from: current.state,
                    category: current.reason.category,
                })
            }
        }
        _ => Err(TransitionRejected::Downgrade {
            from: current.state,
            to: target,
            requested_by: source,
        }),
    }
}
