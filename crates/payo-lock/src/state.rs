use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// LockState
// ---------------------------------------------------------------------------

/// Device lock level.
///
/// Severity order is `None < SoftLocked < HardLocked < PermanentLocked`.
/// `Deactivating` sits outside that order and is **terminal**: once entered,
/// only the deactivation sequencer may touch the record again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    None,
    SoftLocked,
    HardLocked,
    PermanentLocked,
    Deactivating,
}

impl LockState {
    /// Rank in the severity order; `None` for `Deactivating`.
    pub fn rank(&self) -> Option<u8> {
        match self {
            LockState::None => Some(0),
            LockState::SoftLocked => Some(1),
            LockState::HardLocked => Some(2),
            LockState::PermanentLocked => Some(3),
            LockState::Deactivating => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            LockState::SoftLocked | LockState::HardLocked | LockState::PermanentLocked
        )
    }

    /// One severity step up, saturating at `PermanentLocked`.
    pub fn step_up(&self) -> LockState {
        match self {
            LockState::None => LockState::SoftLocked,
            LockState::SoftLocked => LockState::HardLocked,
            LockState::HardLocked | LockState::PermanentLocked => LockState::PermanentLocked,
            LockState::Deactivating => LockState::Deactivating,
        }
    }

    /// The more severe of two ranked states.
    pub fn max_severity(self, other: LockState) -> LockState {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) if b > a => other,
            _ => self,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::None => "NONE",
            LockState::SoftLocked => "SOFT_LOCKED",
            LockState::HardLocked => "HARD_LOCKED",
            LockState::PermanentLocked => "PERMANENT_LOCKED",
            LockState::Deactivating => "DEACTIVATING",
        }
    }

    /// Parse either the wire form (`HARD_LOCKED`) or a command level (`hard`).
    pub fn parse(s: &str) -> Option<LockState> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "unlocked" => Some(LockState::None),
            "soft" | "soft_locked" => Some(LockState::SoftLocked),
            "hard" | "hard_locked" => Some(LockState::HardLocked),
            "permanent" | "permanent_locked" => Some(LockState::PermanentLocked),
            "deactivating" => Some(LockState::Deactivating),
            _ => None,
        }
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TransitionSource
// ---------------------------------------------------------------------------

/// Who asked for a transition. Authority rules in [`crate::policy`] key on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionSource {
    TamperCollector,
    Watchdog,
    /// Lock or wipe command from the backend.
    ServerCommand,
    /// Authenticated unlock command from the backend.
    ServerUnlock,
    ServerDeactivate,
    DeactivationSequencer,
    PaymentSchedule,
    /// Offline unlock code entered on the device.
    UnlockCode,
    Boot,
}

impl TransitionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionSource::TamperCollector => "TAMPER_COLLECTOR",
            TransitionSource::Watchdog => "WATCHDOG",
            TransitionSource::ServerCommand => "SERVER_COMMAND",
            TransitionSource::ServerUnlock => "SERVER_UNLOCK",
            TransitionSource::ServerDeactivate => "SERVER_DEACTIVATE",
            TransitionSource::DeactivationSequencer => "DEACTIVATION_SEQUENCER",
            TransitionSource::PaymentSchedule => "PAYMENT_SCHEDULE",
            TransitionSource::UnlockCode => "UNLOCK_CODE",
            TransitionSource::Boot => "BOOT",
        }
    }
}

impl std::fmt::Display for TransitionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
