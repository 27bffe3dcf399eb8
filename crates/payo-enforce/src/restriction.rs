use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use payo_lock::LockState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Restriction {
    FactoryResetDisallowed,
    SafeBootDisallowed,
    DebuggingFeaturesDisallowed,
    WarningOverlay,
    KeyguardBypassDisabled,
    StatusBarDisabled,
    NonSystemAppsSuspended,
    BlockingOverlay,
    OutgoingCallsBlocked,
    SmsBlocked,
    AppInstallDisallowed,
    UsbFileTransferDisallowed,
    ExternalMediaDisallowed,
}

impl Restriction {
    pub const ALL: [Restriction; 13] = [
        Restriction::FactoryResetDisallowed,
        Restriction::SafeBootDisallowed,
        Restriction::DebuggingFeaturesDisallowed,
        Restriction::WarningOverlay,
        Restriction::KeyguardBypassDisabled,
        Restriction::StatusBarDisabled,
        Restriction::NonSystemAppsSuspended,
        Restriction::BlockingOverlay,
        Restriction::OutgoingCallsBlocked,
        Restriction::SmsBlocked,
        Restriction::AppInstallDisallowed,
        Restriction::UsbFileTransferDisallowed,
        Restriction::ExternalMediaDisallowed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Restriction::FactoryResetDisallowed => "FACTORY_RESET_DISALLOWED",
            Restriction::SafeBootDisallowed => "SAFE_BOOT_DISALLOWED",
            Restriction::DebuggingFeaturesDisallowed => "DEBUGGING_FEATURES_DISALLOWED",
            Restriction::WarningOverlay => "WARNING_OVERLAY",
            Restriction::KeyguardBypassDisabled => "KEYGUARD_BYPASS_DISABLED",
            Restriction::StatusBarDisabled => "STATUS_BAR_DISABLED",
            Restriction::NonSystemAppsSuspended => "NON_SYSTEM_APPS_SUSPENDED",
            Restriction::BlockingOverlay => "BLOCKING_OVERLAY",
            Restriction::OutgoingCallsBlocked => "OUTGOING_CALLS_BLOCKED",
            Restriction::SmsBlocked => "SMS_BLOCKED",
            Restriction::AppInstallDisallowed => "APP_INSTALL_DISALLOWED",
            Restriction::UsbFileTransferDisallowed => "USB_FILE_TRANSFER_DISALLOWED",
            Restriction::ExternalMediaDisallowed => "EXTERNAL_MEDIA_DISALLOWED",
        }
    }
}

impl std::fmt::Display for Restriction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const BASELINE: [Restriction; 3] = [
    Restriction::FactoryResetDisallowed,
    Restriction::SafeBootDisallowed,
    Restriction::DebuggingFeaturesDisallowed,
];

const HARD_EXTRA: [Restriction; 7] = [
    Restriction::KeyguardBypassDisabled,
    Restriction::StatusBarDisabled,
    Restriction::NonSystemAppsSuspended,
    Restriction::BlockingOverlay,
    Restriction::OutgoingCallsBlocked,
    Restriction::SmsBlocked,
    Restriction::AppInstallDisallowed,
];

const PERMANENT_EXTRA: [Restriction; 2] = [
    Restriction::UsbFileTransferDisallowed,
    Restriction::ExternalMediaDisallowed,
];

/// The exact restriction set a lock state requires.
pub fn restrictions_for(state: LockState) -> BTreeSet<Restriction> {
    let mut set = BTreeSet::new();
    match state {
        LockState::Deactivating => {}
        LockState::None => set.extend(BASELINE),
        LockState::SoftLocked => {
            set.extend(BASELINE);
            set.insert(Restriction::WarningOverlay);
        }
        LockState::HardLocked => {
            set.extend(BASELINE);
            set.extend(HARD_EXTRA);
        }
        LockState::PermanentLocked => {
            set.extend(BASELINE);
            set.extend(HARD_EXTRA);
            set.extend(PERMANENT_EXTRA);
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_nest_by_severity() {
        let none = restrictions_for(LockState::None);
        let hard = restrictions_for(LockState::HardLocked);
        let perm = restrictions_for(LockState::PermanentLocked);
        assert!(none.is_subset(&hard));
        assert!(hard.is_subset(&perm));
        assert_eq!(perm.len(), 12);
        assert!(!hard.contains(&Restriction::WarningOverlay));
    }

    #[test]
    fn soft_is_baseline_plus_warning() {
        let soft = restrictions_for(LockState::SoftLocked);
        assert_eq!(soft.len(), 4);
        assert!(soft.contains(&Restriction::WarningOverlay));
    }

    #[test]
    fn deactivating_is_empty() {
        assert!(restrictions_for(LockState::Deactivating).is_empty());
    }
}
