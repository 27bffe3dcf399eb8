use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use payo_lock::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TamperType {
    DeveloperMode,
    UsbDebugging,
    BootloaderUnlocked,
    VerifiedBootUnknown,
    Rooted,
    AccessibilityService,
    SimChanged,
    DeviceOwnerRemoved,
}

impl TamperType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TamperType::DeveloperMode => "DEVELOPER_MODE",
            TamperType::UsbDebugging => "USB_DEBUGGING",
            TamperType::BootloaderUnlocked => "BOOTLOADER_UNLOCKED",
            TamperType::VerifiedBootUnknown => "VERIFIED_BOOT_UNKNOWN",
            TamperType::Rooted => "ROOTED",
            TamperType::AccessibilityService => "ACCESSIBILITY_SERVICE",
            TamperType::SimChanged => "SIM_CHANGED",
            TamperType::DeviceOwnerRemoved => "DEVICE_OWNER_REMOVED",
        }
    }
}

impl std::fmt::Display for TamperType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed tamper signal. Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperEvent {
    pub event_id: Uuid,
    pub tamper_type: TamperType,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub details: String,
    pub device_id: String,
}

impl TamperEvent {
    pub fn new(
        device_id: &str,
        tamper_type: TamperType,
        severity: Severity,
        details: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            tamper_type,
            severity,
            detected_at: Utc::now(),
            details: details.into(),
            device_id: device_id.to_string(),
        }
    }
}
