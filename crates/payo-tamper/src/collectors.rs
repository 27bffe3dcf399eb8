//! Periodic tamper collectors.
//!
//! A collector reports [`Observation::Detected`] for as long as its condition
//! holds and [`Observation::Clear`] once a successful read shows it gone. A
//! probe failure is logged and reported as [`Observation::Unknown`], which
//! neither fires nor clears. Edge detection is the [`crate::Escalator`]'s job.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use payo_lock::Severity;

use crate::probe::{DeviceProbe, ProbeError};
use crate::types::{TamperEvent, TamperType};

pub const PROP_FLASH_LOCKED: &str = "ro.boot.flash.locked";
pub const PROP_VERIFIED_BOOT_STATE: &str = "ro.boot.verifiedbootstate";
pub const PROP_BUILD_TAGS: &str = "ro.build.tags";

/// Outcome of one collector tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Detected(TamperEvent),
    /// The probe answered and the condition is absent.
    Clear,
    /// The probe could not answer; the previous edge stands.
    Unknown,
}

impl Observation {
    pub fn event(self) -> Option<TamperEvent> {
        match self {
            Observation::Detected(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_clear(&self) -> bool {
        matches!(self, Observation::Clear)
    }
}

impl From<Option<TamperEvent>> for Observation {
    fn from(v: Option<TamperEvent>) -> Self {
        match v {
            Some(e) => Observation::Detected(e),
            None => Observation::Clear,
        }
    }
}

pub trait TamperCollector: Send + Sync {
    fn name(&self) -> &'static str;
    /// Tamper types this collector can emit; all are released when it clears.
    fn kinds(&self) -> &'static [TamperType];
    fn cadence(&self) -> Duration;
    fn check(&self) -> Observation;
}

fn probed<T>(collector: &'static str, r: Result<T, ProbeError>) -> Option<T> {
    match r {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(collector, error = %e, "probe failed; skipping tick");
            None
        }
    }
}

/// Shared fields of every collector.
#[derive(Clone)]
pub struct CollectorBase {
    pub probe: Arc<dyn DeviceProbe>,
    pub device_id: String,
    pub cadence: Duration,
}

impl CollectorBase {
    pub fn new(probe: Arc<dyn DeviceProbe>, device_id: impl Into<String>, cadence: Duration) -> Self {
        Self {
            probe,
            device_id: device_id.into(),
            cadence,
        }
    }

    fn event(&self, t: TamperType, sev: Severity, details: impl Into<String>) -> TamperEvent {
        TamperEvent::new(&self.device_id, t, sev, details)
    }
}

// ---------------------------------------------------------------------------
// Settings toggles
// ---------------------------------------------------------------------------

pub struct DeveloperOptionsCollector(pub CollectorBase);

impl TamperCollector for DeveloperOptionsCollector {
    fn name(&self) -> &'static str {
        "developer_options"
    }
    fn kinds(&self) -> &'static [TamperType] {
        &[TamperType::DeveloperMode]
    }
    fn cadence(&self) -> Duration {
        self.0.cadence
    }
    fn check(&self) -> Observation {
        let Some(on) = probed(self.name(), self.0.probe.developer_options_enabled()) else {
            return Observation::Unknown;
        };
        on.then(|| {
            self.0.event(
                TamperType::DeveloperMode,
                Severity::High,
                "developer options enabled",
            )
        })
        .into()
    }
}

pub struct UsbDebuggingCollector(pub CollectorBase);

impl TamperCollector for UsbDebuggingCollector {
    fn name(&self) -> &'static str {
        "usb_debugging"
    }
    fn kinds(&self) -> &'static [TamperType] {
        &[TamperType::UsbDebugging]
    }
    fn cadence(&self) -> Duration {
        self.0.cadence
    }
    fn check(&self) -> Observation {
        let Some(on) = probed(self.name(), self.0.probe.usb_debugging_enabled()) else {
            return Observation::Unknown;
        };
        on.then(|| {
            self.0
                .event(TamperType::UsbDebugging, Severity::High, "adb enabled")
        })
        .into()
    }
}

// ---------------------------------------------------------------------------
// Bootloader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Locked,
    Unlocked,
    Unknown,
}

/// Classify bootloader state from the two boot properties.
///
/// `flash.locked == "1"` or a green/yellow verified boot state means locked;
/// orange/red or `flash.locked == "0"` means unlocked; anything else is unknown.
pub fn classify_boot_state(flash_locked: Option<&str>, verified_boot: Option<&str>) -> BootState {
    let flash = flash_locked.map(str::trim);
    let vb = verified_boot.map(|s| s.trim().to_ascii_lowercase());

    if flash == Some("1") {
        return BootState::Locked;
    }
    match vb.as_deref() {
        Some("green") | Some("yellow") => return BootState::Locked,
        Some("orange") | Some("red") => return BootState::Unlocked,
        _ => {}
    }
    if flash == Some("0") {
        return BootState::Unlocked;
    }
    BootState::Unknown
}

pub struct BootloaderCollector(pub CollectorBase);

impl TamperCollector for BootloaderCollector {
    fn name(&self) -> &'static str {
        "bootloader"
    }
    fn kinds(&self) -> &'static [TamperType] {
        &[TamperType::BootloaderUnlocked, TamperType::VerifiedBootUnknown]
    }
    fn cadence(&self) -> Duration {
        self.0.cadence
    }
    fn check(&self) -> Observation {
        let p = &self.0.probe;
        let (Some(flash), Some(vb)) = (
            probed(self.name(), p.system_property(PROP_FLASH_LOCKED)),
            probed(self.name(), p.system_property(PROP_VERIFIED_BOOT_STATE)),
        ) else {
            return Observation::Unknown;
        };
        let details = format!(
            "flash.locked={} verifiedbootstate={}",
            flash.as_deref().unwrap_or("<unset>"),
            vb.as_deref().unwrap_or("<unset>")
        );
        match classify_boot_state(flash.as_deref(), vb.as_deref()) {
            BootState::Locked => Observation::Clear,
            BootState::Unlocked => Observation::Detected(self.0.event(
                TamperType::BootloaderUnlocked,
                Severity::Critical,
                details,
            )),
            BootState::Unknown => Observation::Detected(self.0.event(
                TamperType::VerifiedBootUnknown,
                Severity::Medium,
                details,
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

pub struct RootCollector(pub CollectorBase);

impl TamperCollector for RootCollector {
    fn name(&self) -> &'static str {
        "root"
    }
    fn kinds(&self) -> &'static [TamperType] {
        &[TamperType::Rooted]
    }
    fn cadence(&self) -> Duration {
        self.0.cadence
    }
    fn check(&self) -> Observation {
        let p = &self.0.probe;
        let Some(mut indicators) = probed(self.name(), p.root_indicators()) else {
            return Observation::Unknown;
        };
        let tags = probed(self.name(), p.system_property(PROP_BUILD_TAGS));
        if let Some(Some(tags)) = &tags {
            if tags.contains("test-keys") {
                indicators.push(format!("{PROP_BUILD_TAGS}={tags}"));
            }
        }
        if !indicators.is_empty() {
            return Observation::Detected(self.0.event(
                TamperType::Rooted,
                Severity::Critical,
                indicators.join(", "),
            ));
        }
        if tags.is_none() {
            return Observation::Unknown;
        }
        Observation::Clear
    }
}

// ---------------------------------------------------------------------------
// Accessibility services
// ---------------------------------------------------------------------------

pub struct AccessibilityCollector {
    pub base: CollectorBase,
    pub allowed: BTreeSet<String>,
}

impl TamperCollector for AccessibilityCollector {
    fn name(&self) -> &'static str {
        "accessibility"
    }
    fn kinds(&self) -> &'static [TamperType] {
        &[TamperType::AccessibilityService]
    }
    fn cadence(&self) -> Duration {
        self.base.cadence
    }
    fn check(&self) -> Observation {
        let Some(enabled) = probed(self.name(), self.base.probe.enabled_accessibility_services())
        else {
            return Observation::Unknown;
        };
        let unknown: Vec<String> = enabled
            .into_iter()
            .filter(|s| !self.allowed.contains(s))
            .collect();
        if unknown.is_empty() {
            return Observation::Clear;
        }
        Observation::Detected(self.base.event(
            TamperType::AccessibilityService,
            Severity::Medium,
            format!("unapproved accessibility services: {}", unknown.join(", ")),
        ))
    }
}

// ---------------------------------------------------------------------------
// SIM change
// ---------------------------------------------------------------------------

pub struct SimChangeCollector {
    pub base: CollectorBase,
    /// SIM serials recorded at registration. Empty disables the check.
    pub registered: BTreeSet<String>,
}

impl TamperCollector for SimChangeCollector {
    fn name(&self) -> &'static str {
        "sim_change"
    }
    fn kinds(&self) -> &'static [TamperType] {
        &[TamperType::SimChanged]
    }
    fn cadence(&self) -> Duration {
        self.base.cadence
    }
    fn check(&self) -> Observation {
        if self.registered.is_empty() {
            return Observation::Clear;
        }
        let Some(current) = probed(self.name(), self.base.probe.sim_serials()) else {
            return Observation::Unknown;
        };
        let foreign: Vec<String> = current
            .into_iter()
            .filter(|s| !self.registered.contains(s))
            .collect();
        if foreign.is_empty() {
            return Observation::Clear;
        }
        Observation::Detected(self.base.event(
            TamperType::SimChanged,
            Severity::Medium,
            format!("unregistered SIM: {}", foreign.join(", ")),
        ))
    }
}

// ---------------------------------------------------------------------------
// Device owner
// ---------------------------------------------------------------------------

pub struct DeviceOwnerCollector(pub CollectorBase);

impl TamperCollector for DeviceOwnerCollector {
    fn name(&self) -> &'static str {
        "device_owner"
    }
    fn kinds(&self) -> &'static [TamperType] {
        &[TamperType::DeviceOwnerRemoved]
    }
    fn cadence(&self) -> Duration {
        self.0.cadence
    }
    fn check(&self) -> Observation {
        let p = &self.0.probe;
        let (Some(owner), Some(admin)) = (
            probed(self.name(), p.is_device_owner()),
            probed(self.name(), p.is_admin_active()),
        ) else {
            return Observation::Unknown;
        };
        if owner && admin {
            return Observation::Clear;
        }
        Observation::Detected(self.0.event(
            TamperType::DeviceOwnerRemoved,
            Severity::Critical,
            format!("device_owner={owner} admin_active={admin}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_state_classification() {
        assert_eq!(classify_boot_state(Some("1"), None), BootState::Locked);
        assert_eq!(classify_boot_state(Some("1"), Some("orange")), BootState::Locked);
        assert_eq!(classify_boot_state(None, Some("green")), BootState::Locked);
        assert_eq!(classify_boot_state(None, Some("YELLOW")), BootState::Locked);
        assert_eq!(classify_boot_state(None, Some("orange")), BootState::Unlocked);
        assert_eq!(classify_boot_state(Some("0"), Some("red")), BootState::Unlocked);
        assert_eq!(classify_boot_state(Some("0"), None), BootState::Unlocked);
        assert_eq!(classify_boot_state(Some("0"), Some("green")), BootState::Locked);
        assert_eq!(classify_boot_state(None, None), BootState::Unknown);
        assert_eq!(classify_boot_state(Some(""), Some("weird")), BootState::Unknown);
    }
}
