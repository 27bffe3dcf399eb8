//! payo-tamper
//!
//! Tamper signal collectors and the escalation rules that turn their events
//! into lock requests. Nothing here writes device state: collectors read
//! through [`DeviceProbe`], and the [`Escalator`] only computes targets.

mod collectors;
mod escalator;
mod probe;
mod types;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

pub use collectors::{
    classify_boot_state, AccessibilityCollector, BootState, BootloaderCollector, CollectorBase,
    DeveloperOptionsCollector, DeviceOwnerCollector, Observation, RootCollector,
    SimChangeCollector, TamperCollector, UsbDebuggingCollector, PROP_BUILD_TAGS,
    PROP_FLASH_LOCKED, PROP_VERIFIED_BOOT_STATE,
};
pub use escalator::{Escalation, Escalator};
pub use probe::{DeviceProbe, ProbeError};
pub use types::{TamperEvent, TamperType};

/// Cadences for [`standard_collectors`].
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub developer_options: Duration,
    pub usb_debugging: Duration,
    pub bootloader: Duration,
    pub root: Duration,
    pub accessibility: Duration,
    pub sim_change: Duration,
    pub device_owner: Duration,
    pub allowed_accessibility: BTreeSet<String>,
    pub registered_sims: BTreeSet<String>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            developer_options: Duration::from_secs(2),
            usb_debugging: Duration::from_secs(2),
            bootloader: Duration::from_secs(2),
            root: Duration::from_secs(2),
            accessibility: Duration::from_secs(3),
            sim_change: Duration::from_secs(3),
            device_owner: Duration::from_secs(5),
            allowed_accessibility: BTreeSet::new(),
            registered_sims: BTreeSet::new(),
        }
    }
}

/// The full collector set for one device.
pub fn standard_collectors(
    probe: Arc<dyn DeviceProbe>,
    device_id: &str,
    s: CollectorSettings,
) -> Vec<Arc<dyn TamperCollector>> {
    let base = |cadence| CollectorBase::new(probe.clone(), device_id, cadence);
    vec![
        Arc::new(DeveloperOptionsCollector(base(s.developer_options))),
        Arc::new(UsbDebuggingCollector(base(s.usb_debugging))),
        Arc::new(BootloaderCollector(base(s.bootloader))),
        Arc::new(RootCollector(base(s.root))),
        Arc::new(AccessibilityCollector {
            base: base(s.accessibility),
            allowed: s.allowed_accessibility,
        }),
        Arc::new(SimChangeCollector {
            base: base(s.sim_change),
            registered: s.registered_sims,
        }),
        Arc::new(DeviceOwnerCollector(base(s.device_owner))),
    ]
}
