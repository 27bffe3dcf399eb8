//! In-memory device with per-call failure injection.
//!
//! One [`FakeDevice`] plays every platform role at once (probe, policy,
//! admin, identity) so a scenario can flip a setting and watch the agent
//! react through the same object.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use payo_enforce::{DeviceAdmin, DevicePolicy, PolicyError, Restriction};
use payo_runtime::DeviceInfo;
use payo_schemas::DeviceIdentity;
use payo_tamper::{DeviceProbe, ProbeError, PROP_BUILD_TAGS, PROP_FLASH_LOCKED, PROP_VERIFIED_BOOT_STATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AdminOp {
    Wipe,
    ResetGlobalPolicies,
    UnsuspendApps,
    ReleaseDeviceOwner,
    ClearAppData,
}

#[derive(Debug)]
struct DeviceState {
    developer_options: bool,
    usb_debugging: bool,
    props: BTreeMap<String, String>,
    root_indicators: Vec<String>,
    accessibility: Vec<String>,
    sims: Vec<String>,
    device_owner: bool,
    admin_active: bool,
    probe_down: bool,

    applied: BTreeSet<Restriction>,
    failing_restrictions: BTreeSet<Restriction>,
    failing_admin: BTreeSet<AdminOp>,
    admin_calls: Vec<AdminOp>,
    wipe_reasons: Vec<String>,
}

impl Default for DeviceState {
    fn default() -> Self {
        let mut props = BTreeMap::new();
        props.insert(PROP_FLASH_LOCKED.to_string(), "1".to_string());
        props.insert(PROP_VERIFIED_BOOT_STATE.to_string(), "green".to_string());
        props.insert(PROP_BUILD_TAGS.to_string(), "release-keys".to_string());
        Self {
            developer_options: false,
            usb_debugging: false,
            props,
            root_indicators: Vec::new(),
            accessibility: Vec::new(),
            sims: Vec::new(),
            device_owner: true,
            admin_active: true,
            probe_down: false,
            applied: BTreeSet::new(),
            failing_restrictions: BTreeSet::new(),
            failing_admin: BTreeSet::new(),
            admin_calls: Vec::new(),
            wipe_reasons: Vec::new(),
        }
    }
}

/// Clean, provisioned device: owner and admin held, bootloader locked, no
/// tamper signals.
#[derive(Debug, Default)]
pub struct FakeDevice {
    state: Mutex<DeviceState>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- signal knobs ------------------------------------------------------

    pub fn set_developer_options(&self, on: bool) {
        self.lock().developer_options = on;
    }

    pub fn set_usb_debugging(&self, on: bool) {
        self.lock().usb_debugging = on;
    }

    pub fn set_property(&self, key: &str, value: &str) {
        self.lock().props.insert(key.to_string(), value.to_string());
    }

    pub fn set_root_indicators(&self, paths: &[&str]) {
        self.lock().root_indicators = paths.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_accessibility_services(&self, services: &[&str]) {
        self.lock().accessibility = services.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_sims(&self, sims: &[&str]) {
        self.lock().sims = sims.iter().map(|s| s.to_string()).collect();
    }

    /// Simulates the user removing device-owner or admin privilege.
    pub fn set_privilege(&self, device_owner: bool, admin_active: bool) {
        let mut g = self.lock();
        g.device_owner = device_owner;
        g.admin_active = admin_active;
    }

    /// Every probe call fails while set.
    pub fn set_probe_down(&self, down: bool) {
        self.lock().probe_down = down;
    }

    // --- failure injection -------------------------------------------------

    pub fn fail_restriction(&self, r: Restriction) {
        self.lock().failing_restrictions.insert(r);
    }

    pub fn fail_admin(&self, op: AdminOp) {
        self.lock().failing_admin.insert(op);
    }

    pub fn heal_all_failures(&self) {
        let mut g = self.lock();
        g.failing_restrictions.clear();
        g.failing_admin.clear();
    }

    /// Remove a restriction behind the enforcer's back.
    pub fn drift(&self, r: Restriction) {
        self.lock().applied.remove(&r);
    }

    // --- observations ------------------------------------------------------

    pub fn applied(&self) -> BTreeSet<Restriction> {
        self.lock().applied.clone()
    }

    pub fn admin_calls(&self) -> Vec<AdminOp> {
        self.lock().admin_calls.clone()
    }

    pub fn wipe_reasons(&self) -> Vec<String> {
        self.lock().wipe_reasons.clone()
    }

    pub fn owner_held(&self) -> bool {
        self.lock().device_owner
    }

    fn probe<T>(&self, f: impl FnOnce(&DeviceState) -> T) -> Result<T, ProbeError> {
        let g = self.lock();
        if g.probe_down {
            return Err(ProbeError::Unavailable("fake probe down".to_string()));
        }
        Ok(f(&g))
    }

    fn admin_call(&self, op: AdminOp) -> Result<(), PolicyError> {
        let mut g = self.lock();
        g.admin_calls.push(op);
        if g.failing_admin.contains(&op) {
            return Err(PolicyError::Platform(format!("injected failure: {op:?}")));
        }
        Ok(())
    }
}

impl DeviceProbe for FakeDevice {
    fn developer_options_enabled(&self) -> Result<bool, ProbeError> {
        self.probe(|s| s.developer_options)
    }

    fn usb_debugging_enabled(&self) -> Result<bool, ProbeError> {
        self.probe(|s| s.usb_debugging)
    }

    fn system_property(&self, key: &str) -> Result<Option<String>, ProbeError> {
        self.probe(|s| s.props.get(key).filter(|v| !v.is_empty()).cloned())
    }

    fn root_indicators(&self) -> Result<Vec<String>, ProbeError> {
        self.probe(|s| s.root_indicators.clone())
    }

    fn enabled_accessibility_services(&self) -> Result<Vec<String>, ProbeError> {
        self.probe(|s| s.accessibility.clone())
    }

    fn sim_serials(&self) -> Result<Vec<String>, ProbeError> {
        self.probe(|s| s.sims.clone())
    }

    fn is_device_owner(&self) -> Result<bool, ProbeError> {
        self.probe(|s| s.device_owner)
    }

    fn is_admin_active(&self) -> Result<bool, ProbeError> {
        self.probe(|s| s.admin_active)
    }
}

impl DevicePolicy for FakeDevice {
    fn apply(&self, r: Restriction) -> Result<(), PolicyError> {
        let mut g = self.lock();
        if g.failing_restrictions.contains(&r) {
            return Err(PolicyError::Denied(r.to_string()));
        }
        g.applied.insert(r);
        Ok(())
    }

    fn clear(&self, r: Restriction) -> Result<(), PolicyError> {
        let mut g = self.lock();
        if g.failing_restrictions.contains(&r) {
            return Err(PolicyError::Denied(r.to_string()));
        }
        g.applied.remove(&r);
        Ok(())
    }

    fn is_applied(&self, r: Restriction) -> Result<bool, PolicyError> {
        Ok(self.lock().applied.contains(&r))
    }
}

impl DeviceAdmin for FakeDevice {
    fn wipe_data(&self, reason: &str) -> Result<(), PolicyError> {
        self.lock().wipe_reasons.push(reason.to_string());
        self.admin_call(AdminOp::Wipe)
    }

    fn reset_global_policies(&self) -> Result<(), PolicyError> {
        self.admin_call(AdminOp::ResetGlobalPolicies)
    }

    fn unsuspend_all_apps(&self) -> Result<(), PolicyError> {
        self.admin_call(AdminOp::UnsuspendApps)
    }

    fn release_device_owner(&self) -> Result<(), PolicyError> {
        self.admin_call(AdminOp::ReleaseDeviceOwner)?;
        let mut g = self.lock();
        g.device_owner = false;
        g.admin_active = false;
        Ok(())
    }

    fn clear_app_data(&self) -> Result<(), PolicyError> {
        self.admin_call(AdminOp::ClearAppData)
    }
}

impl DeviceInfo for FakeDevice {
    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            android_id: Some("fake-android-id".to_string()),
            model: Some("Fake Phone".to_string()),
            manufacturer: Some("Payo".to_string()),
            serial_number: Some("FAKE0001".to_string()),
            os_version: Some("14".to_string()),
            sdk_version: Some("34".to_string()),
            security_patch_level: None,
            device_imeis: Vec::new(),
        }
    }

    fn battery_level(&self) -> Option<u8> {
        Some(80)
    }
}
