//! Collectors + escalator against a scripted probe.
//!
//! Invariants under test:
//! - each collector reports while its condition holds and clears after,
//! - the escalator fires once per rising edge and again after a clear,
//! - probe failures are "unknown": no event and no clear,
//! - accessibility and SIM checks diff against their allow-lists.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use payo_lock::{LockState, ReasonCategory, Severity};
use payo_tamper::{
    standard_collectors, CollectorSettings, DeviceProbe, Escalator, Observation, ProbeError,
    TamperCollector, TamperType,
};

#[derive(Default)]
struct Scripted {
    dev_options: bool,
    adb: bool,
    props: HashMap<String, String>,
    root: Vec<String>,
    a11y: Vec<String>,
    sims: Vec<String>,
    owner: bool,
    admin: bool,
    broken: bool,
}

struct ScriptedProbe(Mutex<Scripted>);

impl ScriptedProbe {
    fn healthy() -> Arc<Self> {
        let mut s = Scripted {
            owner: true,
            admin: true,
            ..Default::default()
        };
        s.props
            .insert("ro.boot.verifiedbootstate".to_string(), "green".to_string());
        s.props
            .insert("ro.boot.flash.locked".to_string(), "1".to_string());
        s.sims.push("8925401".to_string());
        Arc::new(Self(Mutex::new(s)))
    }

    fn edit(&self, f: impl FnOnce(&mut Scripted)) {
        f(&mut self.0.lock().unwrap());
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Scripted>, ProbeError> {
        let g = self.0.lock().unwrap();
        if g.broken {
            return Err(ProbeError::Unavailable("settings binder dead".to_string()));
        }
        Ok(g)
    }
}

impl DeviceProbe for ScriptedProbe {
    fn developer_options_enabled(&self) -> Result<bool, ProbeError> {
        Ok(self.guard()?.dev_options)
    }
    fn usb_debugging_enabled(&self) -> Result<bool, ProbeError> {
        Ok(self.guard()?.adb)
    }
    fn system_property(&self, key: &str) -> Result<Option<String>, ProbeError> {
        Ok(self.guard()?.props.get(key).cloned())
    }
    fn root_indicators(&self) -> Result<Vec<String>, ProbeError> {
        Ok(self.guard()?.root.clone())
    }
    fn enabled_accessibility_services(&self) -> Result<Vec<String>, ProbeError> {
        Ok(self.guard()?.a11y.clone())
    }
    fn sim_serials(&self) -> Result<Vec<String>, ProbeError> {
        Ok(self.guard()?.sims.clone())
    }
    fn is_device_owner(&self) -> Result<bool, ProbeError> {
        Ok(self.guard()?.owner)
    }
    fn is_admin_active(&self) -> Result<bool, ProbeError> {
        Ok(self.guard()?.admin)
    }
}

fn collectors(probe: Arc<ScriptedProbe>) -> Vec<Arc<dyn TamperCollector>> {
    let settings = CollectorSettings {
        allowed_accessibility: BTreeSet::from(["com.example.tts/.Reader".to_string()]),
        registered_sims: BTreeSet::from(["8925401".to_string()]),
        ..Default::default()
    };
    standard_collectors(probe, "dev-1", settings)
}

fn fired(cs: &[Arc<dyn TamperCollector>]) -> Vec<TamperType> {
    cs.iter()
        .filter_map(|c| c.check().event())
        .map(|e| e.tamper_type)
        .collect()
}

#[test]
fn healthy_device_reports_nothing() {
    let probe = ScriptedProbe::healthy();
    let cs = collectors(probe);
    assert!(fired(&cs).is_empty());
}

#[test]
fn default_cadences_are_applied() {
    let cs = collectors(ScriptedProbe::healthy());
    let by_name: HashMap<&str, Duration> = cs.iter().map(|c| (c.name(), c.cadence())).collect();
    assert_eq!(by_name["developer_options"], Duration::from_secs(2));
    assert_eq!(by_name["accessibility"], Duration::from_secs(3));
    assert_eq!(by_name["device_owner"], Duration::from_secs(5));
}

#[test]
fn each_condition_maps_to_its_type() {
    let probe = ScriptedProbe::healthy();
    let cs = collectors(probe.clone());

    probe.edit(|s| {
        s.dev_options = true;
        s.adb = true;
        s.root.push("/system/xbin/su".to_string());
        s.a11y.push("com.example.tts/.Reader".to_string());
        s.a11y.push("com.evil.clicker/.Auto".to_string());
        s.sims.push("9999999".to_string());
        s.props
            .insert("ro.boot.verifiedbootstate".to_string(), "orange".to_string());
        s.props
            .insert("ro.boot.flash.locked".to_string(), "0".to_string());
        s.owner = false;
    });

    let got = fired(&cs);
    for t in [
        TamperType::DeveloperMode,
        TamperType::UsbDebugging,
        TamperType::Rooted,
        TamperType::AccessibilityService,
        TamperType::SimChanged,
        TamperType::BootloaderUnlocked,
        TamperType::DeviceOwnerRemoved,
    ] {
        assert!(got.contains(&t), "missing {t}");
    }
}

#[test]
fn unknown_boot_state_is_medium() {
    let probe = ScriptedProbe::healthy();
    probe.edit(|s| s.props.clear());
    let cs = collectors(probe);
    let ev = cs
        .iter()
        .find(|c| c.name() == "bootloader")
        .and_then(|c| c.check().event())
        .unwrap();
    assert_eq!(ev.tamper_type, TamperType::VerifiedBootUnknown);
    assert_eq!(ev.severity, Severity::Medium);
}

#[test]
fn failed_read_is_unknown_not_clear() {
    let probe = ScriptedProbe::healthy();
    probe.edit(|s| {
        s.dev_options = true;
        s.broken = true;
    });
    let cs = collectors(probe);
    assert!(fired(&cs).is_empty());
    for c in &cs {
        assert_eq!(c.check(), Observation::Unknown, "{}", c.name());
    }
}

#[test]
fn flaky_reads_keep_latch_on_steady_signal() {
    let probe = ScriptedProbe::healthy();
    let cs = collectors(probe.clone());
    let dev = cs
        .iter()
        .find(|c| c.name() == "developer_options")
        .unwrap()
        .clone();
    let mut esc = Escalator::new(3, Duration::from_secs(3600));
    let mut current = LockState::None;

    probe.edit(|s| s.dev_options = true);
    for _ in 0..4 {
        // Same handling as the runtime loop: only a real clear releases.
        for broken in [false, true] {
            probe.edit(|s| s.broken = broken);
            match dev.check() {
                Observation::Detected(ev) => {
                    if let Some(e) = esc.on_event(&ev, current) {
                        current = e.target;
                        assert_ne!(e.reason.category, ReasonCategory::RepeatedViolations);
                    }
                }
                Observation::Clear => esc.on_clear(dev.kinds()),
                Observation::Unknown => {}
            }
        }
    }
    assert_eq!(current, LockState::HardLocked);
    assert!(esc.is_latched(TamperType::DeveloperMode));
}

#[test]
fn dev_mode_edge_escalates_once_then_again_after_clear() {
    let probe = ScriptedProbe::healthy();
    let cs = collectors(probe.clone());
    let dev = cs
        .iter()
        .find(|c| c.name() == "developer_options")
        .unwrap()
        .clone();
    let mut esc = Escalator::new(10, Duration::from_secs(3600));

    probe.edit(|s| s.dev_options = true);
    let ev = dev.check().event().unwrap();
    let first = esc.on_event(&ev, LockState::None).unwrap();
    assert_eq!(first.target, LockState::HardLocked);
    assert_eq!(first.reason.category, ReasonCategory::DeviceTampering);

    // still on: latched
    let ev = dev.check().event().unwrap();
    assert!(esc.on_event(&ev, LockState::HardLocked).is_none());

    // off: collector clears, latch released
    probe.edit(|s| s.dev_options = false);
    assert!(dev.check().is_clear());
    esc.on_clear(dev.kinds());

    probe.edit(|s| s.dev_options = true);
    let ev = dev.check().event().unwrap();
    assert!(esc.on_event(&ev, LockState::HardLocked).is_some());
}
