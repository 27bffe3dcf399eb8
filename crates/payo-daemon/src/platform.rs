//! Shell adapter for the platform traits.
//!
//! Reads come straight from the Android shell (`settings`, `getprop`, `dpm`).
//! Writes go through the companion Device Owner receiver via
//! `am broadcast`; the receiver answers with `result=-1` on success and puts
//! query answers in `data="..."`.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use payo_enforce::{DeviceAdmin, DevicePolicy, PolicyError, Restriction};
use payo_runtime::DeviceInfo;
use payo_schemas::DeviceIdentity;
use payo_tamper::{DeviceProbe, ProbeError};

pub const BRIDGE_ACTION: &str = "com.payo.agent.action.POLICY";
const RESULT_OK: &str = "result=-1";

const ROOT_PATHS: [&str; 8] = [
    "/system/bin/su",
    "/system/xbin/su",
    "/sbin/su",
    "/su/bin/su",
    "/data/local/su",
    "/data/local/xbin/su",
    "/system/app/Superuser.apk",
    "/data/adb/magisk",
];

const ROOT_PACKAGES: [&str; 3] = [
    "com.topjohnwu.magisk",
    "eu.chainfire.supersu",
    "com.koushikdutta.superuser",
];

/// Runs one program and returns its stdout.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, String>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, String> {
        let out = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| format!("spawn {program}: {e}"))?;
        if !out.status.success() {
            return Err(format!(
                "{program} exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

pub struct ShellDevice<R: CommandRunner = SystemRunner> {
    runner: R,
    /// `package/.Receiver` of the companion app.
    component: String,
}

impl ShellDevice<SystemRunner> {
    pub fn new(component: impl Into<String>) -> Self {
        Self::with_runner(SystemRunner, component)
    }
}

impl<R: CommandRunner> ShellDevice<R> {
    pub fn with_runner(runner: R, component: impl Into<String>) -> Self {
        Self {
            runner,
            component: component.into(),
        }
    }

    fn read(&self, program: &str, args: &[&str]) -> Result<String, ProbeError> {
        self.runner
            .run(program, args)
            .map(|s| s.trim().to_string())
            .map_err(ProbeError::Unavailable)
    }

    fn setting(&self, namespace: &str, key: &str) -> Result<Option<String>, ProbeError> {
        let v = self.read("settings", &["get", namespace, key])?;
        Ok((!v.is_empty() && v != "null").then_some(v))
    }

    fn setting_flag(&self, namespace: &str, key: &str) -> Result<bool, ProbeError> {
        match self.setting(namespace, key)?.as_deref() {
            None | Some("0") => Ok(false),
            Some("1") => Ok(true),
            Some(other) => Err(ProbeError::Malformed(format!("{key}={other}"))),
        }
    }

    fn owners(&self) -> Result<String, ProbeError> {
        self.read("dpm", &["list-owners"])
    }

    fn bridge(&self, op: &str, arg: &str) -> Result<Option<String>, PolicyError> {
        let out = self
            .runner
            .run(
                "am",
                &[
                    "broadcast",
                    "-a",
                    BRIDGE_ACTION,
                    "-n",
                    &self.component,
                    "--es",
                    "op",
                    op,
                    "--es",
                    "arg",
                    arg,
                ],
            )
            .map_err(PolicyError::Platform)?;
        parse_broadcast(&out).map_err(|reason| {
            tracing::warn!(op, arg, reason = %reason, "bridge call refused");
            PolicyError::Denied(format!("{op} {arg}: {reason}"))
        })
    }
}

/// `Ok(data)` when the receiver reported success.
fn parse_broadcast(out: &str) -> Result<Option<String>, String> {
    let line = out
        .lines()
        .find(|l| l.contains("Broadcast completed"))
        .ok_or_else(|| "no broadcast result".to_string())?;
    let data = line
        .split_once("data=\"")
        .and_then(|(_, rest)| rest.rsplit_once('"'))
        .map(|(d, _)| d.to_string());
    if line.contains(RESULT_OK) {
        Ok(data)
    } else {
        Err(data.unwrap_or_else(|| line.trim().to_string()))
    }
}

impl<R: CommandRunner> DeviceProbe for ShellDevice<R> {
    fn developer_options_enabled(&self) -> Result<bool, ProbeError> {
        self.setting_flag("global", "development_settings_enabled")
    }

    fn usb_debugging_enabled(&self) -> Result<bool, ProbeError> {
        self.setting_flag("global", "adb_enabled")
    }

    fn system_property(&self, key: &str) -> Result<Option<String>, ProbeError> {
        let v = self.read("getprop", &[key])?;
        Ok((!v.is_empty()).then_some(v))
    }

    fn root_indicators(&self) -> Result<Vec<String>, ProbeError> {
        let mut found: Vec<String> = ROOT_PATHS
            .iter()
            .filter(|p| Path::new(p).exists())
            .map(|p| p.to_string())
            .collect();
        let packages = self.read("pm", &["list", "packages"])?;
        for line in packages.lines() {
            let name = line.trim().trim_start_matches("package:");
            if ROOT_PACKAGES.contains(&name) {
                found.push(name.to_string());
            }
        }
        Ok(found)
    }

    fn enabled_accessibility_services(&self) -> Result<Vec<String>, ProbeError> {
        Ok(self
            .setting("secure", "enabled_accessibility_services")?
            .map(|v| {
                v.split(':')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn sim_serials(&self) -> Result<Vec<String>, ProbeError> {
        let mut out = Vec::new();
        for key in ["ril.iccid.sim1", "ril.iccid.sim2"] {
            if let Some(v) = self.system_property(key)? {
                out.push(v);
            }
        }
        Ok(out)
    }

    fn is_device_owner(&self) -> Result<bool, ProbeError> {
        let owners = self.owners()?;
        let package = self.component.split('/').next().unwrap_or_default();
        Ok(owners
            .lines()
            .any(|l| l.contains(package) && l.contains("Device Owner")))
    }

    fn is_admin_active(&self) -> Result<bool, ProbeError> {
        let package = self.component.split('/').next().unwrap_or_default();
        let admins = self.read("dumpsys", &["device_policy"])?;
        Ok(admins.lines().any(|l| l.contains("admin=") && l.contains(package)))
    }
}

impl<R: CommandRunner> DevicePolicy for ShellDevice<R> {
    fn apply(&self, r: Restriction) -> Result<(), PolicyError> {
        self.bridge("apply", r.as_str()).map(|_| ())
    }

    fn clear(&self, r: Restriction) -> Result<(), PolicyError> {
        self.bridge("clear", r.as_str()).map(|_| ())
    }

    fn is_applied(&self, r: Restriction) -> Result<bool, PolicyError> {
        match self.bridge("query", r.as_str())?.as_deref() {
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            other => Err(PolicyError::Platform(format!(
                "unexpected query answer for {r}: {other:?}"
            ))),
        }
    }
}

impl<R: CommandRunner> DeviceAdmin for ShellDevice<R> {
    fn wipe_data(&self, reason: &str) -> Result<(), PolicyError> {
        self.bridge("wipe", reason).map(|_| ())
    }

    fn reset_global_policies(&self) -> Result<(), PolicyError> {
        self.bridge("reset_global_policies", "").map(|_| ())
    }

    fn unsuspend_all_apps(&self) -> Result<(), PolicyError> {
        self.bridge("unsuspend_all_apps", "").map(|_| ())
    }

    fn release_device_owner(&self) -> Result<(), PolicyError> {
        self.bridge("release_device_owner", "").map(|_| ())
    }

    fn clear_app_data(&self) -> Result<(), PolicyError> {
        self.bridge("clear_app_data", "").map(|_| ())
    }
}

impl<R: CommandRunner> DeviceInfo for ShellDevice<R> {
    fn identity(&self) -> DeviceIdentity {
        let props: BTreeMap<&str, Option<String>> = [
            "ro.product.model",
            "ro.product.manufacturer",
            "ro.serialno",
            "ro.build.version.release",
            "ro.build.version.sdk",
            "ro.build.version.security_patch",
        ]
        .into_iter()
        .map(|k| (k, self.system_property(k).ok().flatten()))
        .collect();
        let get = |k: &str| props.get(k).cloned().flatten();
        DeviceIdentity {
            android_id: self.setting("secure", "android_id").ok().flatten(),
            model: get("ro.product.model"),
            manufacturer: get("ro.product.manufacturer"),
            serial_number: get("ro.serialno"),
            os_version: get("ro.build.version.release"),
            sdk_version: get("ro.build.version.sdk"),
            security_patch_level: get("ro.build.version.security_patch"),
            device_imeis: Vec::new(),
        }
    }

    fn battery_level(&self) -> Option<u8> {
        let out = self.runner.run("dumpsys", &["battery"]).ok()?;
        out.lines()
            .find_map(|l| l.trim().strip_prefix("level:"))
            .and_then(|v| v.trim().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Scripted {
        answers: BTreeMap<String, Result<String, String>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn on(mut self, cmdline: &str, out: &str) -> Self {
            self.answers.insert(cmdline.to_string(), Ok(out.to_string()));
            self
        }
    }

    impl CommandRunner for Scripted {
        fn run(&self, program: &str, args: &[&str]) -> Result<String, String> {
            let line = std::iter::once(program)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.calls.lock().unwrap().push(line.clone());
            self.answers
                .get(&line)
                .cloned()
                .unwrap_or_else(|| Err(format!("unscripted: {line}")))
        }
    }

    const COMPONENT: &str = "com.payo.agent/.PolicyReceiver";

    fn bridge_line(op: &str, arg: &str) -> String {
        format!("am broadcast -a {BRIDGE_ACTION} -n {COMPONENT} --es op {op} --es arg {arg}")
    }

    #[test]
    fn settings_flags_parse() {
        let r = Scripted::default()
            .on("settings get global development_settings_enabled", "1\n")
            .on("settings get global adb_enabled", "null\n");
        let d = ShellDevice::with_runner(r, COMPONENT);
        assert_eq!(d.developer_options_enabled(), Ok(true));
        assert_eq!(d.usb_debugging_enabled(), Ok(false));
    }

    #[test]
    fn accessibility_list_splits_on_colon() {
        let r = Scripted::default().on(
            "settings get secure enabled_accessibility_services",
            "com.a/.Svc:com.b/.Other",
        );
        let d = ShellDevice::with_runner(r, COMPONENT);
        assert_eq!(
            d.enabled_accessibility_services().unwrap(),
            vec!["com.a/.Svc".to_string(), "com.b/.Other".to_string()]
        );
    }

    #[test]
    fn device_owner_from_dpm_listing() {
        let r = Scripted::default().on(
            "dpm list-owners",
            "1 owner:\nUser  0: admin=com.payo.agent/.AdminReceiver,DeviceOwner,Affiliated Device Owner\n",
        );
        let d = ShellDevice::with_runner(r, COMPONENT);
        assert_eq!(d.is_device_owner(), Ok(true));
    }

    #[test]
    fn bridge_result_codes() {
        let ok = "Broadcasting: Intent { act=x }\nBroadcast completed: result=-1, data=\"true\"\n";
        let denied = "Broadcast completed: result=0, data=\"not device owner\"\n";
        let r = Scripted::default()
            .on(&bridge_line("query", "SMS_BLOCKED"), ok)
            .on(&bridge_line("apply", "SMS_BLOCKED"), denied);
        let d = ShellDevice::with_runner(r, COMPONENT);
        assert_eq!(d.is_applied(Restriction::SmsBlocked), Ok(true));
        assert!(matches!(
            d.apply(Restriction::SmsBlocked),
            Err(PolicyError::Denied(m)) if m.contains("not device owner")
        ));
    }

    #[test]
    fn missing_shell_is_probe_unavailable() {
        let d = ShellDevice::with_runner(Scripted::default(), COMPONENT);
        assert!(matches!(
            d.developer_options_enabled(),
            Err(ProbeError::Unavailable(_))
        ));
    }
}
