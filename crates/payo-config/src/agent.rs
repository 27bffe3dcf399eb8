//! Typed agent configuration extracted from the merged JSON.
//!
//! Every section is optional in YAML; missing fields take the defaults below.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub factor: u32,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2,
            max_attempts: 3,
        }
    }
}

/// Poll period per collector, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorCadence {
    pub developer_options_secs: u64,
    pub usb_debugging_secs: u64,
    pub bootloader_secs: u64,
    pub root_secs: u64,
    pub accessibility_secs: u64,
    pub sim_change_secs: u64,
    pub device_owner_secs: u64,
}

impl Default for CollectorCadence {
    fn default() -> Self {
        Self {
            developer_options_secs: 2,
            usb_debugging_secs: 2,
            bootloader_secs: 2,
            root_secs: 2,
            accessibility_secs: 3,
            sim_change_secs: 3,
            device_owner_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    pub soft_lock_hours_before_due: i64,
    pub hard_lock_after_overdue_days: i64,
    pub check_interval_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            soft_lock_hours_before_due: 24,
            hard_lock_after_overdue_days: 3,
            check_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub repeated_violation_limit: u32,
    pub violation_window_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            repeated_violation_limit: 3,
            violation_window_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeactivationConfig {
    pub confirm_attempts: u32,
    pub confirm_delay_ms: u64,
}

impl Default for DeactivationConfig {
    fn default() -> Self {
        Self {
            confirm_attempts: 3,
            confirm_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub tamper_log_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "payo-agent.sqlite".to_string(),
            tamper_log_path: "tamper.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Server-assigned id; `None` until first registration.
    pub device_id: Option<String>,
    pub allowed_accessibility_services: Vec<String>,
    pub backend: BackendConfig,
    pub heartbeat_interval_secs: u64,
    pub retry: RetryConfig,
    pub collectors: CollectorCadence,
    pub watchdog_interval_secs: u64,
    pub payment: PaymentConfig,
    pub escalation: EscalationConfig,
    pub deactivation: DeactivationConfig,
    pub storage: StorageConfig,
    pub daemon_addr: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            allowed_accessibility_services: Vec::new(),
            backend: BackendConfig::default(),
            heartbeat_interval_secs: 30,
            retry: RetryConfig::default(),
            collectors: CollectorCadence::default(),
            watchdog_interval_secs: 5,
            payment: PaymentConfig::default(),
            escalation: EscalationConfig::default(),
            deactivation: DeactivationConfig::default(),
            storage: StorageConfig::default(),
            daemon_addr: "127.0.0.1:8899".to_string(),
        }
    }
}

fn section<T: DeserializeOwned + Default>(v: &Value, pointer: &str) -> Result<T> {
    match v.pointer(pointer) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(node) => serde_json::from_value(node.clone())
            .with_context(|| format!("invalid config section {pointer}")),
    }
}

fn u64_at(v: &Value, pointer: &str, default: u64) -> Result<u64> {
    match v.pointer(pointer) {
        None | Some(Value::Null) => Ok(default),
        Some(node) => node
            .as_u64()
            .with_context(|| format!("config {pointer} must be a non-negative integer")),
    }
}

impl AgentConfig {
    pub fn from_json(v: &Value) -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            device_id: v
                .pointer("/device/device_id")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            allowed_accessibility_services: section(v, "/device/allowed_accessibility_services")?,
            backend: BackendConfig {
                base_url: v
                    .pointer("/backend/base_url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim_end_matches('/')
                    .to_string(),
                timeout_ms: u64_at(v, "/backend/timeout_ms", d.backend.timeout_ms)?,
            },
            heartbeat_interval_secs: u64_at(
                v,
                "/heartbeat/interval_secs",
                d.heartbeat_interval_secs,
            )?,
            retry: section(v, "/retry")?,
            collectors: section(v, "/collectors")?,
            watchdog_interval_secs: u64_at(v, "/watchdog/interval_secs", d.watchdog_interval_secs)?,
            payment: section(v, "/payment")?,
            escalation: section(v, "/escalation")?,
            deactivation: section(v, "/deactivation")?,
            storage: section(v, "/storage")?,
            daemon_addr: v
                .pointer("/daemon/addr")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(d.daemon_addr),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would stall a loop or disable retry entirely.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 || self.watchdog_interval_secs == 0 {
            bail!("CONFIG_INVALID: heartbeat and watchdog intervals must be > 0");
        }
        if self.retry.max_attempts == 0 || self.retry.factor == 0 {
            bail!("CONFIG_INVALID: retry.max_attempts and retry.factor must be >= 1");
        }
        if self.escalation.repeated_violation_limit == 0 {
            bail!("CONFIG_INVALID: escalation.repeated_violation_limit must be >= 1");
        }
        let c = &self.collectors;
        let cadences = [
            c.developer_options_secs,
            c.usb_debugging_secs,
            c.bootloader_secs,
            c.root_secs,
            c.accessibility_secs,
            c.sim_change_secs,
            c.device_owner_secs,
        ];
        if cadences.contains(&0) {
            bail!("CONFIG_INVALID: collector cadences must be > 0");
        }
        if self.payment.hard_lock_after_overdue_days < 0
            || self.payment.soft_lock_hours_before_due < 0
        {
            bail!("CONFIG_INVALID: payment thresholds must be non-negative");
        }
        Ok(())
    }
}
