use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use payo_schemas::SecurityFlags;
use payo_tamper::{TamperEvent, TamperType};

/// Input to the single [`crate::Dispatcher`].
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Tamper(TamperEvent),
    /// A collector that had fired now reads clean for these types.
    Cleared(Vec<TamperType>),
}

/// Outward notices for the local UI bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentNotice {
    Heartbeat {
        ts_millis: i64,
        delivered: bool,
        queued_heartbeats: usize,
    },
    Tamper {
        tamper_type: String,
        severity: String,
        lock_state: String,
    },
    Log {
        level: String,
        msg: String,
    },
}

/// Tamper types currently active. Written by the dispatcher, read by the
/// heartbeat builder.
#[derive(Debug, Clone, Default)]
pub struct TamperFlags(Arc<Mutex<BTreeSet<TamperType>>>);

impl TamperFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<TamperType>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn raise(&self, t: TamperType) {
        self.lock().insert(t);
    }

    pub fn clear(&self, kinds: &[TamperType]) {
        let mut g = self.lock();
        for k in kinds {
            g.remove(k);
        }
    }

    pub fn active(&self) -> BTreeSet<TamperType> {
        self.lock().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().iter().map(|t| t.as_str().to_string()).collect()
    }

    pub fn security_flags(&self) -> SecurityFlags {
        let g = self.lock();
        SecurityFlags {
            is_device_rooted: g.contains(&TamperType::Rooted),
            is_usb_debugging_enabled: g.contains(&TamperType::UsbDebugging),
            is_developer_mode_enabled: g.contains(&TamperType::DeveloperMode),
            is_bootloader_unlocked: g.contains(&TamperType::BootloaderUnlocked),
            is_custom_rom: false,
        }
    }
}
