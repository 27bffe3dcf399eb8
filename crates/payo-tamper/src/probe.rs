//! Read-only view of the platform.
//!
//! Implementations live outside this crate (the daemon's shell adapter, the
//! testkit fake). Collectors only ever read through this trait.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe unavailable: {0}")]
    Unavailable(String),
    #[error("probe returned unparseable output: {0}")]
    Malformed(String),
}

pub trait DeviceProbe: Send + Sync {
    fn developer_options_enabled(&self) -> Result<bool, ProbeError>;
    fn usb_debugging_enabled(&self) -> Result<bool, ProbeError>;
    /// `Ok(None)` when the property is unset or empty.
    fn system_property(&self, key: &str) -> Result<Option<String>, ProbeError>;
    /// Paths or packages that indicate root (su binaries, manager apps).
    fn root_indicators(&self) -> Result<Vec<String>, ProbeError>;
    /// Component names of enabled accessibility services.
    fn enabled_accessibility_services(&self) -> Result<Vec<String>, ProbeError>;
    fn sim_serials(&self) -> Result<Vec<String>, ProbeError>;
    fn is_device_owner(&self) -> Result<bool, ProbeError>;
    fn is_admin_active(&self) -> Result<bool, ProbeError>;
}
