//! Write-side platform collaborators.
//!
//! Implement with the Device Owner bridge in production; the testkit supplies
//! fakes with per-call failure injection.

use crate::restriction::Restriction;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("platform denied {0}")]
    Denied(String),
    #[error("not supported on this device: {0}")]
    Unsupported(String),
    #[error("platform call failed: {0}")]
    Platform(String),
}

pub trait DevicePolicy: Send + Sync {
    /// Idempotent: applying an applied restriction succeeds.
    fn apply(&self, r: Restriction) -> Result<(), PolicyError>;
    /// Idempotent: clearing a clear restriction succeeds.
    fn clear(&self, r: Restriction) -> Result<(), PolicyError>;
    fn is_applied(&self, r: Restriction) -> Result<bool, PolicyError>;
}

pub trait DeviceAdmin: Send + Sync {
    fn wipe_data(&self, reason: &str) -> Result<(), PolicyError>;
    fn reset_global_policies(&self) -> Result<(), PolicyError>;
    fn unsuspend_all_apps(&self) -> Result<(), PolicyError>;
    fn release_device_owner(&self) -> Result<(), PolicyError>;
    fn clear_app_data(&self) -> Result<(), PolicyError>;
}
