//! Ordered teardown that hands the device back to its owner.
//!
//! # Invariants
//! - Single flight: a second caller while one run is active gets
//!   [`DeactivationResult::AlreadyInProgress`] without waiting.
//! - Every phase runs even if an earlier one failed; completed phases are
//!   never rolled back.
//! - Device owner is released only after all persisted state is cleared.
//! - Success means exactly that ReleaseDeviceOwner succeeded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use payo_db::{CommandLedger, RegistrationStore};
use payo_enforce::{DeviceAdmin, Enforcer};
use payo_lock::LockStateManager;
use payo_schemas::{ConfirmStatus, DeactivationConfirm};
use payo_transport::HeartbeatTransport;

use crate::payment::PaymentTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    StopMonitoring,
    ClearRestrictions,
    ResetGlobalPolicies,
    UnsuspendApps,
    ClearPersistedState,
    ReleaseDeviceOwner,
    ClearAppData,
    ReportBackend,
}

impl Phase {
    pub const ORDER: [Phase; 8] = [
        Phase::StopMonitoring,
        Phase::ClearRestrictions,
        Phase::ResetGlobalPolicies,
        Phase::UnsuspendApps,
        Phase::ClearPersistedState,
        Phase::ReleaseDeviceOwner,
        Phase::ClearAppData,
        Phase::ReportBackend,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::StopMonitoring => "stop_monitoring",
            Phase::ClearRestrictions => "clear_restrictions",
            Phase::ResetGlobalPolicies => "reset_global_policies",
            Phase::UnsuspendApps => "unsuspend_apps",
            Phase::ClearPersistedState => "clear_persisted_state",
            Phase::ReleaseDeviceOwner => "release_device_owner",
            Phase::ClearAppData => "clear_app_data",
            Phase::ReportBackend => "report_backend",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("deactivation phase {phase} failed: {message}")]
pub struct DeactivationPhaseFailure {
    pub phase: Phase,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub error: Option<DeactivationPhaseFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeactivationReport {
    pub phases: Vec<PhaseOutcome>,
}

impl DeactivationReport {
    pub fn outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeactivationPhaseFailure> {
        self.phases.iter().filter_map(|p| p.error.as_ref())
    }

    fn succeeded(&self, phase: Phase) -> bool {
        self.outcome(phase).is_some_and(|p| p.error.is_none())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeactivationResult {
    Success(DeactivationReport),
    Failure {
        reason: String,
        report: DeactivationReport,
    },
    AlreadyInProgress,
}

impl DeactivationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DeactivationResult::Success(_))
    }

    pub fn report(&self) -> Option<&DeactivationReport> {
        match self {
            DeactivationResult::Success(r) => Some(r),
            DeactivationResult::Failure { report, .. } => Some(report),
            DeactivationResult::AlreadyInProgress => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmSettings {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ConfirmSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

pub struct DeactivationSequencer {
    in_progress: AtomicBool,
    device_id: String,
    monitoring: CancellationToken,
    enforcer: Arc<Enforcer>,
    admin: Arc<dyn DeviceAdmin>,
    manager: Arc<LockStateManager>,
    ledger: Arc<dyn CommandLedger>,
    registration: Arc<dyn RegistrationStore>,
    transport: Arc<HeartbeatTransport>,
    payment: Arc<PaymentTracker>,
    confirm: ConfirmSettings,
}

impl DeactivationSequencer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: impl Into<String>,
        monitoring: CancellationToken,
        enforcer: Arc<Enforcer>,
        admin: Arc<dyn DeviceAdmin>,
        manager: Arc<LockStateManager>,
        ledger: Arc<dyn CommandLedger>,
        registration: Arc<dyn RegistrationStore>,
        transport: Arc<HeartbeatTransport>,
        payment: Arc<PaymentTracker>,
        confirm: ConfirmSettings,
    ) -> Self {
        Self {
            in_progress: AtomicBool::new(false),
            device_id: device_id.into(),
            monitoring,
            enforcer,
            admin,
            manager,
            ledger,
            registration,
            transport,
            payment,
            confirm,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub async fn deactivate(&self) -> DeactivationResult {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("deactivation already in progress");
            return DeactivationResult::AlreadyInProgress;
        }

        tracing::warn!(device_id = %self.device_id, "deactivation started");
        let mut report = DeactivationReport::default();
        for phase in Phase::ORDER {
            let res = if phase == Phase::ReportBackend {
                let released = report.succeeded(Phase::ReleaseDeviceOwner);
                self.report_backend(released, &report).await
            } else {
                self.run_phase(phase).await
            };
            let error = match res {
                Ok(()) => {
                    tracing::info!(phase = %phase, "deactivation phase complete");
                    None
                }
                Err(message) => {
                    tracing::error!(phase = %phase, error = %message, "deactivation phase failed");
                    Some(DeactivationPhaseFailure { phase, message })
                }
            };
            report.phases.push(PhaseOutcome { phase, error });
        }

        self.in_progress.store(false, Ordering::SeqCst);

        match report.outcome(Phase::ReleaseDeviceOwner).and_then(|p| p.error.clone()) {
            None => {
                tracing::warn!("deactivation complete; device owner released");
                DeactivationResult::Success(report)
            }
            Some(f) => DeactivationResult::Failure {
                reason: f.to_string(),
                report,
            },
        }
    }

    async fn run_phase(&self, phase: Phase) -> Result<(), String> {
        match phase {
            Phase::StopMonitoring => {
                self.monitoring.cancel();
                Ok(())
            }
            Phase::ClearRestrictions => self
                .enforcer
                .clear_all()
                .into_result()
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Phase::ResetGlobalPolicies => {
                self.admin.reset_global_policies().map_err(|e| e.to_string())
            }
            Phase::UnsuspendApps => self.admin.unsuspend_all_apps().map_err(|e| e.to_string()),
            Phase::ClearPersistedState => self.clear_persisted().await,
            Phase::ReleaseDeviceOwner => {
                self.admin.release_device_owner().map_err(|e| e.to_string())
            }
            Phase::ClearAppData => self.admin.clear_app_data().map_err(|e| e.to_string()),
            Phase::ReportBackend => Ok(()),
        }
    }

    /// Clears every store; reports all failures, not just the first.
    async fn clear_persisted(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        if let Err(e) = self.manager.clear_for_deactivation().await {
            errors.push(format!("lock state: {e}"));
        }
        if let Err(e) = self.registration.clear_registration().await {
            errors.push(format!("registration: {e}"));
        }
        if let Err(e) = self.transport.clear_queues().await {
            errors.push(format!("queues: {e}"));
        }
        if let Err(e) = self.ledger.clear().await {
            errors.push(format!("ledger: {e}"));
        }
        if let Err(e) = self.payment.clear().await {
            errors.push(format!("payment schedule: {e}"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    async fn report_backend(&self, released: bool, report: &DeactivationReport) -> Result<(), String> {
        let body = if released {
            DeactivationConfirm {
                status: ConfirmStatus::Success,
                message: "device owner released".to_string(),
            }
        } else {
            let failed: Vec<&str> = report.failures().map(|f| f.phase.as_str()).collect();
            DeactivationConfirm {
                status: ConfirmStatus::Failed,
                message: format!("failed phases: {}", failed.join(",")),
            }
        };

        let backend = self.transport.backend();
        let attempts = self.confirm.attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match backend.confirm_deactivation(&self.device_id, &body).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "deactivation confirm failed");
                    last = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.confirm.delay).await;
                    }
                }
            }
        }
        Err(format!("confirm not delivered after {attempts} attempt(s): {last}"))
    }
}
