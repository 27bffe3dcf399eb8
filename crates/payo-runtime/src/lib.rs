//! payo-runtime
//!
//! Agent wiring: the tamper dispatcher, server command processing, the
//! heartbeat, watchdog and payment loops, and the deactivation sequencer.
//!
//! # Invariants
//! - Every lock transition goes through the one [`payo_lock::LockStateManager`].
//! - Monitoring loops share one cancellation token; deactivation cancels it
//!   before touching device policy.

mod agent;
mod commands;
mod deactivation;
mod dispatcher;
mod events;
mod heartbeat;
mod payment;
mod tasks;
mod watchdog;

pub use agent::{Agent, AgentDeps, AgentHandle, AgentSettings};
pub use commands::{CommandError, CommandOutcome, CommandProcessor};
pub use deactivation::{
    ConfirmSettings, DeactivationPhaseFailure, DeactivationReport, DeactivationResult,
    DeactivationSequencer, Phase, PhaseOutcome,
};
pub use dispatcher::{tamper_report, Dispatcher};
pub use events::{AgentEvent, AgentNotice, TamperFlags};
pub use heartbeat::{DeviceInfo, HeartbeatLoop, HeartbeatTick};
pub use payment::{hash_code, PaymentTracker, UnlockCodeError};
pub use tasks::spawn_periodic;
pub use watchdog::{Health, PrivilegeLost, Watchdog};

pub use payo_db::{CommandLedger, MemoryCommandLedger};
