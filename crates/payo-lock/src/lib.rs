//! payo-lock
//!
//! Device lock state machine: the lock levels, typed reasons, the pure
//! transition policy and the [`LockStateManager`] that owns the one
//! persisted [`LockRecord`].
//!
//! State edges:
//!
//! ```text
//!   None ──► SoftLocked ──► HardLocked ──► PermanentLocked
//!    ▲            │              │                │
//!    └────────────┴──────────────┘                │      (ServerUnlock / UnlockCode)
//!    ▲                                            │
//!    └────────────────────────────────────────────┘      (ServerUnlock)
//!
//!   any ──► Deactivating (ServerDeactivate only; terminal)
//! ```

pub mod manager;
pub mod payment;
pub mod policy;
pub mod reason;
mod record;
mod state;

pub use manager::{LockChange, LockError, LockListener, LockStateManager};
pub use payment::{MemoryScheduleStore, PaymentPolicy, PaymentSchedule, ScheduleStore};
pub use policy::{decide, Decision, TransitionRejected};
pub use reason::{categorize_legacy, LockReason, ReasonCategory, Severity};
pub use record::{LockRecord, LockStore, MemoryLockStore, StoreError};
pub use state::{LockState, TransitionSource};
