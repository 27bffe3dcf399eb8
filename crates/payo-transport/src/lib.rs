//! Backend transport for the device agent.
//!
//! `client` performs single signed HTTP calls; `heartbeat` layers bounded
//! retry and the offline queue on top.

mod client;
mod clock;
mod error;
mod heartbeat;
mod queue;
mod retry;
mod signing;

pub use client::{
    confirm_deactivation_path, heartbeat_path, tamper_report_path, BackendClient, HttpBackend,
    HEADER_API_KEY, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
pub use clock::HeartbeatClock;
pub use error::{QueueError, SendFailure, TransportError};
pub use heartbeat::{Delivery, FlushOutcome, HeartbeatTransport};
pub use queue::{MemoryQueue, OfflineQueue, QueueItem, Queued};
pub use retry::RetryPolicy;
pub use signing::{sign_body, verify_signature};
