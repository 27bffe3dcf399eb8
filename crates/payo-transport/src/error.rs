// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

use payo_schemas::HeartbeatResponse;

/// Failure talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connect, DNS, TLS or timeout failure.
    #[error("network error: {0}")]
    Network(String),
    /// 5xx from the backend.
    #[error("backend error status={status}: {body}")]
    Server { status: u16, body: String },
    /// 4xx, or a `success: false` envelope. Retrying will not help.
    #[error("backend rejected request status={status}: {message}")]
    Rejected { status: u16, message: String },
    /// 2xx with a body that does not match the contract.
    #[error("decode error: {0}")]
    Decode(String),
    /// The offline queue itself failed while handling a send.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl TransportError {
    /// Only network failures and 5xx are retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_) | TransportError::Server { .. }
        )
    }
}

/// A heartbeat send that failed, with whatever the queue flush delivered
/// before the failure. Those responses are real backend replies and must
/// still be acted on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error} ({} queued heartbeat(s) delivered first)", .flushed.len())]
pub struct SendFailure {
    pub error: TransportError,
    pub flushed: Vec<HeartbeatResponse>,
}

impl SendFailure {
    pub fn is_transient(&self) -> bool {
        self.error.is_transient()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("offline queue: {0}")]
pub struct QueueError(pub String);
