//! Single consumer of collector events.
//!
//! # Invariants
//! - All tamper-driven transitions go through this one task, in arrival order.
//! - The tamper log entry and the backend report are written after the
//!   transition is durable and carry the resulting lock state.
//! - Backend reports run on their own task; a slow backend never delays the
//!   next event.
//! - Once the lock has gone down since the last event, every escalator latch
//!   is released first, so a signal that is still active locks again.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use payo_audit::TamperLog;
use payo_lock::{LockError, LockState, LockStateManager, TransitionSource};
use payo_schemas::TamperReport;
use payo_tamper::{Escalator, TamperEvent};
use payo_transport::HeartbeatTransport;

use crate::events::{AgentEvent, AgentNotice, TamperFlags};

pub struct Dispatcher {
    manager: Arc<LockStateManager>,
    escalator: Escalator,
    flags: TamperFlags,
    tamper_log: Option<TamperLog>,
    transport: Option<Arc<HeartbeatTransport>>,
    notices: Option<broadcast::Sender<AgentNotice>>,
    last_seen: LockState,
}

impl Dispatcher {
    pub fn new(manager: Arc<LockStateManager>, escalator: Escalator, flags: TamperFlags) -> Self {
        let last_seen = manager.state();
        Self {
            manager,
            escalator,
            flags,
            tamper_log: None,
            transport: None,
            notices: None,
            last_seen,
        }
    }

    pub fn with_tamper_log(mut self, log: TamperLog) -> Self {
        self.tamper_log = Some(log);
        self
    }

    pub fn with_transport(mut self, transport: Arc<HeartbeatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_notices(mut self, notices: broadcast::Sender<AgentNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<AgentEvent>, cancel: CancellationToken) {
        tracing::info!("tamper dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => {
                        self.handle(ev).await;
                    }
                    None => break,
                },
            }
        }
        tracing::info!("tamper dispatcher stopped");
    }

    /// Process one event. Returns the lock state in force afterwards.
    pub async fn handle(&mut self, event: AgentEvent) -> LockState {
        self.release_after_downgrade();
        let state = match event {
            AgentEvent::Cleared(kinds) => {
                tracing::info!(kinds = ?kinds, "tamper signal cleared");
                self.escalator.on_clear(&kinds);
                self.flags.clear(&kinds);
                self.manager.state()
            }
            AgentEvent::Tamper(ev) => self.on_tamper(ev).await,
        };
        self.last_seen = state;
        state
    }

    fn release_after_downgrade(&mut self) {
        let now = self.manager.state();
        if let (Some(before), Some(after)) = (self.last_seen.rank(), now.rank()) {
            if after < before {
                tracing::info!(from = %self.last_seen, to = %now, "lock lowered; re-arming tamper latches");
                self.escalator.release_all();
            }
        }
        self.last_seen = now;
    }

    async fn on_tamper(&mut self, ev: TamperEvent) -> LockState {
        self.flags.raise(ev.tamper_type);
        let current = self.manager.state();
        let Some(escalation) = self.escalator.on_event(&ev, current) else {
            // Still latched from an earlier detection.
            return current;
        };

        tracing::warn!(
            tamper_type = %ev.tamper_type,
            severity = ev.severity.as_str(),
            target = %escalation.target,
            details = %ev.details,
            "tamper detected"
        );

        let state = match self
            .manager
            .request_transition(
                escalation.target,
                escalation.reason,
                TransitionSource::TamperCollector,
            )
            .await
        {
            Ok(s) => s,
            Err(LockError::Rejected(r)) => {
                tracing::info!(reason = %r, "tamper escalation not applied");
                self.manager.state()
            }
            Err(e @ LockError::Storage(_)) => {
                // Latch released so the still-active signal retries next tick.
                tracing::error!(error = %e, "tamper escalation not persisted");
                self.escalator.on_clear(&[ev.tamper_type]);
                self.manager.state()
            }
        };

        if let Some(log) = self.tamper_log.as_mut() {
            if let Err(e) = log.append(&ev, state.as_str()) {
                tracing::error!(error = %e, "tamper log append failed");
            }
        }

        if let Some(tx) = &self.notices {
            let _ = tx.send(AgentNotice::Tamper {
                tamper_type: ev.tamper_type.as_str().to_string(),
                severity: ev.severity.as_str().to_string(),
                lock_state: state.as_str().to_string(),
            });
        }

        if let Some(transport) = &self.transport {
            let transport = Arc::clone(transport);
            let report = tamper_report(&ev, state);
            tokio::spawn(async move {
                match transport.report_tamper(report).await {
                    Ok(true) => tracing::debug!("tamper report delivered"),
                    Ok(false) => tracing::info!("tamper report queued offline"),
                    Err(e) => tracing::warn!(error = %e, "tamper report dropped"),
                }
            });
        }

        state
    }
}

pub fn tamper_report(ev: &TamperEvent, state: LockState) -> TamperReport {
    TamperReport {
        event_id: ev.event_id,
        device_id: ev.device_id.clone(),
        tamper_type: ev.tamper_type.as_str().to_string(),
        severity: ev.severity.as_str().to_string(),
        detected_at: ev.detected_at,
        details: ev.details.clone(),
        timestamp_ms: ev.detected_at.timestamp_millis(),
        lock_state: state.as_str().to_string(),
    }
}
