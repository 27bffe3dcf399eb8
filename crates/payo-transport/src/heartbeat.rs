//! Delivery of heartbeats and tamper reports with offline buffering.
//!
//! # Invariants
//! - Queued records are flushed oldest-first before any new record is sent.
//! - A record is removed from the queue only after the backend accepted it or
//!   permanently rejected it.
//! - When the backend is unreachable the new record is queued, never dropped.

use std::sync::Arc;

use payo_schemas::{HeartbeatRequest, HeartbeatResponse, TamperReport};
use tokio::sync::Mutex;

use crate::client::BackendClient;
use crate::clock::HeartbeatClock;
use crate::error::{SendFailure, TransportError};
use crate::queue::{OfflineQueue, QueueItem};
use crate::retry::RetryPolicy;

/// Result of a successful heartbeat send.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    /// Response to the snapshot passed to [`HeartbeatTransport::send`].
    pub response: HeartbeatResponse,
    /// Responses to queued heartbeats delivered first, oldest first.
    pub flushed: Vec<HeartbeatResponse>,
}

impl Delivery {
    /// Every response carried by this delivery in the order it was received.
    pub fn responses(&self) -> impl Iterator<Item = &HeartbeatResponse> {
        self.flushed.iter().chain(std::iter::once(&self.response))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub delivered: usize,
    pub dropped: usize,
    /// True when the queue was drained completely.
    pub drained: bool,
}

pub struct HeartbeatTransport {
    backend: Arc<dyn BackendClient>,
    heartbeats: Arc<dyn OfflineQueue<HeartbeatRequest>>,
    reports: Arc<dyn OfflineQueue<TamperReport>>,
    retry: RetryPolicy,
    clock: HeartbeatClock,
    // Serializes flush + send so two callers never interleave queue order.
    heartbeat_gate: Mutex<()>,
    report_gate: Mutex<()>,
}

impl HeartbeatTransport {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        heartbeats: Arc<dyn OfflineQueue<HeartbeatRequest>>,
        reports: Arc<dyn OfflineQueue<TamperReport>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            heartbeats,
            reports,
            retry,
            clock: HeartbeatClock::new(),
            heartbeat_gate: Mutex::new(()),
            report_gate: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn BackendClient> {
        &self.backend
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Seed the clock from the queue so new records sort after queued ones.
    pub async fn resume(&self) -> Result<(), TransportError> {
        if let Some(ts) = self.heartbeats.max_timestamp_ms().await? {
            self.clock.observe(ts);
        }
        Ok(())
    }

    /// Next heartbeat timestamp (strictly increasing).
    pub fn stamp(&self) -> i64 {
        self.clock.next()
    }

    pub async fn queued_heartbeats(&self) -> Result<usize, TransportError> {
        Ok(self.heartbeats.len().await?)
    }

    pub async fn queued_reports(&self) -> Result<usize, TransportError> {
        Ok(self.reports.len().await?)
    }

    /// Drop everything buffered. Used during deactivation teardown.
    pub async fn clear_queues(&self) -> Result<(), TransportError> {
        let _h = self.heartbeat_gate.lock().await;
        let _r = self.report_gate.lock().await;
        self.heartbeats.clear().await?;
        self.reports.clear().await?;
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Heartbeats
    // ---------------------------------------------------------------------------

    /// Flush the queue, then send `snapshot`.
    ///
    /// On a transient failure the snapshot is queued and the error returned.
    /// A permanent rejection of the snapshot is returned without queueing.
    /// Either way the failure carries the responses to queued heartbeats that
    /// were delivered before it.
    pub async fn send(&self, snapshot: HeartbeatRequest) -> Result<Delivery, SendFailure> {
        let _gate = self.heartbeat_gate.lock().await;
        self.clock.observe(snapshot.timestamp_ms);

        let mut flushed = Vec::new();
        match self.send_locked(&snapshot, &mut flushed).await {
            Ok(response) => Ok(Delivery { response, flushed }),
            Err(error) => Err(SendFailure { error, flushed }),
        }
    }

    async fn send_locked(
        &self,
        snapshot: &HeartbeatRequest,
        flushed: &mut Vec<HeartbeatResponse>,
    ) -> Result<HeartbeatResponse, TransportError> {
        if let Err(e) = self.flush_heartbeats_locked(flushed).await {
            self.heartbeats.push(snapshot).await?;
            tracing::warn!(
                error = %e,
                timestamp_ms = snapshot.timestamp_ms,
                delivered_first = flushed.len(),
                "backend unreachable during flush; heartbeat queued"
            );
            return Err(e);
        }

        let backend = &self.backend;
        match self
            .retry
            .run("heartbeat", || backend.send_heartbeat(snapshot))
            .await
        {
            Ok(response) => Ok(response),
            Err(e) if e.is_transient() => {
                self.heartbeats.push(snapshot).await?;
                tracing::warn!(
                    error = %e,
                    timestamp_ms = snapshot.timestamp_ms,
                    "heartbeat failed; queued for later"
                );
                Err(e)
            }
            Err(e) => {
                tracing::error!(error = %e, "heartbeat rejected by backend");
                Err(e)
            }
        }
    }

    /// Deliver queued heartbeats without sending a new one.
    pub async fn flush_heartbeats(
        &self,
    ) -> Result<(FlushOutcome, Vec<HeartbeatResponse>), TransportError> {
        let _gate = self.heartbeat_gate.lock().await;
        let mut flushed = Vec::new();
        let (drained, dropped) = match self.flush_heartbeats_locked(&mut flushed).await {
            Ok(dropped) => (true, dropped),
            Err(e) if flushed.is_empty() => return Err(e),
            Err(_) => (false, 0),
        };
        let outcome = FlushOutcome {
            delivered: flushed.len(),
            dropped,
            drained,
        };
        Ok((outcome, flushed))
    }

    async fn flush_heartbeats_locked(
        &self,
        out: &mut Vec<HeartbeatResponse>,
    ) -> Result<usize, TransportError> {
        let backend = &self.backend;
        let mut dropped = 0;
        while let Some(entry) = self.heartbeats.oldest().await? {
            match self
                .retry
                .run("heartbeat_flush", || backend.send_heartbeat(&entry.item))
                .await
            {
                Ok(resp) => {
                    self.heartbeats.remove(entry.id).await?;
                    out.push(resp);
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        timestamp_ms = entry.item.timestamp_ms(),
                        "queued heartbeat rejected; dropping"
                    );
                    self.heartbeats.remove(entry.id).await?;
                    dropped += 1;
                }
            }
        }
        if !out.is_empty() || dropped > 0 {
            tracing::info!(delivered = out.len(), dropped, "heartbeat queue flushed");
        }
        Ok(dropped)
    }

    // ---------------------------------------------------------------------------
    // Tamper reports
    // ---------------------------------------------------------------------------

    /// Send a tamper report, queueing it when the backend is unreachable.
    ///
    /// Returns `Ok(true)` when delivered now, `Ok(false)` when queued.
    pub async fn report_tamper(&self, report: TamperReport) -> Result<bool, TransportError> {
        let _gate = self.report_gate.lock().await;
        let flush = self.flush_reports_locked().await?;
        if !flush.drained {
            self.reports.push(&report).await?;
            return Ok(false);
        }

        let backend = &self.backend;
        match self
            .retry
            .run("tamper_report", || backend.report_tamper(&report))
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, event_id = %report.event_id, "tamper report queued");
                self.reports.push(&report).await?;
                Ok(false)
            }
            Err(e) => {
                tracing::error!(error = %e, event_id = %report.event_id, "tamper report rejected");
                Err(e)
            }
        }
    }

    pub async fn flush_reports(&self) -> Result<FlushOutcome, TransportError> {
        let _gate = self.report_gate.lock().await;
        self.flush_reports_locked().await
    }

    async fn flush_reports_locked(&self) -> Result<FlushOutcome, TransportError> {
        let backend = &self.backend;
        let mut outcome = FlushOutcome::default();
        while let Some(entry) = self.reports.oldest().await? {
            match self
                .retry
                .run("tamper_flush", || backend.report_tamper(&entry.item))
                .await
            {
                Ok(()) => {
                    self.reports.remove(entry.id).await?;
                    outcome.delivered += 1;
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(error = %e, queued = entry.id, "tamper flush paused");
                    return Ok(outcome);
                }
                Err(e) => {
                    tracing::warn!(error = %e, event_id = %entry.item.event_id, "queued tamper report rejected; dropping");
                    self.reports.remove(entry.id).await?;
                    outcome.dropped += 1;
                }
            }
        }
        outcome.drained = true;
        Ok(outcome)
    }
}
