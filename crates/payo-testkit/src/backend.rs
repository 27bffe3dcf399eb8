//! Scripted in-process backend.
//!
//! Heartbeat replies are popped from a script; an empty script answers with
//! a bare `success: true`. While `down` is set every call fails with a
//! network error and nothing is recorded.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use payo_schemas::{DeactivationConfirm, HeartbeatRequest, HeartbeatResponse, TamperReport};
use payo_transport::{BackendClient, TransportError};

#[derive(Debug, Default)]
struct BackendState {
    down: bool,
    script: VecDeque<Result<HeartbeatResponse, TransportError>>,
    confirm_failures: u32,
    heartbeats: Vec<HeartbeatRequest>,
    reports: Vec<TamperReport>,
    confirms: Vec<(String, DeactivationConfirm)>,
    confirm_attempts: u32,
}

#[derive(Debug, Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

pub fn ok_response() -> HeartbeatResponse {
    HeartbeatResponse {
        success: true,
        ..HeartbeatResponse::default()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    /// Queue the reply for the next delivered heartbeat.
    pub fn push_response(&self, resp: HeartbeatResponse) {
        self.lock().script.push_back(Ok(resp));
    }

    pub fn push_error(&self, err: TransportError) {
        self.lock().script.push_back(Err(err));
    }

    /// The next `n` deactivation confirmations fail with a 503.
    pub fn fail_confirms(&self, n: u32) {
        self.lock().confirm_failures = n;
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatRequest> {
        self.lock().heartbeats.clone()
    }

    pub fn reports(&self) -> Vec<TamperReport> {
        self.lock().reports.clone()
    }

    pub fn confirms(&self) -> Vec<(String, DeactivationConfirm)> {
        self.lock().confirms.clone()
    }

    pub fn confirm_attempts(&self) -> u32 {
        self.lock().confirm_attempts
    }
}

fn offline() -> TransportError {
    TransportError::Network("fake backend down".to_string())
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn send_heartbeat(
        &self,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError> {
        let mut g = self.lock();
        if g.down {
            return Err(offline());
        }
        let reply = g.script.pop_front().unwrap_or_else(|| Ok(ok_response()));
        if reply.is_ok() {
            g.heartbeats.push(req.clone());
        }
        reply
    }

    async fn report_tamper(&self, report: &TamperReport) -> Result<(), TransportError> {
        let mut g = self.lock();
        if g.down {
            return Err(offline());
        }
        g.reports.push(report.clone());
        Ok(())
    }

    async fn confirm_deactivation(
        &self,
        device_id: &str,
        confirm: &DeactivationConfirm,
    ) -> Result<(), TransportError> {
        let mut g = self.lock();
        g.confirm_attempts += 1;
        if g.down {
            return Err(offline());
        }
        if g.confirm_failures > 0 {
            g.confirm_failures -= 1;
            return Err(TransportError::Server {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        g.confirms.push((device_id.to_string(), confirm.clone()));
        Ok(())
    }
}
