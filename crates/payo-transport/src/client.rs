use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use payo_schemas::{DeactivationConfirm, HeartbeatRequest, HeartbeatResponse, TamperReport};

use crate::error::TransportError;
use crate::signing::sign_body;

pub const HEADER_API_KEY: &str = "X-Device-Api-Key";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_SIGNATURE: &str = "X-Signature";

/// The three backend calls the agent makes. One attempt per call; retry and
/// queueing are layered on top.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn send_heartbeat(
        &self,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError>;

    async fn report_tamper(&self, report: &TamperReport) -> Result<(), TransportError>;

    async fn confirm_deactivation(
        &self,
        device_id: &str,
        confirm: &DeactivationConfirm,
    ) -> Result<(), TransportError>;
}

pub fn heartbeat_path(device_id: &str) -> String {
    format!("/devices/{device_id}/data/")
}

pub fn confirm_deactivation_path(device_id: &str) -> String {
    format!("/devices/{device_id}/confirm-deactivation/")
}

pub fn tamper_report_path(device_id: &str) -> String {
    format!("/tamper/mobile/{device_id}/report/")
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    signing_secret: Option<String>,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("signed", &self.signing_secret.is_some())
            .finish()
    }
}

impl HttpBackend {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        api_key: impl Into<String>,
        signing_secret: Option<String>,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("client build failed: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            signing_secret,
        })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(u16, String), TransportError> {
        let bytes =
            serde_json::to_vec(body).map_err(|e| TransportError::Decode(format!("encode: {e}")))?;
        let ts = chrono::Utc::now().timestamp_millis().to_string();

        let mut rb = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(HEADER_API_KEY, &self.api_key)
            .header(HEADER_TIMESTAMP, &ts);
        if let Some(secret) = &self.signing_secret {
            rb = rb.header(HEADER_SIGNATURE, sign_body(secret, &ts, &bytes));
        }

        let resp = rb
            .body(bytes)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Network(format!("read body: {e}")))?;

        if status.is_server_error() {
            return Err(TransportError::Server {
                status: status.as_u16(),
                body: text,
            });
        }
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message: text,
            });
        }
        Ok((status.as_u16(), text))
    }
}

#[async_trait]
impl BackendClient for HttpBackend {
    async fn send_heartbeat(
        &self,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError> {
        let (status, text) = self.post(&heartbeat_path(&req.device_id), req).await?;
        let resp: HeartbeatResponse =
            serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))?;
        if !resp.success {
            return Err(TransportError::Rejected {
                status,
                message: resp
                    .message
                    .unwrap_or_else(|| "success=false".to_string()),
            });
        }
        Ok(resp)
    }

    async fn report_tamper(&self, report: &TamperReport) -> Result<(), TransportError> {
        self.post(&tamper_report_path(&report.device_id), report)
            .await
            .map(|_| ())
    }

    async fn confirm_deactivation(
        &self,
        device_id: &str,
        confirm: &DeactivationConfirm,
    ) -> Result<(), TransportError> {
        self.post(&confirm_deactivation_path(device_id), confirm)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_match_backend_routes() {
        assert_eq!(heartbeat_path("d1"), "/devices/d1/data/");
        assert_eq!(
            confirm_deactivation_path("d1"),
            "/devices/d1/confirm-deactivation/"
        );
        assert_eq!(tamper_report_path("d1"), "/tamper/mobile/d1/report/");
    }

    #[test]
    fn debug_redacts_api_key() {
        let b = HttpBackend::new("http://x/", Duration::from_secs(1), "dak_live", None).unwrap();
        let s = format!("{b:?}");
        assert!(!s.contains("dak_live"));
        assert!(s.contains("http://x\""));
    }
}
