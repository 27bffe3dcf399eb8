//! Command handler modules for payo-cli.
//!
//! Shared utilities used by multiple command paths live here.
//! Command-specific logic lives in the submodules.

pub mod device;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use payo_audit::VerifyResult;

const DEFAULT_DB_PATH: &str = "payo-agent.sqlite";

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Open the agent database named by `PAYO_DB_PATH`, or the default file.
pub async fn connect_from_env() -> Result<SqlitePool> {
    let path =
        std::env::var(payo_db::ENV_DB_PATH).unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    payo_db::connect(&path).await
}

/// Verify the tamper log chain and print the outcome. A broken chain is an
/// error so the exit code reflects it.
pub fn verify_tamper_log(path: &str) -> Result<()> {
    match payo_audit::verify_hash_chain(path)
        .with_context(|| format!("verify tamper log {path}"))?
    {
        VerifyResult::Valid { lines } => {
            println!("valid=true lines={}", lines);
            Ok(())
        }
        VerifyResult::Broken { line, reason } => {
            println!("valid=false line={} reason={}", line, reason);
            anyhow::bail!("TAMPER_LOG_BROKEN: chain broken at line {line}")
        }
    }
}

/// Unix millis as RFC 3339; empty for zero or out-of-range values.
pub fn ms_to_rfc3339(ms: i64) -> String {
    if ms <= 0 {
        return String::new();
    }
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|d| d.to_rfc3339())
        .unwrap_or_default()
}
