//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only **env var NAMES** (e.g. `"PAYO_DEVICE_API_KEY"`).
//! - At startup the daemon calls [`resolve_secrets`] once and passes the
//!   result into the transport constructor.
//! - `Debug` redacts every value.
//! - Error messages name the env var, never its value.

use anyhow::{bail, Result};
use serde_json::Value;

const DEFAULT_API_KEY_VAR: &str = "PAYO_DEVICE_API_KEY";
const DEFAULT_SIGNING_SECRET_VAR: &str = "PAYO_SIGNING_SECRET";

/// Credentials for the loan backend.
#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Sent as `X-Device-Api-Key`. Required.
    pub api_key: String,
    /// HMAC key for `X-Signature`. Unsigned requests when absent.
    pub signing_secret: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("api_key", &"<REDACTED>")
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Env var names configured under `/backend/keys_env`, with defaults.
pub fn secret_env_names(config_json: &Value) -> (String, String) {
    (
        read_str_at(config_json, "/backend/keys_env/api_key")
            .unwrap_or_else(|| DEFAULT_API_KEY_VAR.to_string()),
        read_str_at(config_json, "/backend/keys_env/signing_secret")
            .unwrap_or_else(|| DEFAULT_SIGNING_SECRET_VAR.to_string()),
    )
}

/// Resolve backend credentials from the environment.
///
/// # Errors
/// `SECRETS_MISSING` naming the api key variable when it is unset or blank.
pub fn resolve_secrets(config_json: &Value) -> Result<ResolvedSecrets> {
    let (api_key_var, signing_var) = secret_env_names(config_json);

    let Some(api_key) = resolve_env(&api_key_var) else {
        bail!(
            "SECRETS_MISSING: required env var '{}' (device api key) is not set or empty",
            api_key_var
        );
    };

    Ok(ResolvedSecrets {
        api_key,
        signing_secret: resolve_env(&signing_var),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn debug_never_prints_values() {
        let s = ResolvedSecrets {
            api_key: "dak_live_123456".to_string(),
            signing_secret: Some("topsecret".to_string()),
        };
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("dak_live_123456"));
        assert!(!dbg.contains("topsecret"));
        assert!(dbg.contains("<REDACTED>"));
    }

    #[test]
    fn env_names_fall_back_to_defaults() {
        let (a, s) = secret_env_names(&json!({}));
        assert_eq!(a, DEFAULT_API_KEY_VAR);
        assert_eq!(s, DEFAULT_SIGNING_SECRET_VAR);
    }
}
