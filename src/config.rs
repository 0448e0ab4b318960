//! Process-level configuration, read once at startup from the environment.
//!
//! The strict-mode policy snapshot (§4.C of SPEC_FULL.md) is deliberately
//! *not* part of this struct: it must be re-read from the environment on
//! every call (see `crate::policy`), since the test suite mutates
//! individual flags between cases. Everything here is read exactly once,
//! at process start.

use std::env;

use anyhow::{anyhow, Result};

/// Deployment environment. Gates the production-only requirements in
/// §4.B, §4.C and §4.H of SPEC_FULL.md.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Env {
    Production,
    Development,
}

impl Env {
    pub fn is_production(self) -> bool {
        matches!(self, Env::Production)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub env: Env,
    pub listen_address: String,
    pub database_path: String,
    /// Raw sealing master key material, accepted in the forms described in
    /// §4.B (hex, `hex:`-prefixed, `base64:`-prefixed, raw base64).
    pub sealing_master_key: Option<String>,
    /// Raw attestation signer private key, 64 hex characters with an
    /// optional `0x` prefix.
    pub attestation_signer_key: Option<String>,
    pub admin_api_keys: Vec<String>,
    pub operator_api_keys: Vec<String>,
    pub readonly_api_keys: Vec<String>,
    /// Configured app ids eligible for the `requireEigenAppBinding` rule
    /// (§4.C / §4.G), lower-cased for comparison.
    pub eigen_app_binding_set: Vec<String>,
    pub allow_public_read: bool,
    pub automation_escrow_enabled: bool,
    pub escrow_automation_interval_ms: u64,
    pub decision_request_timeout_ms: u64,
    pub runtime_verifier_timeout_ms: u64,
    pub health_probe_timeout_ms: u64,
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => !v.eq_ignore_ascii_case("false") && v != "0",
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let env = match env::var("NEG_ENV").as_deref() {
            Ok("production") => Env::Production,
            _ => Env::Development,
        };

        let listen_address =
            env::var("NEG_LISTEN_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let database_path =
            env::var("NEG_DATABASE_PATH").unwrap_or_else(|_| "sqlite::memory:".to_string());

        let sealing_master_key = env::var("NEG_SEALING_MASTER_KEY").ok();
        let attestation_signer_key = env::var("NEG_ATTESTATION_SIGNER_KEY").ok();

        if env.is_production() && sealing_master_key.is_none() {
            return Err(anyhow!("missing_sealing_key"));
        }

        Ok(Config {
            env,
            listen_address,
            database_path,
            sealing_master_key,
            attestation_signer_key,
            admin_api_keys: env_list("NEG_ADMIN_API_KEYS"),
            operator_api_keys: env_list("NEG_OPERATOR_API_KEYS"),
            readonly_api_keys: env_list("NEG_READONLY_API_KEYS"),
            eigen_app_binding_set: env_list("NEG_EIGEN_APP_BINDING_SET")
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            allow_public_read: env_bool("NEG_ALLOW_PUBLIC_READ", true),
            automation_escrow_enabled: env_bool("NEG_AUTOMATION_ESCROW_ENABLED", true),
            escrow_automation_interval_ms: env_u64("NEG_ESCROW_AUTOMATION_INTERVAL_MS", 15_000),
            decision_request_timeout_ms: env_u64("NEG_DECISION_TIMEOUT_MS", 8_000)
                .clamp(1, 60_000),
            runtime_verifier_timeout_ms: env_u64("NEG_RUNTIME_VERIFIER_TIMEOUT_MS", 10_000),
            health_probe_timeout_ms: env_u64("NEG_HEALTH_PROBE_TIMEOUT_MS", 5_000),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn env_list_splits_and_trims() {
        std::env::set_var("NEG_TEST_LIST", "a, b ,,c");
        assert_eq!(env_list("NEG_TEST_LIST"), vec!["a", "b", "c"]);
        std::env::remove_var("NEG_TEST_LIST");
    }

    #[test]
    fn env_bool_defaults_when_absent() {
        std::env::remove_var("NEG_TEST_BOOL");
        assert!(env_bool("NEG_TEST_BOOL", true));
        assert!(!env_bool("NEG_TEST_BOOL", false));
    }
}
