//! Strict-mode policy snapshot (§4.C) and startup launch-readiness (§4.C).
//!
//! `PolicySnapshot::from_env` is called fresh on every request that needs
//! it (strict-session checks, attestation generation, the `/policy/strict`
//! endpoint) — it must never be cached across requests, since the test
//! suite mutates individual environment variables between cases.

use std::env;

use serde::Serialize;

use crate::config::Config;

fn flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => !v.eq_ignore_ascii_case("false") && v != "0",
        Err(_) => default,
    }
}

fn clamped_ms(name: &str, default: u64, min: u64, max: u64) -> u64 {
    let raw = env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default);
    raw.clamp(min, max)
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub require_endpoint_mode: bool,
    pub require_endpoint_negotiation: bool,
    pub require_turn_proof: bool,
    pub turn_proof_max_skew_ms: u64,
    pub require_runtime_attestation: bool,
    pub runtime_attestation_remote_verify: bool,
    pub runtime_attestation_max_age_ms: u64,
    pub runtime_attestation_verifier_url: Option<String>,
    pub allow_engine_fallback: bool,
    pub require_eigen_compute: bool,
    pub require_sandbox_parity: bool,
    pub require_eigen_compute_environment: bool,
    pub require_eigen_compute_image_digest: bool,
    pub require_eigen_compute_signer: bool,
    pub require_independent_agents: bool,
    pub require_eigen_app_binding: bool,
    pub allow_simple_mode: bool,
    pub require_attestation: bool,
    pub require_privacy_redaction: bool,
    pub allow_insecure_dev_keys: bool,
}

impl PolicySnapshot {
    pub fn from_env() -> Self {
        let runtime_attestation_verifier_url = env::var("NEG_RUNTIME_ATTESTATION_VERIFIER_URL")
            .ok()
            .or_else(|| env::var("NEG_VERIFIER_URL").ok());

        Self {
            require_endpoint_mode: flag("NEG_REQUIRE_ENDPOINT_MODE", false),
            require_endpoint_negotiation: flag("NEG_REQUIRE_ENDPOINT_NEGOTIATION", false),
            require_turn_proof: flag("NEG_REQUIRE_TURN_PROOF", false),
            turn_proof_max_skew_ms: clamped_ms(
                "NEG_TURN_PROOF_MAX_SKEW_MS",
                5 * 60_000,
                1_000,
                3_600_000,
            ),
            require_runtime_attestation: flag("NEG_REQUIRE_RUNTIME_ATTESTATION", false),
            runtime_attestation_remote_verify: flag(
                "NEG_RUNTIME_ATTESTATION_REMOTE_VERIFY",
                false,
            ),
            runtime_attestation_max_age_ms: clamped_ms(
                "NEG_RUNTIME_ATTESTATION_MAX_AGE_MS",
                10 * 60_000,
                5_000,
                24 * 3_600_000,
            ),
            runtime_attestation_verifier_url,
            allow_engine_fallback: flag("NEG_ALLOW_ENGINE_FALLBACK", true),
            require_eigen_compute: flag("NEG_REQUIRE_EIGEN_COMPUTE", false),
            require_sandbox_parity: flag("NEG_REQUIRE_SANDBOX_PARITY", false),
            require_eigen_compute_environment: flag(
                "NEG_REQUIRE_EIGEN_COMPUTE_ENVIRONMENT",
                false,
            ),
            require_eigen_compute_image_digest: flag(
                "NEG_REQUIRE_EIGEN_COMPUTE_IMAGE_DIGEST",
                false,
            ),
            require_eigen_compute_signer: flag("NEG_REQUIRE_EIGEN_COMPUTE_SIGNER", false),
            require_independent_agents: flag("NEG_REQUIRE_INDEPENDENT_AGENTS", false),
            require_eigen_app_binding: flag("NEG_REQUIRE_EIGEN_APP_BINDING", false),
            allow_simple_mode: flag("NEG_ALLOW_SIMPLE_MODE", true),
            require_attestation: flag("NEG_REQUIRE_ATTESTATION", false),
            require_privacy_redaction: flag("NEG_REQUIRE_PRIVACY_REDACTION", true),
            allow_insecure_dev_keys: flag("NEG_ALLOW_INSECURE_DEV_KEYS", true),
        }
    }

    /// Whether strict mode (the conjunction of attestation + proof +
    /// eigencompute requirements) is meaningfully "on" for this snapshot.
    pub fn is_strict(&self) -> bool {
        self.require_turn_proof
            && self.require_runtime_attestation
            && self.require_eigen_compute
            && self.require_attestation
    }
}

/// Evaluate startup launch-readiness: in production, the policy snapshot
/// plus the presence of sealing and signer keys must satisfy fixed
/// expectations, or startup fails with a comma-separated reason list.
pub fn check_launch_readiness(config: &Config, policy: &PolicySnapshot) -> Result<(), String> {
    if !config.env.is_production() {
        return Ok(());
    }

    let mut reasons = Vec::new();

    if config.sealing_master_key.is_none() {
        reasons.push("missing_sealing_key".to_string());
    }
    if config.attestation_signer_key.is_none() && !policy.allow_insecure_dev_keys {
        reasons.push("missing_attestation_signer_key".to_string());
    }
    if !policy.require_privacy_redaction {
        reasons.push("privacy_redaction_disabled".to_string());
    }
    if policy.require_runtime_attestation
        && policy.runtime_attestation_remote_verify
        && policy.runtime_attestation_verifier_url.is_none()
    {
        reasons.push("missing_runtime_attestation_verifier_url".to_string());
    }
    if policy.allow_insecure_dev_keys {
        reasons.push("insecure_dev_keys_allowed".to_string());
    }

    if reasons.is_empty() {
        Ok(())
    } else {
        Err(reasons.join(","))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn clear_all() {
        for key in [
            "NEG_REQUIRE_ENDPOINT_MODE",
            "NEG_REQUIRE_ENDPOINT_NEGOTIATION",
            "NEG_REQUIRE_TURN_PROOF",
            "NEG_TURN_PROOF_MAX_SKEW_MS",
            "NEG_REQUIRE_RUNTIME_ATTESTATION",
            "NEG_RUNTIME_ATTESTATION_REMOTE_VERIFY",
            "NEG_RUNTIME_ATTESTATION_MAX_AGE_MS",
            "NEG_RUNTIME_ATTESTATION_VERIFIER_URL",
            "NEG_ALLOW_ENGINE_FALLBACK",
            "NEG_REQUIRE_PRIVACY_REDACTION",
            "NEG_ALLOW_INSECURE_DEV_KEYS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_are_permissive() {
        clear_all();
        let snap = PolicySnapshot::from_env();
        assert!(!snap.require_turn_proof);
        assert!(snap.allow_engine_fallback);
        assert!(snap.require_privacy_redaction);
        clear_all();
    }

    #[test]
    fn skew_clamps_into_range() {
        clear_all();
        std::env::set_var("NEG_TURN_PROOF_MAX_SKEW_MS", "1");
        assert_eq!(PolicySnapshot::from_env().turn_proof_max_skew_ms, 1_000);
        std::env::set_var("NEG_TURN_PROOF_MAX_SKEW_MS", "99999999");
        assert_eq!(PolicySnapshot::from_env().turn_proof_max_skew_ms, 3_600_000);
        clear_all();
    }

    #[test]
    fn is_not_cached_across_reads() {
        clear_all();
        assert!(!PolicySnapshot::from_env().require_turn_proof);
        std::env::set_var("NEG_REQUIRE_TURN_PROOF", "true");
        assert!(PolicySnapshot::from_env().require_turn_proof);
        clear_all();
    }
}
