//! Runtime (TEE) attestation verification (§4.E).
//!
//! Distinct from session-level outcome attestation in `crate::attestation`
//! — this verifies an agent's per-turn execution evidence, either locally
//! against the decision proof's claims or by delegating to a configured
//! remote verifier.

use serde_json::{json, Value};
use thiserror::Error;

use crate::policy::PolicySnapshot;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeAttestationError {
    #[error("runtime_attestation_missing")]
    Missing,
    #[error("runtime_attestation_report_data_mismatch")]
    ReportDataMismatch,
    #[error("runtime_attestation_app_id_mismatch")]
    AppIdMismatch,
    #[error("runtime_attestation_environment_mismatch")]
    EnvironmentMismatch,
    #[error("runtime_attestation_image_digest_mismatch")]
    ImageDigestMismatch,
    #[error("runtime_attestation_signer_mismatch")]
    SignerMismatch,
    #[error("runtime_attestation_issued_at_out_of_window")]
    IssuedAtOutOfWindow,
    #[error("runtime_attestation_expired")]
    Expired,
    #[error("runtime_attestation_remote_rejected")]
    RemoteRejected,
    #[error("runtime_attestation_remote_unreachable")]
    RemoteUnreachable,
}

impl RuntimeAttestationError {
    pub fn reason(&self) -> &'static str {
        match self {
            RuntimeAttestationError::Missing => "runtime_attestation_missing",
            RuntimeAttestationError::ReportDataMismatch => "runtime_attestation_report_data_mismatch",
            RuntimeAttestationError::AppIdMismatch => "runtime_attestation_app_id_mismatch",
            RuntimeAttestationError::EnvironmentMismatch => "runtime_attestation_environment_mismatch",
            RuntimeAttestationError::ImageDigestMismatch => "runtime_attestation_image_digest_mismatch",
            RuntimeAttestationError::SignerMismatch => "runtime_attestation_signer_mismatch",
            RuntimeAttestationError::IssuedAtOutOfWindow => "runtime_attestation_issued_at_out_of_window",
            RuntimeAttestationError::Expired => "runtime_attestation_expired",
            RuntimeAttestationError::RemoteRejected => "runtime_attestation_remote_rejected",
            RuntimeAttestationError::RemoteUnreachable => "runtime_attestation_remote_unreachable",
        }
    }
}

pub struct Expected {
    pub decision_hash: String,
    pub app_id: Option<String>,
    pub environment: Option<String>,
    pub image_digest: Option<String>,
    pub signer_address: Option<String>,
}

fn lower_str(v: Option<&Value>) -> Option<String> {
    v.and_then(|v| v.as_str()).map(|s| s.to_lowercase())
}

fn local_claim_check(
    claims: &Value,
    expected: &Expected,
    policy: &PolicySnapshot,
) -> Result<(), RuntimeAttestationError> {
    let report_data = lower_str(claims.get("reportDataHash"));
    if report_data.as_deref() != Some(expected.decision_hash.to_lowercase().as_str()) {
        return Err(RuntimeAttestationError::ReportDataMismatch);
    }

    if let Some(expected_app) = &expected.app_id {
        if lower_str(claims.get("appId")).as_ref() != Some(expected_app) {
            return Err(RuntimeAttestationError::AppIdMismatch);
        }
    }
    if let Some(expected_env) = &expected.environment {
        if lower_str(claims.get("environment")).as_ref() != Some(expected_env) {
            return Err(RuntimeAttestationError::EnvironmentMismatch);
        }
    }
    if let Some(expected_digest) = &expected.image_digest {
        if lower_str(claims.get("imageDigest")).as_ref() != Some(expected_digest) {
            return Err(RuntimeAttestationError::ImageDigestMismatch);
        }
    }
    if let Some(expected_signer) = &expected.signer_address {
        if lower_str(claims.get("signerAddress")).as_ref() != Some(expected_signer) {
            return Err(RuntimeAttestationError::SignerMismatch);
        }
    }

    let now = crate::models::now();
    if let Some(issued_at) = claims.get("issuedAt").and_then(|v| v.as_i64()) {
        if (now - issued_at).unsigned_abs() > policy.runtime_attestation_max_age_ms {
            return Err(RuntimeAttestationError::IssuedAtOutOfWindow);
        }
    } else {
        return Err(RuntimeAttestationError::IssuedAtOutOfWindow);
    }
    if let Some(expires_at) = claims.get("expiresAt").and_then(|v| v.as_i64()) {
        if expires_at <= now {
            return Err(RuntimeAttestationError::Expired);
        }
    }

    Ok(())
}

/// Verify `evidence` (an opaque struct carrying an optional `claims` map)
/// against `expected`. A no-op success when runtime attestation is not
/// required by policy.
pub async fn verify(
    client: &reqwest::Client,
    verifier_timeout_ms: u64,
    evidence: Option<&Value>,
    expected: &Expected,
    policy: &PolicySnapshot,
) -> Result<(), RuntimeAttestationError> {
    if !policy.require_runtime_attestation {
        return Ok(());
    }
    let evidence = evidence.ok_or(RuntimeAttestationError::Missing)?;
    let claims = evidence
        .get("claims")
        .cloned()
        .unwrap_or(evidence.clone());

    if !policy.runtime_attestation_remote_verify {
        return local_claim_check(&claims, expected, policy);
    }

    let url = policy
        .runtime_attestation_verifier_url
        .as_ref()
        .ok_or(RuntimeAttestationError::RemoteUnreachable)?;

    let body = json!({
        "evidence": evidence,
        "expected": {
            "decisionHash": expected.decision_hash,
            "appId": expected.app_id,
            "environment": expected.environment,
            "imageDigest": expected.image_digest,
            "signerAddress": expected.signer_address,
        }
    });

    let timeout = std::time::Duration::from_millis(verifier_timeout_ms.clamp(1, 60_000));
    let response = client
        .post(url)
        .timeout(timeout)
        .json(&body)
        .send()
        .await
        .map_err(|_| RuntimeAttestationError::RemoteUnreachable)?;

    let parsed: Value = response
        .json()
        .await
        .map_err(|_| RuntimeAttestationError::RemoteUnreachable)?;

    if parsed.get("valid").and_then(|v| v.as_bool()) != Some(true) {
        return Err(RuntimeAttestationError::RemoteRejected);
    }

    let adopted_claims = parsed.get("claims").cloned().unwrap_or(claims);
    local_claim_check(&adopted_claims, expected, policy)
}

#[cfg(test)]
mod test {
    use super::*;

    fn policy_requiring_runtime() -> PolicySnapshot {
        std::env::set_var("NEG_REQUIRE_RUNTIME_ATTESTATION", "true");
        let p = PolicySnapshot::from_env();
        std::env::remove_var("NEG_REQUIRE_RUNTIME_ATTESTATION");
        p
    }

    #[tokio::test]
    async fn disabled_policy_is_noop_success() {
        let client = reqwest::Client::new();
        let policy = PolicySnapshot::from_env();
        let expected = Expected {
            decision_hash: "abc".to_string(),
            app_id: None,
            environment: None,
            image_digest: None,
            signer_address: None,
        };
        let result = verify(&client, 10_000, None, &expected, &policy).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_evidence_when_required_fails() {
        let client = reqwest::Client::new();
        let policy = policy_requiring_runtime();
        let expected = Expected {
            decision_hash: "abc".to_string(),
            app_id: None,
            environment: None,
            image_digest: None,
            signer_address: None,
        };
        let result = verify(&client, 10_000, None, &expected, &policy).await;
        assert_eq!(result.unwrap_err(), RuntimeAttestationError::Missing);
    }

    #[test]
    fn report_data_hash_mismatch_is_detected() {
        let policy = policy_requiring_runtime();
        let expected = Expected {
            decision_hash: "abc".to_string(),
            app_id: None,
            environment: None,
            image_digest: None,
            signer_address: None,
        };
        let claims = json!({ "reportDataHash": "def", "issuedAt": crate::models::now() });
        let result = local_claim_check(&claims, &expected, &policy);
        assert_eq!(result.unwrap_err(), RuntimeAttestationError::ReportDataMismatch);
    }
}
