//! Session outcome attestation: sign and verify (§4.H).

use serde_json::{json, Value};
use thiserror::Error;

use crate::canonical;
use crate::config::Env;
use crate::crypto::{self, CryptoError, RecoverableSignature, Signer};
use crate::models::{Attestation, AttestationPayload, Session, SessionStatus, SessionTurn};
use crate::policy::PolicySnapshot;

#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("missing_attestation_signer_key")]
    MissingSignerKey,
    #[error("malformed attestation signer key")]
    BadSignerKey,
    #[error("payload_hash_mismatch")]
    PayloadHashMismatch,
    #[error("outcome_hash_mismatch")]
    OutcomeHashMismatch,
    #[error("signer_recovery_failed")]
    SignerRecoveryFailed,
    #[error("signer_mismatch")]
    SignerMismatch,
    #[error("strict_verified_false")]
    StrictVerifiedFalse,
    #[error("execution_mode_not_strict")]
    ExecutionModeNotStrict,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

const DEV_SIGNER_SEED: &str = "molt-negotiation-server:development-signer-key";

fn resolve_signer(raw: &Option<String>, env: Env) -> Result<Signer, AttestationError> {
    match raw {
        Some(s) => {
            let hex_part = s.trim_start_matches("0x");
            let bytes = hex::decode(hex_part).map_err(|_| AttestationError::BadSignerKey)?;
            Signer::from_bytes(&bytes).map_err(|_| AttestationError::BadSignerKey)
        }
        None if env.is_production() => Err(AttestationError::MissingSignerKey),
        None => {
            let digest = crypto::keccak256(DEV_SIGNER_SEED.as_bytes());
            Signer::from_bytes(&digest).map_err(|_| AttestationError::BadSignerKey)
        }
    }
}

fn outcome_hash(session: &Session, turns: &[SessionTurn]) -> String {
    let turns_value: Vec<Value> = turns
        .iter()
        .map(|t| json!({ "turn": t.turn, "status": t.status.as_str(), "summary": t.summary }))
        .collect();
    let value = json!({
        "sessionId": session.id,
        "status": session.status.as_str(),
        "terms": session.terms,
        "turns": turns_value,
    });
    canonical::hash_hex(&value)
}

/// Resolve the configured signer's address without producing a signature,
/// for recomputing `verify`'s `configured_signer` check. `None` if the key
/// is absent or malformed rather than propagating the signing error.
pub fn configured_signer_address(signer_key: &Option<String>, env: Env) -> Option<String> {
    resolve_signer(signer_key, env).ok().map(|s| s.address)
}

pub fn strict_verified(
    session: &Session,
    strict_policy_ok: bool,
    both_sealed: bool,
) -> bool {
    strict_policy_ok
        && both_sealed
        && matches!(
            session.status,
            SessionStatus::Agreed | SessionStatus::NoAgreement | SessionStatus::Failed
        )
}

#[allow(clippy::too_many_arguments)]
pub fn sign(
    signer_key: &Option<String>,
    env: Env,
    session: &Session,
    turns: &[SessionTurn],
    policy: &PolicySnapshot,
    strict_verified_flag: bool,
    strict_reasons: Vec<String>,
    execution_mode: &str,
) -> Result<Attestation, AttestationError> {
    let signer = resolve_signer(signer_key, env)?;

    let payload = AttestationPayload {
        version: "v1".to_string(),
        session_id: session.id.clone(),
        status: session.status.as_str().to_string(),
        turns: turns.len() as i64,
        outcome_hash: outcome_hash(session, turns),
        policy_hash: canonical::hash_hex(policy),
        execution_mode: execution_mode.to_string(),
        strict_verified: strict_verified_flag,
        strict_reasons,
        participants: session.participants().into_iter().map(String::from).collect(),
        generated_at: crate::models::now(),
    };

    let payload_hash = canonical::hash_hex(&payload);
    let signature = signer.sign_eth_message(payload_hash.as_bytes());

    Ok(Attestation {
        session_id: session.id.clone(),
        signer_address: signer.address,
        payload_hash,
        signature: format!("0x{}", hex::encode(signature.to_bytes())),
        payload,
        created_at: crate::models::now(),
    })
}

/// Recompute and check every invariant of a stored attestation, returning
/// one failing-reason string per broken check (empty on full success).
pub fn verify(
    attestation: &Attestation,
    session: &Session,
    turns: &[SessionTurn],
    configured_signer: Option<&str>,
) -> Vec<String> {
    let mut reasons = Vec::new();

    let recomputed_payload_hash = canonical::hash_hex(&attestation.payload);
    if !crypto::constant_time_eq(
        recomputed_payload_hash.as_bytes(),
        attestation.payload_hash.as_bytes(),
    ) {
        reasons.push("payload_hash_mismatch".to_string());
    }

    let recovered = hex::decode(attestation.signature.trim_start_matches("0x"))
        .ok()
        .and_then(|b| RecoverableSignature::from_bytes(&b).ok())
        .and_then(|sig| {
            crypto::recover_eth_message_signer(attestation.payload_hash.as_bytes(), sig).ok()
        });

    match &recovered {
        Some(addr) if crypto::constant_time_eq(addr.as_bytes(), attestation.signer_address.as_bytes()) => {}
        Some(_) => reasons.push("signer_mismatch".to_string()),
        None => reasons.push("signer_recovery_failed".to_string()),
    }

    if let Some(configured) = configured_signer {
        if !crypto::constant_time_eq(configured.as_bytes(), attestation.signer_address.as_bytes()) {
            reasons.push("signer_mismatch".to_string());
        }
    }

    let recomputed_outcome_hash = outcome_hash(session, turns);
    if !crypto::constant_time_eq(
        recomputed_outcome_hash.as_bytes(),
        attestation.payload.outcome_hash.as_bytes(),
    ) {
        reasons.push("outcome_hash_mismatch".to_string());
    }

    if !attestation.payload.strict_verified {
        reasons.push("strict_verified_false".to_string());
    }
    if attestation.payload.execution_mode != "strict" {
        reasons.push("execution_mode_not_strict".to_string());
    }

    reasons.sort();
    reasons.dedup();
    reasons
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn session() -> Session {
        Session {
            id: "s1".to_string(),
            topic: "widget sale".to_string(),
            status: SessionStatus::Agreed,
            proposer_agent_id: "agent-a".to_string(),
            counterparty_agent_id: Some("agent-b".to_string()),
            terms: json!({}),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn sign_produces_recoverable_signature() {
        let s = session();
        let policy = PolicySnapshot::from_env();
        let key = Some("c".repeat(64));
        let att = sign(&key, Env::Development, &s, &[], &policy, true, vec![], "strict").unwrap();
        let reasons = verify(&att, &s, &[], Some(&att.signer_address));
        assert!(reasons.is_empty(), "unexpected reasons: {reasons:?}");
    }

    #[test]
    fn tampered_payload_hash_is_detected() {
        let s = session();
        let policy = PolicySnapshot::from_env();
        let key = Some("c".repeat(64));
        let mut att = sign(&key, Env::Development, &s, &[], &policy, true, vec![], "strict").unwrap();
        att.payload_hash = "0".repeat(64);
        let reasons = verify(&att, &s, &[], Some(&att.signer_address));
        assert!(reasons.contains(&"payload_hash_mismatch".to_string()));
    }

    #[test]
    fn non_strict_execution_mode_is_flagged() {
        let s = session();
        let policy = PolicySnapshot::from_env();
        let key = Some("c".repeat(64));
        let att = sign(&key, Env::Development, &s, &[], &policy, true, vec![], "fallback").unwrap();
        let reasons = verify(&att, &s, &[], Some(&att.signer_address));
        assert!(reasons.contains(&"execution_mode_not_strict".to_string()));
    }
}
