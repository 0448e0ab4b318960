//! Outbound agent-decision client and turn-proof verification (§4.D).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::canonical;
use crate::crypto::{self, CryptoError, RecoverableSignature};
use crate::models::Agent;
use crate::policy::PolicySnapshot;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecisionError {
    #[error("no candidate endpoint accepted the decision request")]
    NoCandidateAccepted,
    #[error("agent response did not include a finite offer")]
    OfferMissing,
    #[error("turn_proof_missing")]
    ProofMissing,
    #[error("turn_proof_session_id_mismatch")]
    SessionIdMismatch,
    #[error("turn_proof_turn_mismatch")]
    TurnMismatch,
    #[error("turn_proof_agent_id_mismatch")]
    AgentIdMismatch,
    #[error("turn_proof_challenge_mismatch")]
    ChallengeMismatch,
    #[error("turn_proof_app_id_mismatch")]
    AppIdMismatch,
    #[error("turn_proof_environment_mismatch")]
    EnvironmentMismatch,
    #[error("turn_proof_image_digest_mismatch")]
    ImageDigestMismatch,
    #[error("turn_proof_timestamp_invalid")]
    TimestampInvalid,
    #[error("turn_proof_timestamp_out_of_window")]
    TimestampOutOfWindow,
    #[error("turn_proof_hash_mismatch")]
    HashMismatch,
    #[error("turn_proof_signer_recovery_failed")]
    SignerRecoveryFailed,
    #[error("turn_proof_signer_mismatch")]
    SignerMismatch,
    #[error("turn_proof_signer_not_allowed")]
    SignerNotAllowed,
}

impl From<CryptoError> for DecisionError {
    fn from(_: CryptoError) -> Self {
        DecisionError::SignerRecoveryFailed
    }
}

impl DecisionError {
    pub fn reason(&self) -> &'static str {
        match self {
            DecisionError::NoCandidateAccepted => "no_candidate_accepted",
            DecisionError::OfferMissing => "offer_missing",
            DecisionError::ProofMissing => "turn_proof_missing",
            DecisionError::SessionIdMismatch => "turn_proof_session_id_mismatch",
            DecisionError::TurnMismatch => "turn_proof_turn_mismatch",
            DecisionError::AgentIdMismatch => "turn_proof_agent_id_mismatch",
            DecisionError::ChallengeMismatch => "turn_proof_challenge_mismatch",
            DecisionError::AppIdMismatch => "turn_proof_app_id_mismatch",
            DecisionError::EnvironmentMismatch => "turn_proof_environment_mismatch",
            DecisionError::ImageDigestMismatch => "turn_proof_image_digest_mismatch",
            DecisionError::TimestampInvalid => "turn_proof_timestamp_invalid",
            DecisionError::TimestampOutOfWindow => "turn_proof_timestamp_out_of_window",
            DecisionError::HashMismatch => "turn_proof_hash_mismatch",
            DecisionError::SignerRecoveryFailed => "turn_proof_signer_recovery_failed",
            DecisionError::SignerMismatch => "turn_proof_signer_mismatch",
            DecisionError::SignerNotAllowed => "turn_proof_signer_not_allowed",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct DecisionRequest<'a> {
    protocol: &'static str,
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    topic: &'a str,
    turn: i64,
    #[serde(rename = "maxTurns")]
    max_turns: i64,
    role: &'a str,
    #[serde(rename = "agentId")]
    agent_id: &'a str,
    challenge: &'a str,
    #[serde(rename = "privateContext")]
    private_context: &'a Value,
    #[serde(rename = "publicState")]
    public_state: &'a Value,
    #[serde(rename = "expectedProofBinding")]
    expected_proof_binding: Value,
}

#[derive(Clone, Debug, Deserialize)]
struct DecisionResponse {
    offer: Option<f64>,
    #[serde(default)]
    proof: Option<Value>,
    #[serde(default)]
    evidence: Option<Value>,
}

pub struct Decision {
    pub offer: f64,
    pub proof_outcome: Result<(), DecisionError>,
    /// The server's own recomputed decision hash, present whenever a proof
    /// was returned and carried a parseable timestamp — this, not the
    /// proof's self-reported `decisionHash`, is what runtime attestation's
    /// `reportDataHash` check is compared against (§4.E).
    pub decision_hash: Option<String>,
    /// Opaque runtime (TEE) evidence, forwarded untouched to
    /// `crate::attestation_runtime::verify`.
    pub evidence: Option<Value>,
}

fn candidate_urls(agent: &Agent, env_override: &Option<String>) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(v) = agent
        .metadata
        .get("decisionEndpoint")
        .and_then(|v| v.as_str())
    {
        urls.push(v.to_string());
    }
    if let Some(v) = env_override {
        urls.push(v.clone());
    }
    let base = agent.endpoint.trim_end_matches('/');
    urls.push(format!("{base}/decide"));
    urls.push(format!("{base}/negotiate-turn"));
    urls.push(format!("{base}/negotiate"));
    urls
}

fn fresh_challenge() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Request a turn decision from `agent`, trying each candidate endpoint in
/// priority order, then verify the accompanying proof (if any).
pub async fn request_decision(
    client: &reqwest::Client,
    agent: &Agent,
    env_override: &Option<String>,
    timeout_ms: u64,
    session_id: &str,
    topic: &str,
    turn: i64,
    max_turns: i64,
    role: &str,
    private_context: &Value,
    public_state: &Value,
    policy: &PolicySnapshot,
) -> Result<Decision, DecisionError> {
    let challenge = fresh_challenge();
    let body = DecisionRequest {
        protocol: "molt-negotiation/turn-decision-v1",
        session_id,
        topic,
        turn,
        max_turns,
        role,
        agent_id: &agent.id,
        challenge: &challenge,
        private_context,
        public_state,
        expected_proof_binding: json!({ "sessionId": session_id, "turn": turn }),
    };

    let timeout = Duration::from_millis(timeout_ms.clamp(1, 60_000));
    let mut response = None;
    for url in candidate_urls(agent, env_override) {
        let mut req = client.post(&url).timeout(timeout).json(&body);
        if let Some(api_key) = &agent.api_key {
            req = req.bearer_auth(api_key);
        }
        let resp = match req.send().await {
            Ok(r) => r,
            Err(_) => continue,
        };
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            continue;
        }
        if !resp.status().is_success() {
            continue;
        }
        response = resp.json::<DecisionResponse>().await.ok();
        if response.is_some() {
            break;
        }
    }

    let response = response.ok_or(DecisionError::NoCandidateAccepted)?;
    let offer = response
        .offer
        .filter(|o| o.is_finite())
        .ok_or(DecisionError::OfferMissing)?;

    let decision_hash = response
        .proof
        .as_ref()
        .and_then(|p| compute_decision_hash(p, session_id, turn, &agent.id, role, round4(offer), &challenge, agent));

    let proof_outcome = verify_proof(
        response.proof.as_ref(),
        session_id,
        turn,
        &agent.id,
        role,
        round4(offer),
        &challenge,
        agent,
        policy,
    );

    Ok(Decision {
        offer,
        proof_outcome,
        decision_hash,
        evidence: response.evidence,
    })
}

/// Recompute the decision hash from a proof's own declared fields, without
/// enforcing any of the equality/signature checks `verify_proof` performs.
/// Returns `None` only when the proof carries no parseable timestamp.
fn compute_decision_hash(
    proof: &Value,
    session_id: &str,
    turn: i64,
    agent_id: &str,
    role: &str,
    offer4: f64,
    challenge: &str,
    agent: &Agent,
) -> Option<String> {
    let timestamp_ms = parse_timestamp(proof.get("timestamp"))?;
    let app_id_str = agent.app_id().unwrap_or_default();
    let environment_str = lower_opt(proof.get("environment")).unwrap_or_default();
    let image_digest_str = lower_opt(proof.get("imageDigest")).unwrap_or_default();
    let decision_hash_value = json!({
        "protocol": "MOLT_NEGOTIATION_TURN_PROOF",
        "version": "v1",
        "sessionId": session_id,
        "turn": turn,
        "agentId": agent_id,
        "role": role,
        "offer": offer4,
        "challenge": challenge.to_lowercase(),
        "appId": app_id_str,
        "environment": environment_str,
        "imageDigest": image_digest_str,
        "timestamp": timestamp_ms,
    });
    Some(canonical::hash_hex(&decision_hash_value))
}

fn lower_opt(v: Option<&Value>) -> Option<String> {
    v.and_then(|v| v.as_str()).map(|s| s.to_lowercase())
}

/// Verify a turn proof against the expected decision context (§4.D steps
/// 1-5). Returns `Ok(())` when the proof is present and fully valid.
#[allow(clippy::too_many_arguments)]
fn verify_proof(
    proof: Option<&Value>,
    session_id: &str,
    turn: i64,
    agent_id: &str,
    role: &str,
    offer4: f64,
    challenge: &str,
    agent: &Agent,
    policy: &PolicySnapshot,
) -> Result<(), DecisionError> {
    let proof = proof.ok_or(DecisionError::ProofMissing)?;

    let p_session = proof.get("sessionId").and_then(|v| v.as_str());
    if p_session != Some(session_id) {
        return Err(DecisionError::SessionIdMismatch);
    }
    let p_turn = proof.get("turn").and_then(|v| v.as_i64());
    if p_turn != Some(turn) {
        return Err(DecisionError::TurnMismatch);
    }
    let p_agent = proof.get("agentId").and_then(|v| v.as_str());
    if p_agent != Some(agent_id) {
        return Err(DecisionError::AgentIdMismatch);
    }
    let p_challenge = lower_opt(proof.get("challenge"));
    if p_challenge.as_deref() != Some(&challenge.to_lowercase()) {
        return Err(DecisionError::ChallengeMismatch);
    }

    let app_id = agent.app_id();
    let p_app_id = lower_opt(proof.get("appId"));
    if p_app_id != app_id && !(app_id.is_none() && p_app_id.is_none()) {
        return Err(DecisionError::AppIdMismatch);
    }

    let expected_environment = agent
        .eigencompute()
        .and_then(|e| e.get("environment"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase());
    let p_environment = lower_opt(proof.get("environment"));
    if expected_environment.is_some() && p_environment != expected_environment {
        return Err(DecisionError::EnvironmentMismatch);
    }

    let expected_image_digest = agent
        .eigencompute()
        .and_then(|e| e.get("imageDigest"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase());
    let p_image_digest = lower_opt(proof.get("imageDigest"));
    if expected_image_digest.is_some() && p_image_digest != expected_image_digest {
        return Err(DecisionError::ImageDigestMismatch);
    }

    let timestamp_ms = parse_timestamp(proof.get("timestamp")).ok_or(DecisionError::TimestampInvalid)?;
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    if (now_ms - timestamp_ms).unsigned_abs() > policy.turn_proof_max_skew_ms {
        return Err(DecisionError::TimestampOutOfWindow);
    }

    let app_id_str = app_id.clone().unwrap_or_default();
    let environment_str = p_environment.clone().unwrap_or_default();
    let image_digest_str = p_image_digest.clone().unwrap_or_default();

    let decision_hash_value = json!({
        "protocol": "MOLT_NEGOTIATION_TURN_PROOF",
        "version": "v1",
        "sessionId": session_id,
        "turn": turn,
        "agentId": agent_id,
        "role": role,
        "offer": offer4,
        "challenge": challenge.to_lowercase(),
        "appId": app_id_str,
        "environment": environment_str,
        "imageDigest": image_digest_str,
        "timestamp": timestamp_ms,
    });
    let decision_hash = canonical::hash_hex(&decision_hash_value);

    let message = format!(
        "MOLT_NEGOTIATION_TURN_PROOF|v1|{session_id}|{turn}|{agent_id}|{role}|{offer4}|{challenge}|{decision_hash}|{app_id_str}|{environment_str}|{image_digest_str}|{timestamp_ms}"
    );

    let signature_hex = proof
        .get("signature")
        .and_then(|v| v.as_str())
        .ok_or(DecisionError::SignerRecoveryFailed)?;
    let signature_bytes =
        hex::decode(signature_hex.trim_start_matches("0x")).map_err(|_| DecisionError::SignerRecoveryFailed)?;
    let signature =
        RecoverableSignature::from_bytes(&signature_bytes).map_err(|_| DecisionError::SignerRecoveryFailed)?;
    let recovered = crypto::recover_eth_message_signer(message.as_bytes(), signature)?;

    if let Some(declared) = proof.get("signer").and_then(|v| v.as_str()) {
        if declared.to_lowercase() != recovered {
            return Err(DecisionError::SignerMismatch);
        }
    }
    if let Some(expected_signer) = agent.signer_address() {
        if expected_signer != recovered {
            return Err(DecisionError::SignerNotAllowed);
        }
    }

    // decisionHash re-derivation above is itself the hash-mismatch check:
    // if the proof's own recorded hash disagrees, fail explicitly here.
    if let Some(proof_hash) = proof.get("decisionHash").and_then(|v| v.as_str()) {
        if proof_hash != decision_hash {
            return Err(DecisionError::HashMismatch);
        }
    }

    Ok(())
}

fn parse_timestamp(v: Option<&Value>) -> Option<i64> {
    match v {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => {
            if let Ok(ms) = s.parse::<i64>() {
                return Some(ms);
            }
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn test_agent() -> Agent {
        Agent {
            id: "agent-a".to_string(),
            name: "Agent A".to_string(),
            endpoint: "https://agent-a.example.com".to_string(),
            api_key: None,
            payout_address: None,
            enabled: true,
            metadata: json!({}),
            last_health_status: crate::models::HealthStatus::Unknown,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn candidate_urls_are_in_priority_order() {
        let agent = test_agent();
        let urls = candidate_urls(&agent, &None);
        assert_eq!(
            urls,
            vec![
                "https://agent-a.example.com/decide",
                "https://agent-a.example.com/negotiate-turn",
                "https://agent-a.example.com/negotiate",
            ]
        );
    }

    #[test]
    fn metadata_override_takes_priority() {
        let mut agent = test_agent();
        agent.metadata = json!({ "decisionEndpoint": "https://override.example.com/go" });
        let urls = candidate_urls(&agent, &Some("https://env.example.com/go".to_string()));
        assert_eq!(urls[0], "https://override.example.com/go");
        assert_eq!(urls[1], "https://env.example.com/go");
    }

    #[test]
    fn missing_proof_is_reported_as_proof_missing() {
        let agent = test_agent();
        let policy = PolicySnapshot::from_env();
        let result = verify_proof(None, "s1", 1, "agent-a", "buyer", 100.0, "chal", &agent, &policy);
        assert_eq!(result.unwrap_err(), DecisionError::ProofMissing);
    }

    #[test]
    fn session_id_mismatch_is_detected() {
        let agent = test_agent();
        let policy = PolicySnapshot::from_env();
        let proof = json!({ "sessionId": "other", "turn": 1, "agentId": "agent-a", "challenge": "chal" });
        let result = verify_proof(Some(&proof), "s1", 1, "agent-a", "buyer", 100.0, "chal", &agent, &policy);
        assert_eq!(result.unwrap_err(), DecisionError::SessionIdMismatch);
    }
}
