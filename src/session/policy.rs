//! Strict-session policy evaluation (§4.G): the per-pair rule set gating
//! `start` and `negotiate`, distinct from the environment-wide
//! `crate::policy::PolicySnapshot` it reads flags from.

use url::Url;

use crate::models::Agent;
use crate::policy::PolicySnapshot;

fn endpoint_is_valid(agent: &Agent, require_https_non_loopback: bool) -> Option<&'static str> {
    let parsed = match Url::parse(&agent.endpoint) {
        Ok(u) => u,
        Err(_) => return Some("endpoint_not_http"),
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Some("endpoint_not_http");
    }
    if require_https_non_loopback && parsed.scheme() == "http" {
        let is_loopback = matches!(parsed.host_str(), Some("localhost") | Some("127.0.0.1") | Some("::1"));
        if !is_loopback {
            return Some("endpoint_https_required");
        }
    }
    None
}

fn sandbox_matches(a: &Agent, b: &Agent) -> bool {
    match (a.sandbox(), b.sandbox()) {
        (Some(sa), Some(sb)) => {
            for field in ["runtime", "version", "cpu", "memory"] {
                if sa.get(field) != sb.get(field) {
                    return false;
                }
            }
            true
        }
        _ => false,
    }
}

/// Evaluate the strict-session rule set for a proposer/counterparty pair,
/// returning one reason string per failing rule (empty on full pass).
pub fn evaluate(
    proposer: Option<&Agent>,
    counterparty: Option<&Agent>,
    policy: &PolicySnapshot,
    app_binding_set: &[String],
) -> Vec<String> {
    let mut reasons = Vec::new();

    let (a, b) = match (proposer, counterparty) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            reasons.push("both_participants_required".to_string());
            return reasons;
        }
    };

    let require_https = policy.require_endpoint_negotiation;
    if let Some(reason) = endpoint_is_valid(a, require_https) {
        reasons.push(format!("proposer_{reason}"));
    }
    if let Some(reason) = endpoint_is_valid(b, require_https) {
        reasons.push(format!("counterparty_{reason}"));
    }

    if policy.require_sandbox_parity && !sandbox_matches(a, b) {
        reasons.push("sandbox_parity_mismatch".to_string());
    }

    if policy.require_eigen_compute {
        for (label, agent) in [("proposer", a), ("counterparty", b)] {
            let eigen = agent.eigencompute();
            let has_app_id = eigen.and_then(|e| e.get("appId")).and_then(|v| v.as_str()).is_some();
            let has_signer = agent.signer_address().is_some();
            if !has_app_id {
                reasons.push(format!("{label}_eigencompute_app_id_required"));
            }
            if !has_signer {
                reasons.push(format!("{label}_eigencompute_signer_required"));
            }
        }
        if policy.require_eigen_compute_environment {
            let env_a = a.eigencompute().and_then(|e| e.get("environment"));
            let env_b = b.eigencompute().and_then(|e| e.get("environment"));
            if env_a.is_none() || env_a != env_b {
                reasons.push("eigencompute_environment_mismatch".to_string());
            }
        }
        if policy.require_eigen_compute_image_digest {
            let d_a = a.eigencompute().and_then(|e| e.get("imageDigest"));
            let d_b = b.eigencompute().and_then(|e| e.get("imageDigest"));
            if d_a.is_none() || d_a != d_b {
                reasons.push("eigencompute_image_digest_mismatch".to_string());
            }
        }
    }

    if policy.require_independent_agents {
        if a.id == b.id {
            reasons.push("agents_must_be_distinct".to_string());
        }
        if host(&a.endpoint) == host(&b.endpoint) {
            reasons.push("endpoint_hosts_must_be_distinct".to_string());
        }
        if a.payout_address.is_some() && a.payout_address == b.payout_address {
            reasons.push("payout_addresses_must_be_distinct".to_string());
        }
        if a.app_id().is_some() && a.app_id() == b.app_id() {
            reasons.push("app_ids_must_be_distinct".to_string());
        }
        if a.signer_address().is_some() && a.signer_address() == b.signer_address() {
            reasons.push("signer_addresses_must_be_distinct".to_string());
        }
    }

    if policy.require_eigen_app_binding && !app_binding_set.is_empty() {
        for (label, agent) in [("proposer", a), ("counterparty", b)] {
            match agent.app_id() {
                Some(app_id) if app_binding_set.iter().any(|b| b.to_lowercase() == app_id) => {}
                _ => reasons.push(format!("{label}_app_id_not_bound")),
            }
        }
    }

    reasons
}

fn host(endpoint: &str) -> Option<String> {
    Url::parse(endpoint).ok().and_then(|u| u.host_str().map(String::from))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn agent(id: &str, endpoint: &str) -> Agent {
        Agent {
            id: id.to_string(),
            name: id.to_string(),
            endpoint: endpoint.to_string(),
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
    fn missing_counterparty_fails_fast() {
        let policy = PolicySnapshot::from_env();
        let reasons = evaluate(Some(&agent("a", "https://a.example.com")), None, &policy, &[]);
        assert_eq!(reasons, vec!["both_participants_required".to_string()]);
    }

    #[test]
    fn valid_https_pair_has_no_endpoint_reasons() {
        let policy = PolicySnapshot::from_env();
        let a = agent("a", "https://a.example.com");
        let b = agent("b", "https://b.example.com");
        let reasons = evaluate(Some(&a), Some(&b), &policy, &[]);
        assert!(!reasons.iter().any(|r| r.contains("endpoint")));
    }

    #[test]
    fn independence_rule_flags_shared_id() {
        std::env::set_var("NEG_REQUIRE_INDEPENDENT_AGENTS", "true");
        let policy = PolicySnapshot::from_env();
        std::env::remove_var("NEG_REQUIRE_INDEPENDENT_AGENTS");
        let a = agent("same", "https://a.example.com");
        let b = agent("same", "https://b.example.com");
        let reasons = evaluate(Some(&a), Some(&b), &policy, &[]);
        assert!(reasons.contains(&"agents_must_be_distinct".to_string()));
    }
}
