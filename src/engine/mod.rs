//! Negotiation engine (§4.F): endpoint-driven turn loop, Nash-weighted
//! optimizer, and the deterministic fallback used when endpoint
//! negotiation is unavailable.

pub mod fallback;
pub mod optimizer;

use serde_json::{json, Value};
use thiserror::Error;

use crate::attestation_runtime::{self, Expected as RuntimeExpected};
use crate::decision_client::{self, Decision};
use crate::models::{now, Agent, SessionTurn, TurnStatus};
use crate::policy::PolicySnapshot;
use crate::privacy;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("private_context_required")]
    PrivateContextRequired,
    #[error("negotiation_not_active")]
    NotActive,
    #[error("roles_must_include_buyer_and_seller")]
    RolesMustIncludeBuyerAndSeller,
    #[error("strict_policy_failed: {0:?}")]
    StrictPolicyFailed(Vec<String>),
}

pub struct EngineResult {
    pub turns: Vec<SessionTurn>,
    pub final_status: crate::models::SessionStatus,
    pub execution_mode: String,
    pub fallback_reason: Option<String>,
    pub proof_summary: Value,
}

struct ParsedContext {
    role: String,
    reservation: f64,
    initial_price: Option<f64>,
    step: f64,
    leverage: f64,
    urgency: f64,
}

fn parse_context(ctx: &Value) -> ParsedContext {
    ParsedContext {
        role: ctx.get("role").and_then(|v| v.as_str()).unwrap_or("").to_lowercase(),
        reservation: ctx.get("reservation").and_then(|v| v.as_f64()).unwrap_or(0.0),
        initial_price: ctx.get("initialPrice").and_then(|v| v.as_f64()),
        step: ctx
            .get("step")
            .and_then(|v| v.as_f64())
            .filter(|s| *s > 0.0)
            .unwrap_or(1.0),
        leverage: ctx.get("income").and_then(|v| v.as_f64()).unwrap_or(0.5).clamp(0.0, 1.0),
        urgency: ctx.get("urgency").and_then(|v| v.as_f64()).unwrap_or(0.5).clamp(0.0, 1.0),
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[allow(clippy::too_many_arguments)]
pub async fn negotiate(
    session_id: &str,
    topic: &str,
    proposer_agent: &Agent,
    counterparty_agent: &Agent,
    proposer_ctx: &Value,
    counterparty_ctx: &Value,
    policy: &PolicySnapshot,
    client: &reqwest::Client,
    decision_timeout_ms: u64,
    runtime_verifier_timeout_ms: u64,
    max_turns_hint: i64,
) -> Result<EngineResult, EngineError> {
    let proposer = parse_context(proposer_ctx);
    let counterparty = parse_context(counterparty_ctx);

    let (buyer_ctx, seller_ctx, buyer_agent, seller_agent) =
        match (proposer.role.as_str(), counterparty.role.as_str()) {
            ("buyer", "seller") => (proposer, counterparty, proposer_agent, counterparty_agent),
            ("seller", "buyer") => (counterparty, proposer, counterparty_agent, proposer_agent),
            _ => return Err(EngineError::RolesMustIncludeBuyerAndSeller),
        };

    let max_turns = max_turns_hint.clamp(1, 50);
    let mut buyer_offer = match buyer_ctx.initial_price {
        Some(p) => buyer_ctx.reservation.min(p),
        None => buyer_ctx.reservation - buyer_ctx.step * 2.0,
    };
    let mut seller_ask = match seller_ctx.initial_price {
        Some(p) => seller_ctx.reservation.max(p),
        None => seller_ctx.reservation + seller_ctx.step * 2.0,
    };

    let mut turns = Vec::new();
    let mut proof_failures: Vec<String> = Vec::new();
    let mut endpoint_failed = false;

    if policy.require_endpoint_negotiation {
        'turn_loop: for turn in 1..=max_turns {
            let buyer_public_state = json!({ "turn": turn, "sellerAsk": round4(seller_ask) });
            let buyer_decision = decision_client::request_decision(
                client,
                buyer_agent,
                &None,
                decision_timeout_ms,
                session_id,
                topic,
                turn,
                max_turns,
                "buyer",
                &buyer_ctx_value(&buyer_ctx),
                &buyer_public_state,
                policy,
            )
            .await;

            let buyer_decision = match buyer_decision {
                Ok(d) => d,
                Err(_) => {
                    endpoint_failed = true;
                    break 'turn_loop;
                }
            };
            if let Err(e) = &buyer_decision.proof_outcome {
                proof_failures.push(e.reason().to_string());
                if policy.require_turn_proof {
                    endpoint_failed = true;
                    break 'turn_loop;
                }
            }
            if let Err(reason) = verify_runtime_attestation(
                client,
                runtime_verifier_timeout_ms,
                &buyer_decision,
                buyer_agent,
                policy,
            )
            .await
            {
                proof_failures.push(reason);
                if policy.require_runtime_attestation {
                    endpoint_failed = true;
                    break 'turn_loop;
                }
            }
            let next_buyer = round4(buyer_decision.offer);
            if !next_buyer.is_finite() || next_buyer > buyer_ctx.reservation {
                endpoint_failed = true;
                break 'turn_loop;
            }
            if turn > 1 && next_buyer < buyer_offer {
                endpoint_failed = true;
                break 'turn_loop;
            }
            buyer_offer = next_buyer;

            let seller_public_state = json!({ "turn": turn, "buyerOffer": round4(buyer_offer) });
            let seller_decision = decision_client::request_decision(
                client,
                seller_agent,
                &None,
                decision_timeout_ms,
                session_id,
                topic,
                turn,
                max_turns,
                "seller",
                &seller_ctx_value(&seller_ctx),
                &seller_public_state,
                policy,
            )
            .await;

            let seller_decision = match seller_decision {
                Ok(d) => d,
                Err(_) => {
                    endpoint_failed = true;
                    break 'turn_loop;
                }
            };
            if let Err(e) = &seller_decision.proof_outcome {
                proof_failures.push(e.reason().to_string());
                if policy.require_turn_proof {
                    endpoint_failed = true;
                    break 'turn_loop;
                }
            }
            if let Err(reason) = verify_runtime_attestation(
                client,
                runtime_verifier_timeout_ms,
                &seller_decision,
                seller_agent,
                policy,
            )
            .await
            {
                proof_failures.push(reason);
                if policy.require_runtime_attestation {
                    endpoint_failed = true;
                    break 'turn_loop;
                }
            }
            let next_seller = round4(seller_decision.offer);
            if !next_seller.is_finite() || next_seller < seller_ctx.reservation {
                endpoint_failed = true;
                break 'turn_loop;
            }
            if turn > 1 && next_seller > seller_ask {
                endpoint_failed = true;
                break 'turn_loop;
            }
            seller_ask = next_seller;

            if buyer_offer >= seller_ask {
                let price = optimizer::agreed_price(
                    buyer_offer,
                    seller_ask,
                    buyer_ctx.reservation,
                    seller_ctx.reservation,
                    optimizer::BargainingProfile { leverage: buyer_ctx.leverage, urgency: buyer_ctx.urgency },
                    optimizer::BargainingProfile { leverage: seller_ctx.leverage, urgency: seller_ctx.urgency },
                );
                turns.push(turn_row(session_id, turn, TurnStatus::Agreed, buyer_offer, seller_ask, price, &proof_failures));
                return Ok(finish(
                    turns,
                    crate::models::SessionStatus::Agreed,
                    "strict",
                    None,
                    proof_failures,
                ));
            }

            if turn == max_turns {
                turns.push(turn_row(session_id, turn, TurnStatus::NoAgreement, buyer_offer, seller_ask, None, &proof_failures));
                return Ok(finish(
                    turns,
                    crate::models::SessionStatus::NoAgreement,
                    "strict",
                    None,
                    proof_failures,
                ));
            }

            turns.push(turn_row(session_id, turn, TurnStatus::Continue, buyer_offer, seller_ask, None, &proof_failures));
        }
    }

    if !policy.require_endpoint_negotiation || endpoint_failed {
        if endpoint_failed && !policy.allow_engine_fallback {
            // No turn row is recorded for this abort: the highest-numbered
            // turn must stay in {continue, agreed, no_agreement} even when
            // the session itself ends failed.
            return Ok(finish(
                turns,
                crate::models::SessionStatus::Failed,
                "endpoint",
                Some("endpoint_failed_fallback_disabled".to_string()),
                proof_failures,
            ));
        }

        turns.clear();
        let buyer_side = fallback::Side {
            reservation: buyer_ctx.reservation,
            initial_price: buyer_ctx.initial_price,
            step: buyer_ctx.step,
            profile: optimizer::BargainingProfile { leverage: buyer_ctx.leverage, urgency: buyer_ctx.urgency },
        };
        let seller_side = fallback::Side {
            reservation: seller_ctx.reservation,
            initial_price: seller_ctx.initial_price,
            step: seller_ctx.step,
            profile: optimizer::BargainingProfile { leverage: seller_ctx.leverage, urgency: seller_ctx.urgency },
        };
        let fallback_turns = fallback::run(buyer_side, seller_side, max_turns);
        let final_status = match fallback_turns.last().and_then(|t| t.outcome) {
            Some(fallback::Outcome::Agreed) => crate::models::SessionStatus::Agreed,
            Some(fallback::Outcome::NoAgreement) => crate::models::SessionStatus::NoAgreement,
            None => crate::models::SessionStatus::NoAgreement,
        };
        for t in &fallback_turns {
            let status = if t.outcome == Some(fallback::Outcome::Agreed) {
                TurnStatus::Agreed
            } else if t.outcome == Some(fallback::Outcome::NoAgreement) {
                TurnStatus::NoAgreement
            } else {
                TurnStatus::Continue
            };
            turns.push(turn_row(session_id, t.turn, status, t.buyer_offer, t.seller_ask, t.agreed_price, &[]));
        }
        let reason = if endpoint_failed {
            Some("endpoint_failed".to_string())
        } else {
            Some("endpoint_negotiation_disabled".to_string())
        };
        return Ok(finish(turns, final_status, "fallback", reason, proof_failures));
    }

    // Endpoint loop exited the for-loop without an explicit return only
    // when max_turns == 0, which `clamp(1, 50)` makes unreachable.
    Ok(finish(turns, crate::models::SessionStatus::NoAgreement, "strict", None, proof_failures))
}

/// Check a decision's runtime (TEE) evidence against the deciding agent's
/// declared eigencompute identity. A no-op success when the decision
/// carried no proof at all (the proof check above already owns that
/// failure mode) or when `require_runtime_attestation` is off.
async fn verify_runtime_attestation(
    client: &reqwest::Client,
    verifier_timeout_ms: u64,
    decision: &Decision,
    agent: &Agent,
    policy: &PolicySnapshot,
) -> Result<(), String> {
    let Some(decision_hash) = decision.decision_hash.clone() else {
        return Ok(());
    };
    let expected = RuntimeExpected {
        decision_hash,
        app_id: agent.app_id(),
        environment: agent
            .eigencompute()
            .and_then(|e| e.get("environment"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase()),
        image_digest: agent
            .eigencompute()
            .and_then(|e| e.get("imageDigest"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase()),
        signer_address: agent.signer_address(),
    };
    attestation_runtime::verify(client, verifier_timeout_ms, decision.evidence.as_ref(), &expected, policy)
        .await
        .map_err(|e| e.reason().to_string())
}

fn buyer_ctx_value(ctx: &ParsedContext) -> Value {
    json!({ "role": "buyer", "reservation": ctx.reservation })
}

fn seller_ctx_value(ctx: &ParsedContext) -> Value {
    json!({ "role": "seller", "reservation": ctx.reservation })
}

fn turn_row(
    session_id: &str,
    turn: i64,
    status: TurnStatus,
    buyer_offer: f64,
    seller_ask: f64,
    agreed_price: Option<f64>,
    proof_failures: &[String],
) -> SessionTurn {
    let buyer_offer_band = privacy::band_price(buyer_offer);
    let seller_ask_band = privacy::band_price(seller_ask);
    let spread_band = privacy::band_spread(buyer_offer, seller_ask);
    let summary = json!({
        "buyerOfferBand": buyer_offer_band,
        "sellerAskBand": seller_ask_band,
        "spread": spread_band,
        "agreedPrice": agreed_price,
        "proofFailures": proof_failures,
    });
    SessionTurn {
        session_id: session_id.to_string(),
        turn,
        status,
        summary,
        created_at: now(),
    }
}

fn finish(
    turns: Vec<SessionTurn>,
    final_status: crate::models::SessionStatus,
    execution_mode: &str,
    fallback_reason: Option<String>,
    proof_failures: Vec<String>,
) -> EngineResult {
    EngineResult {
        turns,
        final_status,
        execution_mode: execution_mode.to_string(),
        fallback_reason,
        proof_summary: json!({ "proofFailures": proof_failures }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_context_reads_role_lowercase() {
        let ctx = json!({ "role": "BUYER", "reservation": 100.0 });
        let parsed = parse_context(&ctx);
        assert_eq!(parsed.role, "buyer");
    }

    #[test]
    fn parse_context_defaults_step_when_non_positive() {
        let ctx = json!({ "role": "buyer", "reservation": 100.0, "step": -1.0 });
        let parsed = parse_context(&ctx);
        assert_eq!(parsed.step, 1.0);
    }
}
