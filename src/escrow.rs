//! Escrow state machine (§4.I): prepare, deposit, settle, and the
//! automation tick that drives `settle` periodically.

use serde_json::Value;
use thiserror::Error;

use crate::models::{now, Escrow, EscrowStatus, Session, SessionStatus};

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("session terms do not carry an escrow configuration")]
    NoEscrowConfig,
    #[error("invalid_state_transition: {0}")]
    InvalidTransition(String),
    #[error("actor is not the matching player for this deposit")]
    NotMatchingPlayer,
}

/// Build a new escrow row from a session's `terms.escrow` configuration,
/// deriving player ids from the session's participants when absent.
pub fn prepare(session: &Session, existing: Option<Escrow>) -> Result<Escrow, EscrowError> {
    if let Some(existing) = existing {
        return Ok(existing);
    }

    let config = session
        .terms
        .get("escrow")
        .ok_or(EscrowError::NoEscrowConfig)?;
    let contract_address = config
        .get("contractAddress")
        .and_then(|v| v.as_str())
        .ok_or(EscrowError::NoEscrowConfig)?
        .to_string();
    let amount_per_player = config
        .get("amountPerPlayer")
        .and_then(|v| v.as_str().map(String::from).or_else(|| v.as_f64().map(|f| f.to_string())))
        .ok_or(EscrowError::NoEscrowConfig)?;
    let token_address = config
        .get("tokenAddress")
        .and_then(|v| v.as_str())
        .map(String::from);

    let player_a = config
        .get("playerAAgentId")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| session.proposer_agent_id.clone());
    let player_b = config
        .get("playerBAgentId")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| session.counterparty_agent_id.clone().unwrap_or_default());

    let ts = now();
    Ok(Escrow {
        session_id: session.id.clone(),
        contract_address,
        token_address,
        stake_amount: amount_per_player,
        status: EscrowStatus::Prepared,
        tx_hash: None,
        player_a_agent_id: player_a,
        player_b_agent_id: player_b,
        player_a_deposited: false,
        player_b_deposited: false,
        settlement_attempts: 0,
        last_settlement_error: None,
        last_settlement_at: None,
        created_at: ts,
        updated_at: ts,
    })
}

/// Decimal-integer string comparison: `amount >= stake_amount`. Both are
/// arbitrary-precision decimal strings; compared via `f64` parse, which
/// is sufficient for the stake magnitudes this protocol deals in.
fn amount_covers_stake(amount: &str, stake: &str) -> bool {
    match (amount.parse::<f64>(), stake.parse::<f64>()) {
        (Ok(a), Ok(s)) => a >= s,
        _ => false,
    }
}

/// Record a deposit claim from `actor` for `amount`. Only the matching
/// player's actor may deposit on their own side.
pub fn deposit(mut escrow: Escrow, actor: &str, amount: &str) -> Result<Escrow, EscrowError> {
    let covers = amount_covers_stake(amount, &escrow.stake_amount);

    if actor == escrow.player_a_agent_id {
        if covers {
            escrow.player_a_deposited = true;
        }
    } else if actor == escrow.player_b_agent_id {
        if covers {
            escrow.player_b_deposited = true;
        }
    } else {
        return Err(EscrowError::NotMatchingPlayer);
    }

    escrow.status = match (escrow.player_a_deposited, escrow.player_b_deposited) {
        (true, true) => EscrowStatus::Funded,
        (true, false) | (false, true) => EscrowStatus::FundingPending,
        (false, false) => EscrowStatus::Prepared,
    };
    escrow.updated_at = now();
    Ok(escrow)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Pending,
    Settled,
    Refunded,
    AlreadyFinalized,
    SessionNotFinal,
}

/// Drive the escrow toward settlement/refund based on the session's
/// current (terminal or non-terminal) status. Idempotent.
pub fn settle(mut escrow: Escrow, session_status: SessionStatus) -> (Escrow, SettleOutcome) {
    if escrow.status.is_final() {
        return (escrow, SettleOutcome::AlreadyFinalized);
    }

    let outcome = match session_status {
        SessionStatus::Agreed => {
            if escrow.status == EscrowStatus::Funded {
                escrow.status = EscrowStatus::Settled;
                if escrow.tx_hash.is_none() {
                    escrow.tx_hash = Some(format!("stub-settle-{}", now()));
                }
                escrow.last_settlement_error = None;
                SettleOutcome::Settled
            } else {
                escrow.status = EscrowStatus::SettlementPending;
                escrow.settlement_attempts += 1;
                escrow.last_settlement_error = Some("funding_pending".to_string());
                SettleOutcome::Pending
            }
        }
        SessionStatus::NoAgreement | SessionStatus::Failed => {
            escrow.status = EscrowStatus::Refunded;
            if escrow.tx_hash.is_none() {
                escrow.tx_hash = Some(format!("stub-refund-{}", now()));
            }
            SettleOutcome::Refunded
        }
        _ => SettleOutcome::SessionNotFinal,
    };

    if outcome != SettleOutcome::SessionNotFinal {
        escrow.last_settlement_at = Some(now());
    }
    escrow.updated_at = now();
    (escrow, outcome)
}

/// Escrow rows eligible for an automation tick.
pub fn is_tick_eligible(status: EscrowStatus) -> bool {
    matches!(
        status,
        EscrowStatus::Prepared
            | EscrowStatus::FundingPending
            | EscrowStatus::Funded
            | EscrowStatus::SettlementPending
            | EscrowStatus::RefundPending
    )
}

pub fn escrow_config(session_terms: &Value) -> bool {
    session_terms.get("escrow").is_some()
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn session_with_escrow() -> Session {
        Session {
            id: "s1".to_string(),
            topic: "t".to_string(),
            status: SessionStatus::Created,
            proposer_agent_id: "agent-a".to_string(),
            counterparty_agent_id: Some("agent-b".to_string()),
            terms: json!({ "escrow": { "contractAddress": "0xabc", "amountPerPlayer": "100" } }),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn prepare_derives_players_from_session() {
        let escrow = prepare(&session_with_escrow(), None).unwrap();
        assert_eq!(escrow.player_a_agent_id, "agent-a");
        assert_eq!(escrow.player_b_agent_id, "agent-b");
        assert_eq!(escrow.status, EscrowStatus::Prepared);
    }

    #[test]
    fn prepare_is_idempotent() {
        let escrow = prepare(&session_with_escrow(), None).unwrap();
        let again = prepare(&session_with_escrow(), Some(escrow.clone())).unwrap();
        assert_eq!(escrow.created_at, again.created_at);
    }

    #[test]
    fn deposit_transitions_through_funding_states() {
        let escrow = prepare(&session_with_escrow(), None).unwrap();
        let escrow = deposit(escrow, "agent-a", "100").unwrap();
        assert_eq!(escrow.status, EscrowStatus::FundingPending);
        let escrow = deposit(escrow, "agent-b", "100").unwrap();
        assert_eq!(escrow.status, EscrowStatus::Funded);
    }

    #[test]
    fn deposit_below_stake_does_not_transition() {
        let escrow = prepare(&session_with_escrow(), None).unwrap();
        let escrow = deposit(escrow, "agent-a", "1").unwrap();
        assert_eq!(escrow.status, EscrowStatus::Prepared);
    }

    #[test]
    fn settle_agreed_and_funded_settles() {
        let escrow = prepare(&session_with_escrow(), None).unwrap();
        let escrow = deposit(escrow, "agent-a", "100").unwrap();
        let escrow = deposit(escrow, "agent-b", "100").unwrap();
        let (escrow, outcome) = settle(escrow, SessionStatus::Agreed);
        assert_eq!(outcome, SettleOutcome::Settled);
        assert_eq!(escrow.status, EscrowStatus::Settled);
        assert!(escrow.tx_hash.is_some());
    }

    #[test]
    fn settle_agreed_and_not_funded_is_pending() {
        let escrow = prepare(&session_with_escrow(), None).unwrap();
        let (escrow, outcome) = settle(escrow, SessionStatus::Agreed);
        assert_eq!(outcome, SettleOutcome::Pending);
        assert_eq!(escrow.status, EscrowStatus::SettlementPending);
        assert_eq!(escrow.settlement_attempts, 1);
    }

    #[test]
    fn settle_no_agreement_refunds() {
        let escrow = prepare(&session_with_escrow(), None).unwrap();
        let (escrow, outcome) = settle(escrow, SessionStatus::NoAgreement);
        assert_eq!(outcome, SettleOutcome::Refunded);
        assert_eq!(escrow.status, EscrowStatus::Refunded);
    }

    #[test]
    fn settle_already_finalized_is_noop() {
        let escrow = prepare(&session_with_escrow(), None).unwrap();
        let (escrow, _) = settle(escrow, SessionStatus::NoAgreement);
        let (escrow2, outcome) = settle(escrow.clone(), SessionStatus::NoAgreement);
        assert_eq!(outcome, SettleOutcome::AlreadyFinalized);
        assert_eq!(escrow.tx_hash, escrow2.tx_hash);
    }

    #[test]
    fn settle_non_final_session_is_noop() {
        let escrow = prepare(&session_with_escrow(), None).unwrap();
        let (_, outcome) = settle(escrow, SessionStatus::Active);
        assert_eq!(outcome, SettleOutcome::SessionNotFinal);
    }
}
