//! Shared persisted data model (§3 of SPEC_FULL.md).
//!
//! These are the in-memory shapes returned to handlers; the store
//! (`crate::store`) owns the authoritative rows and hands back copies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

pub fn now() -> i64 {
    now_ms()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_address: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub last_health_status: HealthStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Agent {
    pub fn sandbox(&self) -> Option<&Value> {
        self.metadata.get("sandbox")
    }

    pub fn eigencompute(&self) -> Option<&Value> {
        self.metadata.get("eigencompute")
    }

    pub fn signer_address(&self) -> Option<String> {
        self.eigencompute()
            .and_then(|e| e.get("signerAddress"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase())
    }

    pub fn app_id(&self) -> Option<String> {
        self.eigencompute()
            .and_then(|e| e.get("appId"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_lowercase())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Accepted,
    Prepared,
    Active,
    Agreed,
    NoAgreement,
    Failed,
    Settled,
    Refunded,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Agreed
                | SessionStatus::NoAgreement
                | SessionStatus::Failed
                | SessionStatus::Settled
                | SessionStatus::Refunded
                | SessionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Accepted => "accepted",
            SessionStatus::Prepared => "prepared",
            SessionStatus::Active => "active",
            SessionStatus::Agreed => "agreed",
            SessionStatus::NoAgreement => "no_agreement",
            SessionStatus::Failed => "failed",
            SessionStatus::Settled => "settled",
            SessionStatus::Refunded => "refunded",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => SessionStatus::Created,
            "accepted" => SessionStatus::Accepted,
            "prepared" => SessionStatus::Prepared,
            "active" => SessionStatus::Active,
            "agreed" => SessionStatus::Agreed,
            "no_agreement" => SessionStatus::NoAgreement,
            "failed" => SessionStatus::Failed,
            "settled" => SessionStatus::Settled,
            "refunded" => SessionStatus::Refunded,
            "cancelled" => SessionStatus::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub topic: String,
    pub status: SessionStatus,
    pub proposer_agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_agent_id: Option<String>,
    #[serde(default)]
    pub terms: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn participants(&self) -> Vec<&str> {
        let mut out = vec![self.proposer_agent_id.as_str()];
        if let Some(c) = &self.counterparty_agent_id {
            out.push(c.as_str());
        }
        out
    }

    pub fn is_participant(&self, agent_id: &str) -> bool {
        self.proposer_agent_id == agent_id
            || self.counterparty_agent_id.as_deref() == Some(agent_id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedInput {
    pub session_id: String,
    pub agent_id: String,
    pub key_id: String,
    pub iv: String,
    pub auth_tag: String,
    pub cipher_text: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Continue,
    Agreed,
    NoAgreement,
    Failed,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::Continue => "continue",
            TurnStatus::Agreed => "agreed",
            TurnStatus::NoAgreement => "no_agreement",
            TurnStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionTurn {
    pub session_id: String,
    pub turn: i64,
    pub status: TurnStatus,
    pub summary: Value,
    pub created_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttestationPayload {
    pub version: String,
    pub session_id: String,
    pub status: String,
    pub turns: i64,
    pub outcome_hash: String,
    pub policy_hash: String,
    pub execution_mode: String,
    pub strict_verified: bool,
    pub strict_reasons: Vec<String>,
    pub participants: Vec<String>,
    pub generated_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attestation {
    pub session_id: String,
    pub signer_address: String,
    pub payload_hash: String,
    pub signature: String,
    pub payload: AttestationPayload,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Prepared,
    FundingPending,
    Funded,
    SettlementPending,
    RefundPending,
    Settled,
    Refunded,
    Failed,
}

impl EscrowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EscrowStatus::Prepared => "prepared",
            EscrowStatus::FundingPending => "funding_pending",
            EscrowStatus::Funded => "funded",
            EscrowStatus::SettlementPending => "settlement_pending",
            EscrowStatus::RefundPending => "refund_pending",
            EscrowStatus::Settled => "settled",
            EscrowStatus::Refunded => "refunded",
            EscrowStatus::Failed => "failed",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, EscrowStatus::Settled | EscrowStatus::Refunded)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Escrow {
    pub session_id: String,
    pub contract_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_address: Option<String>,
    pub stake_amount: String,
    pub status: EscrowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub player_a_agent_id: String,
    pub player_b_agent_id: String,
    pub player_a_deposited: bool,
    pub player_b_deposited: bool,
    pub settlement_attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_settlement_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_settlement_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}
