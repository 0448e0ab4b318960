//! SQLite-backed persistence adapter (§4.L).
//!
//! Every write is a single table-level statement run through the pool —
//! there is deliberately no cross-table transaction wrapping a whole
//! request; the state machine tolerates replay instead (negotiate always
//! clears turns before re-inserting, settle is idempotent).

pub mod schema;

use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::models::{
    Agent, Attestation, AttestationPayload, Escrow, EscrowStatus, HealthStatus, Session,
    SessionStatus, SessionTurn, TurnStatus,
};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_path: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_path)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in schema::CREATE_TABLES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        for (table, column, ddl) in schema::ADDITIVE_MIGRATIONS {
            let stmt = format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}");
            if let Err(e) = sqlx::query(&stmt).execute(&self.pool).await {
                if !e.to_string().contains("duplicate column name") {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    // ---- agents ----

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO agents (id, name, endpoint, api_key, payout_address, enabled, metadata, last_health_status, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 endpoint = excluded.endpoint,
                 api_key = excluded.api_key,
                 payout_address = excluded.payout_address,
                 enabled = excluded.enabled,
                 metadata = excluded.metadata,
                 last_health_status = excluded.last_health_status,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(&agent.endpoint)
        .bind(&agent.api_key)
        .bind(&agent.payout_address)
        .bind(agent.enabled)
        .bind(agent.metadata.to_string())
        .bind(health_status_str(agent.last_health_status))
        .bind(agent.created_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<Agent>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_agent(&r)))
    }

    pub async fn find_agent_by_api_key(&self, api_key: &str) -> Result<Option<Agent>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM agents WHERE api_key = ? AND enabled = 1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_agent(&r)))
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_agent).collect())
    }

    // ---- sessions ----

    pub async fn insert_session(&self, session: &Session) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO sessions (id, topic, status, proposer_agent_id, counterparty_agent_id, terms, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&session.id)
        .bind(&session.topic)
        .bind(session.status.as_str())
        .bind(&session.proposer_agent_id)
        .bind(&session.counterparty_agent_id)
        .bind(session.terms.to_string())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_session(&self, session: &Session) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sessions SET status = ?, counterparty_agent_id = ?, terms = ?, updated_at = ? WHERE id = ?"#,
        )
        .bind(session.status.as_str())
        .bind(&session.counterparty_agent_id)
        .bind(session.terms.to_string())
        .bind(session.updated_at)
        .bind(&session.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_session(&r)))
    }

    pub async fn list_sessions(&self, status_filter: Option<&str>) -> Result<Vec<Session>, sqlx::Error> {
        let rows = match status_filter {
            Some(status) => {
                sqlx::query("SELECT * FROM sessions WHERE status = ? ORDER BY created_at DESC")
                    .bind(status)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM sessions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(row_to_session).collect())
    }

    pub async fn list_sessions_terminal(&self) -> Result<Vec<Session>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE status IN ('agreed','no_agreement','failed','settled','refunded','cancelled') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_session).collect())
    }

    // ---- sealed inputs ----

    pub async fn upsert_sealed_input(
        &self,
        session_id: &str,
        agent_id: &str,
        envelope: &crate::sealing::Envelope,
    ) -> Result<(), sqlx::Error> {
        let ts = crate::models::now();
        sqlx::query(
            r#"INSERT INTO sealed_inputs (session_id, agent_id, key_id, iv, auth_tag, cipher_text, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(session_id, agent_id) DO UPDATE SET
                 key_id = excluded.key_id, iv = excluded.iv, auth_tag = excluded.auth_tag,
                 cipher_text = excluded.cipher_text, updated_at = excluded.updated_at"#,
        )
        .bind(session_id)
        .bind(agent_id)
        .bind(&envelope.key_id)
        .bind(&envelope.iv)
        .bind(&envelope.auth_tag)
        .bind(&envelope.cipher_text)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_sealed_input(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<Option<crate::sealing::Envelope>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM sealed_inputs WHERE session_id = ? AND agent_id = ?")
            .bind(session_id)
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| crate::sealing::Envelope {
            key_id: r.get("key_id"),
            iv: r.get("iv"),
            auth_tag: r.get("auth_tag"),
            cipher_text: r.get("cipher_text"),
        }))
    }

    // ---- session turns ----

    pub async fn replace_turns(&self, session_id: &str, turns: &[SessionTurn]) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM session_turns WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        for turn in turns {
            sqlx::query(
                "INSERT INTO session_turns (session_id, turn, status, summary, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&turn.session_id)
            .bind(turn.turn)
            .bind(turn.status.as_str())
            .bind(turn.summary.to_string())
            .bind(turn.created_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn list_turns(&self, session_id: &str) -> Result<Vec<SessionTurn>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM session_turns WHERE session_id = ? ORDER BY turn ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_turn).collect())
    }

    // ---- attestations ----

    pub async fn upsert_attestation(&self, attestation: &Attestation) -> Result<(), sqlx::Error> {
        let payload_json = serde_json::to_string(&attestation.payload).unwrap_or_default();
        sqlx::query(
            r#"INSERT INTO attestations (session_id, signer_address, payload_hash, signature, payload, created_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(session_id) DO UPDATE SET
                 signer_address = excluded.signer_address, payload_hash = excluded.payload_hash,
                 signature = excluded.signature, payload = excluded.payload, created_at = excluded.created_at"#,
        )
        .bind(&attestation.session_id)
        .bind(&attestation.signer_address)
        .bind(&attestation.payload_hash)
        .bind(&attestation.signature)
        .bind(payload_json)
        .bind(attestation.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_attestation(&self, session_id: &str) -> Result<Option<Attestation>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM attestations WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_attestation(&r)))
    }

    // ---- escrow ----

    pub async fn upsert_escrow(&self, escrow: &Escrow) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO escrow_records (session_id, contract_address, token_address, stake_amount, status, tx_hash,
                 player_a_agent_id, player_b_agent_id, player_a_deposited, player_b_deposited, settlement_attempts,
                 last_settlement_error, last_settlement_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(session_id) DO UPDATE SET
                 contract_address = excluded.contract_address, token_address = excluded.token_address,
                 stake_amount = excluded.stake_amount, status = excluded.status, tx_hash = excluded.tx_hash,
                 player_a_agent_id = excluded.player_a_agent_id, player_b_agent_id = excluded.player_b_agent_id,
                 player_a_deposited = excluded.player_a_deposited, player_b_deposited = excluded.player_b_deposited,
                 settlement_attempts = excluded.settlement_attempts, last_settlement_error = excluded.last_settlement_error,
                 last_settlement_at = excluded.last_settlement_at, updated_at = excluded.updated_at"#,
        )
        .bind(&escrow.session_id)
        .bind(&escrow.contract_address)
        .bind(&escrow.token_address)
        .bind(&escrow.stake_amount)
        .bind(escrow.status.as_str())
        .bind(&escrow.tx_hash)
        .bind(&escrow.player_a_agent_id)
        .bind(&escrow.player_b_agent_id)
        .bind(escrow.player_a_deposited)
        .bind(escrow.player_b_deposited)
        .bind(escrow.settlement_attempts)
        .bind(&escrow.last_settlement_error)
        .bind(escrow.last_settlement_at)
        .bind(escrow.created_at)
        .bind(escrow.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_escrow(&self, session_id: &str) -> Result<Option<Escrow>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM escrow_records WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_escrow(&r)))
    }

    pub async fn list_escrows_tick_eligible(&self) -> Result<Vec<Escrow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM escrow_records WHERE status IN ('prepared','funding_pending','funded','settlement_pending','refund_pending')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_escrow).collect())
    }
}

fn health_status_str(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Unknown => "unknown",
        HealthStatus::Healthy => "healthy",
        HealthStatus::Unhealthy => "unhealthy",
    }
}

fn parse_health_status(s: &str) -> HealthStatus {
    match s {
        "healthy" => HealthStatus::Healthy,
        "unhealthy" => HealthStatus::Unhealthy,
        _ => HealthStatus::Unknown,
    }
}

fn parse_json_column(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::Null)
}

fn row_to_agent(row: &sqlx::sqlite::SqliteRow) -> Agent {
    Agent {
        id: row.get("id"),
        name: row.get("name"),
        endpoint: row.get("endpoint"),
        api_key: row.get("api_key"),
        payout_address: row.get("payout_address"),
        enabled: row.get::<i64, _>("enabled") != 0,
        metadata: parse_json_column(row.get("metadata")),
        last_health_status: parse_health_status(&row.get::<String, _>("last_health_status")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Session {
    Session {
        id: row.get("id"),
        topic: row.get("topic"),
        status: SessionStatus::parse(&row.get::<String, _>("status")).unwrap_or(SessionStatus::Created),
        proposer_agent_id: row.get("proposer_agent_id"),
        counterparty_agent_id: row.get("counterparty_agent_id"),
        terms: parse_json_column(row.get("terms")),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> SessionTurn {
    let status = match row.get::<String, _>("status").as_str() {
        "agreed" => TurnStatus::Agreed,
        "no_agreement" => TurnStatus::NoAgreement,
        "failed" => TurnStatus::Failed,
        _ => TurnStatus::Continue,
    };
    SessionTurn {
        session_id: row.get("session_id"),
        turn: row.get("turn"),
        status,
        summary: parse_json_column(row.get("summary")),
        created_at: row.get("created_at"),
    }
}

fn row_to_attestation(row: &sqlx::sqlite::SqliteRow) -> Attestation {
    let payload_raw: String = row.get("payload");
    let payload: AttestationPayload = serde_json::from_str(&payload_raw).unwrap_or(AttestationPayload {
        version: "v1".to_string(),
        session_id: row.get("session_id"),
        status: String::new(),
        turns: 0,
        outcome_hash: String::new(),
        policy_hash: String::new(),
        execution_mode: String::new(),
        strict_verified: false,
        strict_reasons: vec![],
        participants: vec![],
        generated_at: 0,
    });
    Attestation {
        session_id: row.get("session_id"),
        signer_address: row.get("signer_address"),
        payload_hash: row.get("payload_hash"),
        signature: row.get("signature"),
        payload,
        created_at: row.get("created_at"),
    }
}

fn row_to_escrow(row: &sqlx::sqlite::SqliteRow) -> Escrow {
    let status = match row.get::<String, _>("status").as_str() {
        "funding_pending" => EscrowStatus::FundingPending,
        "funded" => EscrowStatus::Funded,
        "settlement_pending" => EscrowStatus::SettlementPending,
        "refund_pending" => EscrowStatus::RefundPending,
        "settled" => EscrowStatus::Settled,
        "refunded" => EscrowStatus::Refunded,
        "failed" => EscrowStatus::Failed,
        _ => EscrowStatus::Prepared,
    };
    Escrow {
        session_id: row.get("session_id"),
        contract_address: row.get("contract_address"),
        token_address: row.get("token_address"),
        stake_amount: row.get("stake_amount"),
        status,
        tx_hash: row.get("tx_hash"),
        player_a_agent_id: row.get("player_a_agent_id"),
        player_b_agent_id: row.get("player_b_agent_id"),
        player_a_deposited: row.get::<i64, _>("player_a_deposited") != 0,
        player_b_deposited: row.get::<i64, _>("player_b_deposited") != 0,
        settlement_attempts: row.get("settlement_attempts"),
        last_settlement_error: row.get("last_settlement_error"),
        last_settlement_at: row.get("last_settlement_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::now;
    use serde_json::json;

    async fn memory_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn test_agent(id: &str) -> Agent {
        let ts = now();
        Agent {
            id: id.to_string(),
            name: "Agent".to_string(),
            endpoint: "https://agent.example.com".to_string(),
            api_key: Some(format!("key-{id}")),
            payout_address: None,
            enabled: true,
            metadata: json!({}),
            last_health_status: HealthStatus::Unknown,
            created_at: ts,
            updated_at: ts,
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = memory_store().await;
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn agent_roundtrips() {
        let store = memory_store().await;
        let agent = test_agent("agent-1");
        store.upsert_agent(&agent).await.unwrap();
        let fetched = store.get_agent("agent-1").await.unwrap().unwrap();
        assert_eq!(fetched.name, agent.name);
        assert_eq!(fetched.api_key, agent.api_key);
    }

    #[tokio::test]
    async fn session_replace_turns_clears_prior_rows() {
        let store = memory_store().await;
        let ts = now();
        let session = Session {
            id: "s1".to_string(),
            topic: "t".to_string(),
            status: SessionStatus::Active,
            proposer_agent_id: "a".to_string(),
            counterparty_agent_id: Some("b".to_string()),
            terms: json!({}),
            created_at: ts,
            updated_at: ts,
        };
        store.insert_session(&session).await.unwrap();

        let turn1 = SessionTurn {
            session_id: "s1".to_string(),
            turn: 1,
            status: TurnStatus::Continue,
            summary: json!({}),
            created_at: ts,
        };
        store.replace_turns("s1", &[turn1]).await.unwrap();
        assert_eq!(store.list_turns("s1").await.unwrap().len(), 1);

        store.replace_turns("s1", &[]).await.unwrap();
        assert_eq!(store.list_turns("s1").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn escrow_roundtrips() {
        let store = memory_store().await;
        let ts = now();
        let escrow = Escrow {
            session_id: "s1".to_string(),
            contract_address: "0xabc".to_string(),
            token_address: None,
            stake_amount: "100".to_string(),
            status: EscrowStatus::Prepared,
            tx_hash: None,
            player_a_agent_id: "a".to_string(),
            player_b_agent_id: "b".to_string(),
            player_a_deposited: false,
            player_b_deposited: false,
            settlement_attempts: 0,
            last_settlement_error: None,
            last_settlement_at: None,
            created_at: ts,
            updated_at: ts,
        };
        store.upsert_escrow(&escrow).await.unwrap();
        let fetched = store.get_escrow("s1").await.unwrap().unwrap();
        assert_eq!(fetched.contract_address, "0xabc");
    }
}
