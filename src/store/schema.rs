//! SQL schema for the embedded SQLite store (§4.L).
//!
//! Startup runs the `CREATE_TABLE` statements (idempotent via `IF NOT
//! EXISTS`), then the `ADDITIVE_MIGRATIONS` list, each independently
//! wrapped so that an "already exists" error from a prior run is
//! swallowed — the only realistic failure mode for a migration that only
//! ever adds columns.

pub const CREATE_TABLES: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        api_key TEXT,
        payout_address TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        metadata TEXT NOT NULL DEFAULT '{}',
        last_health_status TEXT NOT NULL DEFAULT 'unknown',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_agents_enabled ON agents(enabled)"#,
    r#"CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        topic TEXT NOT NULL,
        status TEXT NOT NULL,
        proposer_agent_id TEXT NOT NULL,
        counterparty_agent_id TEXT,
        terms TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)"#,
    r#"CREATE TABLE IF NOT EXISTS sealed_inputs (
        session_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        key_id TEXT NOT NULL,
        iv TEXT NOT NULL,
        auth_tag TEXT NOT NULL,
        cipher_text TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (session_id, agent_id)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_sealed_inputs_session ON sealed_inputs(session_id)"#,
    r#"CREATE TABLE IF NOT EXISTS session_turns (
        session_id TEXT NOT NULL,
        turn INTEGER NOT NULL,
        status TEXT NOT NULL,
        summary TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        PRIMARY KEY (session_id, turn)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_session_turns_composite ON session_turns(session_id, turn)"#,
    r#"CREATE TABLE IF NOT EXISTS attestations (
        session_id TEXT PRIMARY KEY,
        signer_address TEXT NOT NULL,
        payload_hash TEXT NOT NULL,
        signature TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS escrow_records (
        session_id TEXT PRIMARY KEY,
        contract_address TEXT NOT NULL,
        token_address TEXT,
        stake_amount TEXT NOT NULL,
        status TEXT NOT NULL,
        tx_hash TEXT,
        player_a_agent_id TEXT NOT NULL,
        player_b_agent_id TEXT NOT NULL,
        player_a_deposited INTEGER NOT NULL DEFAULT 0,
        player_b_deposited INTEGER NOT NULL DEFAULT 0,
        settlement_attempts INTEGER NOT NULL DEFAULT 0,
        last_settlement_error TEXT,
        last_settlement_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_escrow_status ON escrow_records(status)"#,
];

/// Additive migrations: `(table, column, ddl_type_and_default)`.
pub const ADDITIVE_MIGRATIONS: &[(&str, &str, &str)] = &[
    ("agents", "last_health_status", "TEXT NOT NULL DEFAULT 'unknown'"),
    ("sessions", "updated_at", "INTEGER NOT NULL DEFAULT 0"),
];
