//! Escrow automation loop (§4.M): a single background task tied to
//! process lifetime that periodically drives `settle` on every eligible
//! escrow row.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use slog::{error, info, Logger};

use crate::escrow;
use crate::store::Store;

#[derive(Default)]
pub struct AutomationStatus {
    pub last_tick_at: AtomicI64,
    pub last_tick_settled: AtomicI64,
    pub last_tick_refunded: AtomicI64,
    pub last_tick_pending: AtomicI64,
    pub last_tick_noop: AtomicI64,
}

#[derive(Serialize)]
pub struct AutomationStatusSnapshot {
    pub enabled: bool,
    pub interval_ms: u64,
    #[serde(rename = "lastTickAt")]
    pub last_tick_at: i64,
    pub settled: i64,
    pub refunded: i64,
    pub pending: i64,
    pub noop: i64,
}

impl AutomationStatus {
    pub fn snapshot(&self, enabled: bool, interval_ms: u64) -> AutomationStatusSnapshot {
        AutomationStatusSnapshot {
            enabled,
            interval_ms,
            last_tick_at: self.last_tick_at.load(Ordering::Relaxed),
            settled: self.last_tick_settled.load(Ordering::Relaxed),
            refunded: self.last_tick_refunded.load(Ordering::Relaxed),
            pending: self.last_tick_pending.load(Ordering::Relaxed),
            noop: self.last_tick_noop.load(Ordering::Relaxed),
        }
    }
}

/// Run one reconciliation pass over every tick-eligible escrow row.
pub async fn run_tick(store: &Store, status: &AutomationStatus, logger: &Logger) {
    let escrows = match store.list_escrows_tick_eligible().await {
        Ok(rows) => rows,
        Err(e) => {
            error!(logger, "automation tick failed to list escrows"; "error" => e.to_string());
            return;
        }
    };

    let (mut settled, mut refunded, mut pending, mut noop) = (0, 0, 0, 0);

    for escrow_row in escrows {
        let session = match store.get_session(&escrow_row.session_id).await {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => {
                error!(logger, "automation tick failed to load session"; "session_id" => &escrow_row.session_id, "error" => e.to_string());
                continue;
            }
        };

        let (updated, outcome) = escrow::settle(escrow_row, session.status);
        match outcome {
            escrow::SettleOutcome::Settled => settled += 1,
            escrow::SettleOutcome::Refunded => refunded += 1,
            escrow::SettleOutcome::Pending => pending += 1,
            escrow::SettleOutcome::AlreadyFinalized | escrow::SettleOutcome::SessionNotFinal => noop += 1,
        }

        if let Err(e) = store.upsert_escrow(&updated).await {
            error!(logger, "automation tick failed to persist escrow"; "session_id" => &updated.session_id, "error" => e.to_string());
        }
    }

    status.last_tick_at.store(crate::models::now(), Ordering::Relaxed);
    status.last_tick_settled.store(settled, Ordering::Relaxed);
    status.last_tick_refunded.store(refunded, Ordering::Relaxed);
    status.last_tick_pending.store(pending, Ordering::Relaxed);
    status.last_tick_noop.store(noop, Ordering::Relaxed);

    info!(logger, "automation tick complete"; "settled" => settled, "refunded" => refunded, "pending" => pending, "noop" => noop);
}

/// Spawn the periodic automation loop as a detached task. The returned
/// handle is intentionally not awaited by the caller; it runs until
/// process shutdown.
pub fn spawn(
    store: Store,
    status: Arc<AutomationStatus>,
    interval_ms: u64,
    logger: Logger,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
        loop {
            ticker.tick().await;
            run_tick(&store, &status, &logger).await;
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{now, Session, SessionStatus};
    use crate::store::Store;
    use serde_json::json;

    async fn memory_store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn tick_settles_funded_agreed_session() {
        let store = memory_store().await;
        let ts = now();
        let session = Session {
            id: "s1".to_string(),
            topic: "t".to_string(),
            status: SessionStatus::Agreed,
            proposer_agent_id: "a".to_string(),
            counterparty_agent_id: Some("b".to_string()),
            terms: json!({}),
            created_at: ts,
            updated_at: ts,
        };
        store.insert_session(&session).await.unwrap();

        let escrow_row = crate::models::Escrow {
            session_id: "s1".to_string(),
            contract_address: "0xabc".to_string(),
            token_address: None,
            stake_amount: "10".to_string(),
            status: crate::models::EscrowStatus::Funded,
            tx_hash: None,
            player_a_agent_id: "a".to_string(),
            player_b_agent_id: "b".to_string(),
            player_a_deposited: true,
            player_b_deposited: true,
            settlement_attempts: 0,
            last_settlement_error: None,
            last_settlement_at: None,
            created_at: ts,
            updated_at: ts,
        };
        store.upsert_escrow(&escrow_row).await.unwrap();

        let status = AutomationStatus::default();
        let logger = crate::logging::root_logger("test");
        run_tick(&store, &status, &logger).await;

        let updated = store.get_escrow("s1").await.unwrap().unwrap();
        assert_eq!(updated.status, crate::models::EscrowStatus::Settled);
        assert_eq!(status.last_tick_settled.load(Ordering::Relaxed), 1);
    }
}
