//! Process entry point (§4.Q): load configuration, open the store, check
//! launch-readiness, spawn the escrow automation loop and serve HTTP
//! until a ctrl-c signal arrives.

mod attestation;
mod attestation_runtime;
mod automation;
mod canonical;
mod config;
mod crypto;
mod decision_client;
mod engine;
mod error;
mod escrow;
mod http;
mod logging;
mod metrics;
mod models;
mod policy;
mod privacy;
mod sealing;
mod session;
mod store;
mod trust;

use std::sync::Arc;

use slog::{error, info};

use crate::automation::AutomationStatus;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::policy::PolicySnapshot;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logger = logging::root_logger("molt-negotiation-server");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(logger, "configuration rejected"; "error" => e.to_string());
            std::process::exit(1);
        }
    };

    let policy = PolicySnapshot::from_env();
    if let Err(reasons) = policy::check_launch_readiness(&config, &policy) {
        error!(logger, "launch readiness check failed"; "reasons" => &reasons);
        std::process::exit(1);
    }

    let store = Store::connect(&config.database_path).await?;
    store.migrate().await?;
    info!(logger, "store ready"; "database" => &config.database_path);

    let automation_status = Arc::new(AutomationStatus::default());
    if config.automation_escrow_enabled {
        automation::spawn(
            store.clone(),
            automation_status.clone(),
            config.escrow_automation_interval_ms,
            logger.new(slog::o!("task" => "automation")),
        );
    }

    let state = Arc::new(http::AppState {
        store,
        http_client: reqwest::Client::new(),
        metrics: Metrics::default(),
        automation_status: automation_status.clone(),
        started_at: models::now(),
        logger: logger.clone(),
        config,
    });

    let listen_address = state.config.listen_address.clone();
    let router = http::router(state);

    let listener = tokio::net::TcpListener::bind(&listen_address).await?;
    info!(logger, "listening"; "address" => &listen_address);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(logger.clone()))
        .await?;

    info!(logger, "shutdown complete");
    Ok(())
}

async fn shutdown_signal(logger: slog::Logger) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    info!(logger, "shutdown signal received");
}
