//! `/health`, `/metrics`, `/auth/status`.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::http::{AppState, Actor};

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime_ms = crate::models::now() - state.started_at;
    Json(json!({
        "ok": true,
        "status": "healthy",
        "uptimeMs": uptime_ms,
        "automation": state.automation_status.snapshot(
            state.config.automation_escrow_enabled,
            state.config.escrow_automation_interval_ms,
        ),
    }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "ok": true, "routes": state.metrics.snapshot() }))
}

pub async fn auth_status(actor: Actor) -> Json<Value> {
    Json(json!({
        "ok": true,
        "role": format!("{:?}", actor.role).to_lowercase(),
        "agentId": actor.agent_id,
    }))
}
