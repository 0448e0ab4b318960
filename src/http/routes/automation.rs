//! `/automation/status` and `/automation/tick`.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::automation;
use crate::error::ApiError;
use crate::http::{AppState, Actor, Role};

pub async fn status(State(state): State<Arc<AppState>>, actor: Actor) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    let snapshot = state.automation_status.snapshot(
        state.config.automation_escrow_enabled,
        state.config.escrow_automation_interval_ms,
    );
    Ok(Json(json!({ "ok": true, "automation": snapshot })))
}

pub async fn tick(State(state): State<Arc<AppState>>, actor: Actor) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Operator)?;
    automation::run_tick(&state.store, &state.automation_status, &state.logger).await;
    let snapshot = state.automation_status.snapshot(
        state.config.automation_escrow_enabled,
        state.config.escrow_automation_interval_ms,
    );
    Ok(Json(json!({ "ok": true, "automation": snapshot })))
}
