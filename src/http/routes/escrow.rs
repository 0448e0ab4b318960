//! `/sessions/:id/escrow/*`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::escrow as escrow_logic;
use crate::http::{AppState, Actor, Role};
use crate::session::{self, CallerRole};

fn caller_role(actor: &Actor) -> CallerRole {
    if actor.is_privileged() { CallerRole::Privileged } else { CallerRole::Agent }
}

async fn load_session(state: &AppState, id: &str) -> Result<crate::models::Session, ApiError> {
    state
        .store
        .get_session(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
}

pub async fn prepare(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let agent_id = actor.require_agent_or_privileged()?;
    let session_row = load_session(&state, &id).await?;
    session::check_participant(&session_row, &agent_id, caller_role(&actor))?;

    let existing = state.store.get_escrow(&id).await?;
    let escrow_row = escrow_logic::prepare(&session_row, existing)?;
    state.store.upsert_escrow(&escrow_row).await?;
    Ok(Json(json!({ "ok": true, "escrow": escrow_row })))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    let escrow_row = state
        .store
        .get_escrow(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("escrow for session {id}")))?;
    Ok(Json(json!({ "ok": true, "escrow": escrow_row })))
}

#[derive(Deserialize)]
pub struct DepositRequest {
    amount: String,
}

pub async fn deposit(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
    Json(body): Json<DepositRequest>,
) -> Result<Json<Value>, ApiError> {
    let agent_id = actor.require_agent_or_privileged()?;
    let session_row = load_session(&state, &id).await?;
    session::check_participant(&session_row, &agent_id, caller_role(&actor))?;

    let escrow_row = state
        .store
        .get_escrow(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("escrow for session {id}")))?;
    let updated = escrow_logic::deposit(escrow_row, &agent_id, &body.amount)?;
    state.store.upsert_escrow(&updated).await?;
    Ok(Json(json!({ "ok": true, "escrow": updated })))
}

pub async fn settle(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let agent_id = actor.require_agent_or_privileged()?;
    let session_row = load_session(&state, &id).await?;
    session::check_participant(&session_row, &agent_id, caller_role(&actor))?;
    let escrow_row = state
        .store
        .get_escrow(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("escrow for session {id}")))?;
    let (updated, outcome) = escrow_logic::settle(escrow_row, session_row.status);
    state.store.upsert_escrow(&updated).await?;
    Ok(Json(json!({ "ok": true, "escrow": updated, "outcome": format!("{outcome:?}") })))
}
