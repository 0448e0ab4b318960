//! `/sessions/:id/attestation` (GET: fetch, POST: regenerate).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::attestation;
use crate::error::ApiError;
use crate::http::{AppState, Actor, Role};
use crate::policy::PolicySnapshot;
use crate::session::{self, policy as session_policy, CallerRole};

fn caller_role(actor: &Actor) -> CallerRole {
    if actor.is_privileged() { CallerRole::Privileged } else { CallerRole::Agent }
}

pub async fn get_attestation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    let session_row = state
        .store
        .get_session(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))?;
    let att = state
        .store
        .get_attestation(&id)
        .await?
        .ok_or(ApiError::AttestationRequired)?;

    let turns = state.store.list_turns(&id).await?;
    let configured_signer = attestation::configured_signer_address(&state.config.attestation_signer_key, state.config.env);
    let reasons = attestation::verify(&att, &session_row, &turns, configured_signer.as_deref());
    let verification = json!({ "valid": reasons.is_empty(), "reasons": reasons });

    Ok(Json(json!({ "ok": true, "attestation": att, "verification": verification })))
}

pub async fn regenerate_attestation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let actor_agent_id = actor.require_agent_or_privileged()?;
    let session_row = state
        .store
        .get_session(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))?;
    session::check_participant(&session_row, &actor_agent_id, caller_role(&actor))?;
    if !session_row.status.is_terminal() {
        return Err(ApiError::InvalidRequest("session has not reached a terminal status".to_string()));
    }

    let turns = state.store.list_turns(&id).await?;
    let policy = PolicySnapshot::from_env();

    let proposer = state.store.get_agent(&session_row.proposer_agent_id).await?;
    let counterparty = match &session_row.counterparty_agent_id {
        Some(cp) => state.store.get_agent(cp).await?,
        None => None,
    };
    let policy_reasons = session_policy::evaluate(proposer.as_ref(), counterparty.as_ref(), &policy, &state.config.eigen_app_binding_set);
    let strict_policy_ok = policy_reasons.is_empty();

    let proposer_sealed = state.store.get_sealed_input(&id, &session_row.proposer_agent_id).await?;
    let counterparty_sealed = match &session_row.counterparty_agent_id {
        Some(cp) => state.store.get_sealed_input(&id, cp).await?,
        None => None,
    };
    let both_sealed = proposer_sealed.is_some() && counterparty_sealed.is_some();

    let strict_verified = attestation::strict_verified(&session_row, strict_policy_ok, both_sealed);
    let execution_mode = session_row
        .terms
        .get("negotiation")
        .and_then(|e| e.get("executionMode"))
        .and_then(|v| v.as_str())
        .unwrap_or("fallback")
        .to_string();

    let att = attestation::sign(
        &state.config.attestation_signer_key,
        state.config.env,
        &session_row,
        &turns,
        &policy,
        strict_verified,
        policy_reasons,
        &execution_mode,
    )?;
    state.store.upsert_attestation(&att).await?;
    Ok(Json(json!({ "ok": true, "attestation": att })))
}
