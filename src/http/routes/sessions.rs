//! `/sessions/*` and the top-level `/negotiate` alias.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::engine;
use crate::error::ApiError;
use crate::http::{AppState, Actor, Role};
use crate::models::{Session, SessionStatus};
use crate::policy::PolicySnapshot;
use crate::privacy;
use crate::sealing;
use crate::session::{self, policy as session_policy, CallerRole};

fn caller_role(actor: &Actor) -> CallerRole {
    if actor.is_privileged() { CallerRole::Privileged } else { CallerRole::Agent }
}

async fn load_session(state: &AppState, id: &str) -> Result<Session, ApiError> {
    state
        .store
        .get_session(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
}

#[derive(Deserialize)]
pub struct ListSessionsQuery {
    status: Option<String>,
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(q): Query<ListSessionsQuery>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    let sessions = state.store.list_sessions(q.status.as_deref()).await?;
    Ok(Json(json!({ "ok": true, "sessions": sessions })))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    let session_row = load_session(&state, &id).await?;
    Ok(Json(json!({ "ok": true, "session": session_row })))
}

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    topic: String,
    #[serde(rename = "proposerAgentId")]
    proposer_agent_id: String,
    #[serde(rename = "counterpartyAgentId")]
    counterparty_agent_id: Option<String>,
    #[serde(default)]
    terms: Value,
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<Value>, ApiError> {
    let actor_agent_id = actor.require_agent_or_privileged()?;
    session::check_create(&body.proposer_agent_id, &actor_agent_id, caller_role(&actor))?;
    crate::http::resolve_agent(&state, &body.proposer_agent_id).await?;
    if let Some(cp) = &body.counterparty_agent_id {
        crate::http::resolve_agent(&state, cp).await?;
    }

    let policy = PolicySnapshot::from_env();
    privacy::assert_safe(&body.terms, policy.require_privacy_redaction)
        .map_err(|_| ApiError::PrivacyRedactionViolation)?;

    let ts = crate::models::now();
    let session_row = Session {
        id: Uuid::new_v4().to_string(),
        topic: body.topic,
        status: SessionStatus::Created,
        proposer_agent_id: body.proposer_agent_id,
        counterparty_agent_id: body.counterparty_agent_id,
        terms: body.terms,
        created_at: ts,
        updated_at: ts,
    };
    state.store.insert_session(&session_row).await?;
    Ok(Json(json!({ "ok": true, "session": session_row })))
}

pub async fn accept_session(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let actor_agent_id = actor.require_agent_or_privileged()?;
    let session_row = load_session(&state, &id).await?;
    session::check_accept(&session_row, &actor_agent_id)?;

    let mut updated = session::apply_transition(session_row, SessionStatus::Accepted);
    if updated.counterparty_agent_id.is_none() {
        updated.counterparty_agent_id = Some(actor_agent_id);
    }
    state.store.update_session(&updated).await?;
    Ok(Json(json!({ "ok": true, "session": updated })))
}

pub async fn prepare_session(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let actor_agent_id = actor.require_agent_or_privileged()?;
    let session_row = load_session(&state, &id).await?;
    session::check_participant(&session_row, &actor_agent_id, caller_role(&actor))?;
    session::check_transition(&session_row, SessionStatus::Prepared)?;

    let policy = PolicySnapshot::from_env();
    let proposer = state.store.get_agent(&session_row.proposer_agent_id).await?;
    let counterparty = match &session_row.counterparty_agent_id {
        Some(cp) => state.store.get_agent(cp).await?,
        None => None,
    };
    let reasons = session_policy::evaluate(proposer.as_ref(), counterparty.as_ref(), &policy, &state.config.eigen_app_binding_set);
    if !reasons.is_empty() && policy.require_endpoint_mode {
        return Err(ApiError::StrictPolicyFailed(reasons));
    }

    let updated = session::apply_transition(session_row, SessionStatus::Prepared);
    state.store.update_session(&updated).await?;
    Ok(Json(json!({ "ok": true, "session": updated })))
}

#[derive(Deserialize)]
pub struct PrivateInputsRequest {
    #[serde(rename = "agentId")]
    agent_id: String,
    context: Value,
}

pub async fn upload_private_inputs(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
    Json(body): Json<PrivateInputsRequest>,
) -> Result<Json<Value>, ApiError> {
    let actor_agent_id = actor.require_agent_or_privileged()?;
    let session_row = load_session(&state, &id).await?;
    session::check_private_inputs(&session_row, &actor_agent_id, &body.agent_id, caller_role(&actor))?;

    let plaintext = serde_json::to_vec(&body.context).map_err(|e| ApiError::Internal(e.into()))?;
    let envelope = sealing::seal(
        &state.config.sealing_master_key,
        state.config.env,
        &id,
        &body.agent_id,
        &plaintext,
    )?;
    state.store.upsert_sealed_input(&id, &body.agent_id, &envelope).await?;
    Ok(Json(json!({ "ok": true, "sessionId": id, "agentId": body.agent_id, "keyId": envelope.key_id })))
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let actor_agent_id = actor.require_agent_or_privileged()?;
    let session_row = load_session(&state, &id).await?;
    session::check_participant(&session_row, &actor_agent_id, caller_role(&actor))?;
    session::check_start_precondition(&session_row)?;

    let policy = PolicySnapshot::from_env();
    let proposer = state.store.get_agent(&session_row.proposer_agent_id).await?;
    let counterparty = match &session_row.counterparty_agent_id {
        Some(cp) => state.store.get_agent(cp).await?,
        None => None,
    };
    let reasons = session_policy::evaluate(proposer.as_ref(), counterparty.as_ref(), &policy, &state.config.eigen_app_binding_set);
    if !reasons.is_empty() && policy.require_endpoint_mode {
        return Err(ApiError::StrictPolicyFailed(reasons));
    }

    if crate::escrow::escrow_config(&session_row.terms) {
        let funded = match state.store.get_escrow(&id).await? {
            Some(escrow_row) => escrow_row.status == crate::models::EscrowStatus::Funded,
            None => false,
        };
        if !funded {
            return Err(ApiError::FundingPending);
        }
    }

    let updated = session::apply_transition(session_row, SessionStatus::Active);
    state.store.update_session(&updated).await?;
    Ok(Json(json!({ "ok": true, "session": updated })))
}

async fn run_negotiation(state: &AppState, id: &str, actor_agent_id: &str, actor: &Actor) -> Result<Value, ApiError> {
    let session_row = load_session(state, id).await?;
    session::check_participant(&session_row, actor_agent_id, caller_role(actor))?;
    if session_row.status != SessionStatus::Active {
        return Err(ApiError::NegotiationNotActive);
    }

    let proposer = state
        .store
        .get_agent(&session_row.proposer_agent_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("agent {}", session_row.proposer_agent_id)))?;
    let counterparty_id = session_row
        .counterparty_agent_id
        .clone()
        .ok_or_else(|| ApiError::InvalidRequest("session has no counterparty".to_string()))?;
    let counterparty = state
        .store
        .get_agent(&counterparty_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("agent {counterparty_id}")))?;

    let policy = PolicySnapshot::from_env();
    let reasons = session_policy::evaluate(Some(&proposer), Some(&counterparty), &policy, &state.config.eigen_app_binding_set);
    if !reasons.is_empty() && policy.require_endpoint_mode {
        return Err(ApiError::StrictPolicyFailed(reasons));
    }

    let proposer_envelope = state.store.get_sealed_input(id, &proposer.id).await?;
    let counterparty_envelope = state.store.get_sealed_input(id, &counterparty.id).await?;
    let (Some(proposer_envelope), Some(counterparty_envelope)) = (proposer_envelope, counterparty_envelope) else {
        return Err(ApiError::PrivateContextRequired);
    };

    let proposer_ctx_bytes = sealing::unseal(&state.config.sealing_master_key, state.config.env, id, &proposer.id, &proposer_envelope)?;
    let counterparty_ctx_bytes = sealing::unseal(
        &state.config.sealing_master_key,
        state.config.env,
        id,
        &counterparty.id,
        &counterparty_envelope,
    )?;
    let proposer_ctx: Value = serde_json::from_slice(&proposer_ctx_bytes).map_err(|e| ApiError::Internal(e.into()))?;
    let counterparty_ctx: Value = serde_json::from_slice(&counterparty_ctx_bytes).map_err(|e| ApiError::Internal(e.into()))?;

    let max_turns = session_row
        .terms
        .get("maxTurns")
        .and_then(|v| v.as_i64())
        .unwrap_or(20);

    let result = engine::negotiate(
        id,
        &session_row.topic,
        &proposer,
        &counterparty,
        &proposer_ctx,
        &counterparty_ctx,
        &policy,
        &state.http_client,
        state.config.decision_request_timeout_ms,
        state.config.runtime_verifier_timeout_ms,
        max_turns,
    )
    .await?;

    state.store.replace_turns(id, &result.turns).await?;

    let agreement = result
        .turns
        .last()
        .and_then(|t| t.summary.get("agreedPrice"))
        .cloned()
        .unwrap_or(Value::Null);

    let mut terms = session_row.terms.clone();
    if let Some(obj) = terms.as_object_mut() {
        obj.insert(
            "negotiation".to_string(),
            json!({
                "status": result.final_status.as_str(),
                "turnCount": result.turns.len() as i64,
                "agreement": agreement,
                "executionMode": result.execution_mode,
                "fallbackReason": result.fallback_reason,
                "proofSummary": result.proof_summary,
                "completedAt": crate::models::now(),
            }),
        );
    }
    let mut updated = session_row;
    updated.terms = terms;
    updated.status = result.final_status;
    updated.updated_at = crate::models::now();
    state.store.update_session(&updated).await?;

    Ok(json!({
        "ok": true,
        "session": updated,
        "turns": result.turns,
        "executionMode": result.execution_mode,
        "fallbackReason": result.fallback_reason,
    }))
}

pub async fn negotiate_session(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let actor_agent_id = actor.require_agent_or_privileged()?;
    let body = run_negotiation(&state, &id, &actor_agent_id, &actor).await?;
    Ok(Json(body))
}

#[derive(Deserialize)]
pub struct NegotiateBodyRequest {
    #[serde(rename = "sessionId")]
    session_id: String,
}

pub async fn negotiate_session_body(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(body): Json<NegotiateBodyRequest>,
) -> Result<Json<Value>, ApiError> {
    let actor_agent_id = actor.require_agent_or_privileged()?;
    let out = run_negotiation(&state, &body.session_id, &actor_agent_id, &actor).await?;
    Ok(Json(out))
}

#[derive(Deserialize)]
pub struct AdjudicateRequest {
    status: String,
}

pub async fn adjudicate_session(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
    Json(body): Json<AdjudicateRequest>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Operator)?;
    let session_row = load_session(&state, &id).await?;
    let target = SessionStatus::parse(&body.status)
        .ok_or_else(|| ApiError::InvalidRequest(format!("unknown status {}", body.status)))?;
    session::check_transition(&session_row, target)?;

    let updated = session::apply_transition(session_row, target);
    state.store.update_session(&updated).await?;
    Ok(Json(json!({ "ok": true, "session": updated })))
}

pub async fn transcript(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    load_session(&state, &id).await?;
    let turns = state.store.list_turns(&id).await?;
    Ok(Json(json!({ "ok": true, "sessionId": id, "turns": turns })))
}
