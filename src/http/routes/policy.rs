//! `/policy/strict` and `/verification/eigencompute[/sessions/:id]`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::http::{AppState, Actor, Role};
use crate::policy::PolicySnapshot;
use crate::session::policy as session_policy;

pub async fn strict_policy(State(state): State<Arc<AppState>>, actor: Actor) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    let policy = PolicySnapshot::from_env();
    let readiness = crate::policy::check_launch_readiness(&state.config, &policy);
    Ok(Json(json!({
        "ok": true,
        "strict": policy.is_strict(),
        "policy": policy,
        "launchReady": readiness.is_ok(),
        "launchReasons": readiness.err().map(|r| r.split(',').map(String::from).collect::<Vec<_>>()).unwrap_or_default(),
    })))
}

#[derive(Deserialize)]
pub struct EigencomputeQuery {
    #[serde(rename = "proposerAgentId")]
    proposer_agent_id: Option<String>,
    #[serde(rename = "counterpartyAgentId")]
    counterparty_agent_id: Option<String>,
}

pub async fn eigencompute_verification(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Query(q): Query<EigencomputeQuery>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    let policy = PolicySnapshot::from_env();
    let proposer = match &q.proposer_agent_id {
        Some(id) => Some(crate::http::resolve_agent(&state, id).await?),
        None => None,
    };
    let counterparty = match &q.counterparty_agent_id {
        Some(id) => Some(crate::http::resolve_agent(&state, id).await?),
        None => None,
    };
    let reasons = session_policy::evaluate(proposer.as_ref(), counterparty.as_ref(), &policy, &state.config.eigen_app_binding_set);
    Ok(Json(json!({ "ok": true, "passed": reasons.is_empty(), "reasons": reasons })))
}

pub async fn eigencompute_session_verification(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    let session = state
        .store
        .get_session(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))?;
    let policy = PolicySnapshot::from_env();
    let proposer = state.store.get_agent(&session.proposer_agent_id).await?;
    let counterparty = match &session.counterparty_agent_id {
        Some(id) => state.store.get_agent(id).await?,
        None => None,
    };
    let reasons = session_policy::evaluate(proposer.as_ref(), counterparty.as_ref(), &policy, &state.config.eigen_app_binding_set);
    Ok(Json(json!({ "ok": true, "sessionId": id, "passed": reasons.is_empty(), "reasons": reasons })))
}
