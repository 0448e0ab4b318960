//! `/agents` listing and `/api/agents/register` + `/api/agents/:id/probe`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiError;
use crate::http::{AppState, Actor, Role};
use crate::models::{Agent, HealthStatus};

pub async fn list_agents(State(state): State<Arc<AppState>>, actor: Actor) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    let agents = state.store.list_agents().await?;
    let sanitized: Vec<Value> = agents
        .into_iter()
        .map(|a| {
            let mut v = serde_json::to_value(&a).unwrap_or(json!({}));
            v.as_object_mut().map(|m| m.remove("apiKey"));
            v
        })
        .collect();
    Ok(Json(json!({ "ok": true, "agents": sanitized })))
}

#[derive(Deserialize)]
pub struct RegisterAgentRequest {
    name: String,
    endpoint: String,
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
    #[serde(rename = "payoutAddress")]
    payout_address: Option<String>,
    #[serde(default)]
    metadata: Value,
}

pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(body): Json<RegisterAgentRequest>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Public)?;
    if body.name.trim().is_empty() || body.endpoint.trim().is_empty() {
        return Err(ApiError::InvalidRequest("name and endpoint are required".to_string()));
    }
    if let Some(api_key) = &body.api_key {
        if state.store.find_agent_by_api_key(api_key).await?.is_some() {
            return Err(ApiError::AgentIdConflict);
        }
    }
    let ts = crate::models::now();
    let agent = Agent {
        id: Uuid::new_v4().to_string(),
        name: body.name,
        endpoint: body.endpoint,
        api_key: body.api_key,
        payout_address: body.payout_address,
        enabled: true,
        metadata: body.metadata,
        last_health_status: HealthStatus::Unknown,
        created_at: ts,
        updated_at: ts,
    };
    state.store.upsert_agent(&agent).await?;
    Ok(Json(json!({ "ok": true, "agent": agent })))
}

pub async fn probe_agent(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Agent)?;
    let mut agent = crate::http::resolve_agent(&state, &id).await?;

    let timeout = std::time::Duration::from_millis(state.config.health_probe_timeout_ms.clamp(1, 60_000));
    let url = format!("{}/health", agent.endpoint.trim_end_matches('/'));
    let reachable = state
        .http_client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false);

    agent.last_health_status = if reachable { HealthStatus::Healthy } else { HealthStatus::Unhealthy };
    agent.updated_at = crate::models::now();
    state.store.upsert_agent(&agent).await?;

    if !reachable {
        return Err(ApiError::HealthProbeFailed(id));
    }
    Ok(Json(json!({ "ok": true, "agentId": agent.id, "status": agent.last_health_status })))
}
