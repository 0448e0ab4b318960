//! axum transport and routing (§4.N): one shared `AppState`, a custom
//! role-resolution extractor, and the router assembling every path in
//! the external interface.

pub mod routes;

use std::sync::Arc;

use axum::extract::{FromRequestParts, MatchedPath, Request, State};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::automation::AutomationStatus;
use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::models::Agent;
use crate::store::Store;

pub struct AppState {
    pub store: Store,
    pub config: Config,
    pub http_client: reqwest::Client,
    pub metrics: Metrics,
    pub automation_status: Arc<AutomationStatus>,
    pub started_at: i64,
    pub logger: slog::Logger,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(dead_code)]
pub enum Role {
    Public = 0,
    Readonly = 1,
    Agent = 2,
    Operator = 3,
    Admin = 4,
}

pub struct Actor {
    pub role: Role,
    pub agent_id: Option<String>,
}

impl Actor {
    pub fn require(&self, min: Role) -> Result<(), ApiError> {
        if self.role >= min {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.role >= Role::Operator
    }

    pub fn require_agent_or_privileged(&self) -> Result<String, ApiError> {
        if self.is_privileged() {
            return Ok(self.agent_id.clone().unwrap_or_default());
        }
        self.require(Role::Agent)?;
        self.agent_id.clone().ok_or(ApiError::Unauthorized)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = auth.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

impl FromRequestParts<Arc<AppState>> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers);

        if let Some(token) = &token {
            if state.config.admin_api_keys.iter().any(|k| k == token) {
                return Ok(Actor { role: Role::Admin, agent_id: None });
            }
            if state.config.operator_api_keys.iter().any(|k| k == token) {
                return Ok(Actor { role: Role::Operator, agent_id: None });
            }
            if state.config.readonly_api_keys.iter().any(|k| k == token) {
                return Ok(Actor { role: Role::Readonly, agent_id: None });
            }
            if let Ok(Some(agent)) = state.store.find_agent_by_api_key(token).await {
                return Ok(Actor { role: Role::Agent, agent_id: Some(agent.id) });
            }
        }

        if state.config.allow_public_read {
            Ok(Actor { role: Role::Readonly, agent_id: None })
        } else {
            Ok(Actor { role: Role::Public, agent_id: None })
        }
    }
}

async fn record_metrics(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let response = next.run(req).await;
    state.metrics.record(&route, response.status().is_client_error() || response.status().is_server_error());
    response
}

pub async fn resolve_agent(state: &AppState, agent_id: &str) -> Result<Agent, ApiError> {
    state
        .store
        .get_agent(agent_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("agent {agent_id}")))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/metrics", get(routes::health::metrics))
        .route("/auth/status", get(routes::health::auth_status))
        .route("/policy/strict", get(routes::policy::strict_policy))
        .route("/verification/eigencompute", get(routes::policy::eigencompute_verification))
        .route(
            "/verification/eigencompute/sessions/{id}",
            get(routes::policy::eigencompute_session_verification),
        )
        .route("/agents", get(routes::agents::list_agents))
        .route("/api/agents/register", post(routes::agents::register_agent))
        .route("/api/agents/{id}/probe", post(routes::agents::probe_agent))
        .route("/sessions", get(routes::sessions::list_sessions).post(routes::sessions::create_session))
        .route("/sessions/{id}", get(routes::sessions::get_session))
        .route("/sessions/{id}/accept", post(routes::sessions::accept_session))
        .route("/sessions/{id}/prepare", post(routes::sessions::prepare_session))
        .route("/sessions/{id}/start", post(routes::sessions::start_session))
        .route("/sessions/{id}/adjudicate", post(routes::sessions::adjudicate_session))
        .route("/sessions/{id}/private-inputs", post(routes::sessions::upload_private_inputs))
        .route("/sessions/{id}/negotiate", post(routes::sessions::negotiate_session))
        .route("/negotiate", post(routes::sessions::negotiate_session_body))
        .route("/sessions/{id}/transcript", get(routes::sessions::transcript))
        .route(
            "/sessions/{id}/attestation",
            get(routes::attestation::get_attestation).post(routes::attestation::regenerate_attestation),
        )
        .route("/sessions/{id}/escrow/prepare", post(routes::escrow::prepare))
        .route("/sessions/{id}/escrow/status", get(routes::escrow::status))
        .route("/sessions/{id}/escrow/deposit", post(routes::escrow::deposit))
        .route("/sessions/{id}/escrow/settle", post(routes::escrow::settle))
        .route("/leaderboard/trusted", get(routes::trust::leaderboard))
        .route("/automation/status", get(routes::automation::status))
        .route("/automation/tick", post(routes::automation::tick))
        .layer(middleware::from_fn_with_state(state.clone(), record_metrics))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
