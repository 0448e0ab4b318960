//! The single HTTP-boundary error type and its JSON envelope.
//!
//! Every handler returns `Result<T, ApiError>`. Component-level errors
//! (`SealError`, `ProofError`, `EngineError`, ...) convert into this via
//! `#[from]` so each module keeps its own narrow error enum and this one
//! stays a flat list of wire-visible codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::attestation::AttestationError;
use crate::decision_client::DecisionError;
use crate::engine::EngineError;
use crate::escrow::EscrowError;
use crate::sealing::SealError;
use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("strict policy failed")]
    StrictPolicyFailed(Vec<String>),
    #[error("endpoint mode required")]
    EndpointModeRequired,
    #[error("sandbox metadata required")]
    SandboxMetadataRequired,
    #[error("eigencompute metadata required")]
    EigencomputeMetadataRequired,
    #[error("actor scope violation")]
    ActorScopeViolation,
    #[error("invalid state transition")]
    InvalidStateTransition(String),
    #[error("prepare required before start")]
    PrepareRequiredBeforeStart,
    #[error("funding pending")]
    FundingPending,
    #[error("attestation required")]
    AttestationRequired,
    #[error("attestation verification failed: {0}")]
    AttestationVerificationFailed(String),
    #[error("trust filter excluded")]
    TrustFilterExcluded,
    #[error("private context required")]
    PrivateContextRequired,
    #[error("negotiation not active")]
    NegotiationNotActive,
    #[error("privacy redaction violation")]
    PrivacyRedactionViolation,
    #[error("health probe failed: {0}")]
    HealthProbeFailed(String),
    #[error("agent id conflict")]
    AgentIdConflict,
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound(_) => "not_found",
            ApiError::StrictPolicyFailed(_) => "strict_policy_failed",
            ApiError::EndpointModeRequired => "endpoint_mode_required",
            ApiError::SandboxMetadataRequired => "sandbox_metadata_required",
            ApiError::EigencomputeMetadataRequired => "eigencompute_metadata_required",
            ApiError::ActorScopeViolation => "actor_scope_violation",
            ApiError::InvalidStateTransition(_) => "invalid_state_transition",
            ApiError::PrepareRequiredBeforeStart => "prepare_required_before_start",
            ApiError::FundingPending => "funding_pending",
            ApiError::AttestationRequired => "attestation_required",
            ApiError::AttestationVerificationFailed(_) => "attestation_verification_failed",
            ApiError::TrustFilterExcluded => "trust_filter_excluded",
            ApiError::PrivateContextRequired => "private_context_required",
            ApiError::NegotiationNotActive => "negotiation_not_active",
            ApiError::PrivacyRedactionViolation => "privacy_redaction_violation",
            ApiError::HealthProbeFailed(_) => "health_probe_failed",
            ApiError::AgentIdConflict => "agent_id_conflict",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::StrictPolicyFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::EndpointModeRequired
            | ApiError::SandboxMetadataRequired
            | ApiError::EigencomputeMetadataRequired => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::ActorScopeViolation => StatusCode::FORBIDDEN,
            ApiError::InvalidStateTransition(_) => StatusCode::CONFLICT,
            ApiError::PrepareRequiredBeforeStart => StatusCode::CONFLICT,
            ApiError::FundingPending => StatusCode::CONFLICT,
            ApiError::AttestationRequired => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::AttestationVerificationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::TrustFilterExcluded => StatusCode::FORBIDDEN,
            ApiError::PrivateContextRequired => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NegotiationNotActive => StatusCode::CONFLICT,
            ApiError::PrivacyRedactionViolation => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::HealthProbeFailed(_) => StatusCode::BAD_GATEWAY,
            ApiError::AgentIdConflict => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            ApiError::StrictPolicyFailed(reasons) => {
                Some(serde_json::json!({ "reasons": reasons }))
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Serialize)]
struct Envelope {
    ok: bool,
    error: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_)) {
            tracing_unavailable_log(&self);
        }
        let status = self.status();
        let body = Envelope {
            ok: false,
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Placeholder hook kept distinct from the main `slog` root logger: the
/// handler layer doesn't carry a logger handle through every call site,
/// so internal errors are also eprintln'd as a last-resort trace. Real
/// request-scoped logging happens in `crate::http` middleware.
fn tracing_unavailable_log(err: &ApiError) {
    eprintln!("internal_error: {err:#}");
}

impl From<SealError> for ApiError {
    fn from(e: SealError) -> Self {
        ApiError::Internal(e.into())
    }
}

impl From<DecisionError> for ApiError {
    fn from(e: DecisionError) -> Self {
        ApiError::AttestationVerificationFailed(e.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::PrivateContextRequired => ApiError::PrivateContextRequired,
            EngineError::NotActive => ApiError::NegotiationNotActive,
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        match e {
            EscrowError::InvalidTransition(msg) => ApiError::InvalidStateTransition(msg),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidTransition(msg) => ApiError::InvalidStateTransition(msg),
            SessionError::ScopeViolation => ApiError::ActorScopeViolation,
            SessionError::PrepareRequiredBeforeStart => ApiError::PrepareRequiredBeforeStart,
            SessionError::AgentIdConflict => ApiError::AgentIdConflict,
            SessionError::ProposerCannotAcceptOwnSession => {
                ApiError::InvalidRequest("proposer cannot accept its own session".to_string())
            }
        }
    }
}

impl From<AttestationError> for ApiError {
    fn from(e: AttestationError) -> Self {
        ApiError::AttestationVerificationFailed(e.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Internal(anyhow::Error::new(e))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strict_policy_failed_carries_reasons_in_details() {
        let err = ApiError::StrictPolicyFailed(vec!["missing_turn_proof".to_string()]);
        assert_eq!(err.code(), "strict_policy_failed");
        let details = err.details().unwrap();
        assert_eq!(details["reasons"][0], "missing_turn_proof");
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::NotFound("session".to_string());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn scope_violation_maps_to_403() {
        assert_eq!(ApiError::ActorScopeViolation.status(), StatusCode::FORBIDDEN);
    }
}
