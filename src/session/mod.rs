//! Session lifecycle state machine and actor-scope gating (§4.G).

pub mod policy;

use thiserror::Error;

use crate::models::{Session, SessionStatus};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid_state_transition: {0}")]
    InvalidTransition(String),
    #[error("actor_scope_violation")]
    ScopeViolation,
    #[error("prepare_required_before_start")]
    PrepareRequiredBeforeStart,
    #[error("agent_id_conflict")]
    AgentIdConflict,
    #[error("proposer cannot accept its own session")]
    ProposerCannotAcceptOwnSession,
}

/// Roles relevant to scope checks. Privileged actors bypass participant
/// gating entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallerRole {
    Agent,
    Privileged,
}

fn transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Created, Accepted)
            | (Accepted, Prepared)
            | (Prepared, Active)
            | (Active, Agreed)
            | (Active, NoAgreement)
            | (Active, Failed)
    )
}

/// Check (without mutating) whether `session` may transition to `to`.
pub fn check_transition(session: &Session, to: SessionStatus) -> Result<(), SessionError> {
    if transition_allowed(session.status, to) {
        Ok(())
    } else {
        Err(SessionError::InvalidTransition(format!(
            "{} -> {}",
            session.status.as_str(),
            to.as_str()
        )))
    }
}

/// `accept`: actor becomes (or must match) the counterparty.
pub fn check_accept(session: &Session, actor_agent_id: &str) -> Result<(), SessionError> {
    check_transition(session, SessionStatus::Accepted)?;
    if actor_agent_id == session.proposer_agent_id {
        return Err(SessionError::ProposerCannotAcceptOwnSession);
    }
    if let Some(bound) = &session.counterparty_agent_id {
        if bound != actor_agent_id {
            return Err(SessionError::AgentIdConflict);
        }
    }
    Ok(())
}

/// `create`: actor must equal the declared proposer unless privileged.
pub fn check_create(proposer_agent_id: &str, actor_agent_id: &str, role: CallerRole) -> Result<(), SessionError> {
    if role == CallerRole::Privileged || proposer_agent_id == actor_agent_id {
        Ok(())
    } else {
        Err(SessionError::ScopeViolation)
    }
}

/// `prepare` / `negotiate` / `settle` / `adjudicate`: actor must be a
/// session participant unless privileged.
pub fn check_participant(session: &Session, actor_agent_id: &str, role: CallerRole) -> Result<(), SessionError> {
    if role == CallerRole::Privileged || session.is_participant(actor_agent_id) {
        Ok(())
    } else {
        Err(SessionError::ScopeViolation)
    }
}

/// `private-inputs`: additionally requires the uploaded-for agent id to
/// equal the actor.
pub fn check_private_inputs(
    session: &Session,
    actor_agent_id: &str,
    target_agent_id: &str,
    role: CallerRole,
) -> Result<(), SessionError> {
    check_participant(session, actor_agent_id, role)?;
    if target_agent_id != actor_agent_id {
        return Err(SessionError::ScopeViolation);
    }
    Ok(())
}

/// `start`: requires the session to currently be `prepared`; `accepted`
/// or `created` produce the more specific `prepare_required_before_start`.
pub fn check_start_precondition(session: &Session) -> Result<(), SessionError> {
    match session.status {
        SessionStatus::Prepared => Ok(()),
        SessionStatus::Accepted | SessionStatus::Created => {
            Err(SessionError::PrepareRequiredBeforeStart)
        }
        _ => Err(SessionError::InvalidTransition(format!(
            "{} -> active",
            session.status.as_str()
        ))),
    }
}

pub fn apply_transition(mut session: Session, to: SessionStatus) -> Session {
    session.status = to;
    session.updated_at = crate::models::now();
    session
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn session(status: SessionStatus) -> Session {
        Session {
            id: "s1".to_string(),
            topic: "t".to_string(),
            status,
            proposer_agent_id: "agent-a".to_string(),
            counterparty_agent_id: Some("agent-b".to_string()),
            terms: json!({}),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn allowed_transitions_pass() {
        assert!(check_transition(&session(SessionStatus::Created), SessionStatus::Accepted).is_ok());
        assert!(check_transition(&session(SessionStatus::Active), SessionStatus::Agreed).is_ok());
    }

    #[test]
    fn skipping_states_is_rejected() {
        let result = check_transition(&session(SessionStatus::Created), SessionStatus::Active);
        assert!(matches!(result, Err(SessionError::InvalidTransition(_))));
    }

    #[test]
    fn proposer_cannot_accept_own_session() {
        let result = check_accept(&session(SessionStatus::Created), "agent-a");
        assert!(matches!(result, Err(SessionError::ProposerCannotAcceptOwnSession)));
    }

    #[test]
    fn start_from_accepted_requires_prepare_first() {
        let result = check_start_precondition(&session(SessionStatus::Accepted));
        assert!(matches!(result, Err(SessionError::PrepareRequiredBeforeStart)));
    }

    #[test]
    fn private_inputs_requires_target_equals_actor() {
        let result = check_private_inputs(&session(SessionStatus::Active), "agent-a", "agent-b", CallerRole::Agent);
        assert!(matches!(result, Err(SessionError::ScopeViolation)));
    }
}
