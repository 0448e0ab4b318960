//! `/leaderboard/trusted`.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::attestation;
use crate::error::ApiError;
use crate::http::{AppState, Actor, Role};
use crate::trust::{self, TrustInput};

pub async fn leaderboard(State(state): State<Arc<AppState>>, actor: Actor) -> Result<Json<Value>, ApiError> {
    actor.require(Role::Readonly)?;
    let sessions = state.store.list_sessions_terminal().await?;

    let mut inputs_owned = Vec::with_capacity(sessions.len());
    for session in &sessions {
        let turns = state.store.list_turns(&session.id).await?;
        let attestation_trusted = match state.store.get_attestation(&session.id).await? {
            Some(att) => attestation::verify(&att, session, &turns, None).is_empty(),
            None => false,
        };
        let participants: Vec<String> = session.participants().into_iter().map(String::from).collect();
        inputs_owned.push((session.status, participants, attestation_trusted));
    }

    let inputs: Vec<TrustInput> = inputs_owned
        .iter()
        .map(|(status, participants, trusted)| TrustInput {
            status: *status,
            participants,
            attestation_trusted: *trusted,
        })
        .collect();

    let entries = trust::aggregate(&inputs);
    Ok(Json(json!({ "ok": true, "leaderboard": entries })))
}
