//! Trust aggregation across terminal sessions (§4.K).

use std::collections::HashMap;

use serde::Serialize;

use crate::models::SessionStatus;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrustCounts {
    pub agreements: i64,
    pub no_agreements: i64,
    pub failures: i64,
}

impl TrustCounts {
    /// Fold one trusted session's outcome into running per-agent counts.
    /// (Resolves the spec's duplicate `counts()` overload as a single
    /// accumulation function — see DESIGN.md.)
    pub fn fold(mut self, status: SessionStatus) -> Self {
        match status {
            SessionStatus::Agreed => self.agreements += 1,
            SessionStatus::NoAgreement => self.no_agreements += 1,
            SessionStatus::Failed => self.failures += 1,
            _ => {}
        }
        self
    }

    pub fn score(&self) -> i64 {
        3 * self.agreements + self.no_agreements - 2 * self.failures
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TrustEntry {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "trustScore")]
    pub trust_score: i64,
    pub agreements: i64,
    #[serde(rename = "noAgreements")]
    pub no_agreements: i64,
    pub failures: i64,
}

/// A terminal session's outcome as input to the aggregator: its final
/// status, its participants, and whether its attestation re-verifies.
pub struct TrustInput<'a> {
    pub status: SessionStatus,
    pub participants: &'a [String],
    pub attestation_trusted: bool,
}

/// Aggregate per-agent trust counts across all terminal sessions whose
/// attestation re-verifies, sorted by score desc, agreements desc, agent
/// id asc.
pub fn aggregate(sessions: &[TrustInput<'_>]) -> Vec<TrustEntry> {
    let mut counts: HashMap<String, TrustCounts> = HashMap::new();

    for session in sessions {
        if !session.attestation_trusted {
            continue;
        }
        for agent_id in session.participants {
            let entry = counts.entry(agent_id.clone()).or_default();
            *entry = entry.fold(session.status);
        }
    }

    let mut entries: Vec<TrustEntry> = counts
        .into_iter()
        .map(|(agent_id, c)| TrustEntry {
            agent_id,
            trust_score: c.score(),
            agreements: c.agreements,
            no_agreements: c.no_agreements,
            failures: c.failures,
        })
        .collect();

    entries.sort_by(|a, b| {
        b.trust_score
            .cmp(&a.trust_score)
            .then(b.agreements.cmp(&a.agreements))
            .then(a.agent_id.cmp(&b.agent_id))
    });

    entries
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn untrusted_sessions_are_excluded() {
        let participants = vec!["a".to_string()];
        let sessions = vec![TrustInput {
            status: SessionStatus::Agreed,
            participants: &participants,
            attestation_trusted: false,
        }];
        assert!(aggregate(&sessions).is_empty());
    }

    #[test]
    fn score_weights_outcomes_correctly() {
        let participants = vec!["a".to_string()];
        let sessions = vec![
            TrustInput { status: SessionStatus::Agreed, participants: &participants, attestation_trusted: true },
            TrustInput { status: SessionStatus::NoAgreement, participants: &participants, attestation_trusted: true },
            TrustInput { status: SessionStatus::Failed, participants: &participants, attestation_trusted: true },
        ];
        let result = aggregate(&sessions);
        assert_eq!(result.len(), 1);
        // 3*1 + 1 - 2*1 = 2
        assert_eq!(result[0].trust_score, 2);
    }

    #[test]
    fn sorted_by_score_then_agreements_then_id() {
        let p_a = vec!["a".to_string()];
        let p_b = vec!["b".to_string()];
        let sessions = vec![
            TrustInput { status: SessionStatus::Agreed, participants: &p_b, attestation_trusted: true },
            TrustInput { status: SessionStatus::Failed, participants: &p_a, attestation_trusted: true },
        ];
        let result = aggregate(&sessions);
        assert_eq!(result[0].agent_id, "b");
        assert_eq!(result[1].agent_id, "a");
    }
}
