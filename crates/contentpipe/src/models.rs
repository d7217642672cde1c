//! Engine domain models: intents, statuses, and the submission shapes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum stored length of `last_error`, in bytes.
pub const MAX_ERROR_LEN: usize = 512;

/// State machine of a durable work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Waiting for a worker; eligible once `run_after` passes.
    Pending,
    /// Leased to a worker until `claim_expires_at`.
    Claimed,
    /// Terminal success.
    Succeeded,
    /// Last attempt failed; awaiting the retry scheduled at `run_after`.
    Failed,
    /// Terminal failure: retries exhausted or a permanent error reported.
    Deadletter,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Deadletter => "deadletter",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "deadletter" => Some(Self::Deadletter),
            _ => None,
        }
    }

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Deadletter)
    }
}

/// How the engine classifies a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth retrying: transport errors, contention, lost leases.
    Transient,
    /// Never retried: schema violations, missing sources, unknown jobs.
    Permanent,
}

/// A durable work item.
#[derive(Debug, Clone)]
pub struct Intent {
    /// Opaque id, returned to the submitter as the run id.
    pub id: String,
    /// Logical queue partition.
    pub queue: String,
    /// Job type, routes to an executor (e.g. `thumbnail.v1`).
    pub name: String,
    /// Executor-defined bytes; the engine never interprets them.
    pub payload: Vec<u8>,
    pub status: IntentStatus,
    /// Claims observed so far; incremented by every claim.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Earliest instant the intent is eligible for a claim.
    pub run_after: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Executor-supplied success output.
    pub result: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for inserting a new intent.
#[derive(Debug, Clone)]
pub struct NewIntent {
    pub queue: String,
    pub name: String,
    pub payload: Vec<u8>,
    pub max_attempts: u32,
    pub run_after: DateTime<Utc>,
}

/// Submission request accepted by the client API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub content_id: String,
    /// Globally-known job name (e.g. `thumbnail.v1`).
    pub job: String,
    /// Derivation type → positive artifact version.
    #[serde(default)]
    pub versions: BTreeMap<String, i64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// External vocabulary for run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Queued or waiting out a retry backoff.
    Pending,
    /// A worker currently holds the lease.
    Running,
    Succeeded,
    /// Deadlettered; retries are over.
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Status view returned to submitters.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: String,
    pub state: RunState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Raw executor output; adapters decide the encoding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunStatus {
    /// Map an intent onto the external vocabulary.
    ///
    /// Awaiting-retry reads as `pending` (the run is not over), deadletter as
    /// `failed`.
    pub fn from_intent(intent: &Intent) -> Self {
        let state = match intent.status {
            IntentStatus::Pending | IntentStatus::Failed => RunState::Pending,
            IntentStatus::Claimed => RunState::Running,
            IntentStatus::Succeeded => RunState::Succeeded,
            IntentStatus::Deadletter => RunState::Failed,
        };
        let finished_at = intent.status.is_terminal().then_some(intent.updated_at);
        Self {
            run_id: intent.id.clone(),
            state,
            attempt_count: intent.attempt_count,
            max_attempts: intent.max_attempts,
            started_at: intent.created_at,
            finished_at,
            result: intent.result.clone(),
            error: intent.last_error.clone(),
        }
    }
}

/// Truncate an error message to the stored bound, on a char boundary.
pub fn truncate_error(msg: &str) -> String {
    if msg.len() <= MAX_ERROR_LEN {
        return msg.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn intent_with_status(status: IntentStatus) -> Intent {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Intent {
            id: "run-1".into(),
            queue: "default".into(),
            name: "thumbnail.v1".into(),
            payload: Vec::new(),
            status,
            attempt_count: 1,
            max_attempts: 5,
            run_after: t,
            claimed_by: None,
            claim_expires_at: None,
            last_error: None,
            result: None,
            created_at: t,
            updated_at: t,
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            IntentStatus::Pending,
            IntentStatus::Claimed,
            IntentStatus::Succeeded,
            IntentStatus::Failed,
            IntentStatus::Deadletter,
        ] {
            assert_eq!(IntentStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(IntentStatus::from_str("bogus"), None);
    }

    #[test]
    fn external_state_mapping() {
        let cases = [
            (IntentStatus::Pending, RunState::Pending),
            (IntentStatus::Failed, RunState::Pending),
            (IntentStatus::Claimed, RunState::Running),
            (IntentStatus::Succeeded, RunState::Succeeded),
            (IntentStatus::Deadletter, RunState::Failed),
        ];
        for (status, expected) in cases {
            let view = RunStatus::from_intent(&intent_with_status(status));
            assert_eq!(view.state, expected, "{status:?}");
        }
    }

    #[test]
    fn finished_at_only_on_terminal_states() {
        assert!(RunStatus::from_intent(&intent_with_status(IntentStatus::Succeeded))
            .finished_at
            .is_some());
        assert!(RunStatus::from_intent(&intent_with_status(IntentStatus::Failed))
            .finished_at
            .is_none());
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        let long = "é".repeat(600);
        let truncated = truncate_error(&long);
        assert!(truncated.len() <= MAX_ERROR_LEN);
        assert!(long.starts_with(&truncated));
    }
}
