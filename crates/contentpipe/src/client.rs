//! Client API: submission and status for applications.
//!
//! Submission validates the request, bumps the dedupe ledger, and inserts
//! the intent with `run_after = now`; it never waits on execution. Status
//! reads map the internal state machine onto the external vocabulary.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::clock::Clock;
use crate::executor::JobCatalog;
use crate::metrics;
use crate::models::{Intent, IntentStatus, NewIntent, ProcessRequest, RunStatus};
use crate::repository::{DedupeLedger, IntentRepository, StoreError};

/// Errors surfaced by the client API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("intent store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Response to a successful submission.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubmitReceipt {
    pub run_id: String,
    pub dedupe_seen_count: i64,
}

/// Per-status intent counts.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub claimed: i64,
    /// Awaiting-retry intents (failed, not yet terminal).
    pub retrying: i64,
    pub succeeded: i64,
    pub deadletter: i64,
}

/// Thin submission/status surface over the intent store.
#[derive(Clone)]
pub struct PipelineClient {
    intents: IntentRepository,
    dedupe: DedupeLedger,
    catalog: Arc<JobCatalog>,
    queue: String,
    max_attempts_default: u32,
    clock: Arc<dyn Clock>,
}

impl PipelineClient {
    pub(crate) fn new(
        intents: IntentRepository,
        dedupe: DedupeLedger,
        catalog: Arc<JobCatalog>,
        queue: String,
        max_attempts_default: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            intents,
            dedupe,
            catalog,
            queue,
            max_attempts_default,
            clock,
        }
    }

    /// Validate and enqueue a processing request. Returns immediately.
    pub async fn submit(&self, request: ProcessRequest) -> Result<SubmitReceipt, ClientError> {
        self.validate(&request)?;
        let now = self.clock.now();

        // The ledger is observability-only; losing it must not block work.
        let dedupe_seen_count = match self
            .dedupe
            .record(&request.content_id, &request.job, now)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(content_id = %request.content_id, error = %e,
                    "dedupe ledger unavailable; continuing");
                0
            }
        };

        let payload = wire::JobPayload::from_request(&request).encode();
        let intent = self
            .intents
            .insert(
                NewIntent {
                    queue: self.queue.clone(),
                    name: request.job.clone(),
                    payload,
                    max_attempts: self.max_attempts_default,
                    run_after: now,
                },
                now,
            )
            .await?;

        metrics::record_submission(&request.job);
        Ok(SubmitReceipt {
            run_id: intent.id,
            dedupe_seen_count,
        })
    }

    /// Read the externally-visible status of a run.
    pub async fn status(&self, run_id: &str) -> Result<RunStatus, ClientError> {
        let intent = self
            .intents
            .get(run_id)
            .await?
            .ok_or_else(|| ClientError::NotFound(run_id.to_string()))?;
        Ok(RunStatus::from_intent(&intent))
    }

    /// Operator read: intents in a given engine status, oldest first.
    pub async fn list_by_status(
        &self,
        status: IntentStatus,
        limit: u32,
    ) -> Result<Vec<Intent>, ClientError> {
        Ok(self.intents.list_by_status(status, limit).await?)
    }

    /// Per-status intent counts, for dashboards and alerting.
    pub async fn queue_stats(&self) -> Result<QueueStats, ClientError> {
        Ok(QueueStats {
            pending: self.intents.count_status(IntentStatus::Pending).await?,
            claimed: self.intents.count_status(IntentStatus::Claimed).await?,
            retrying: self.intents.count_status(IntentStatus::Failed).await?,
            succeeded: self.intents.count_status(IntentStatus::Succeeded).await?,
            deadletter: self.intents.count_status(IntentStatus::Deadletter).await?,
        })
    }

    fn validate(&self, request: &ProcessRequest) -> Result<(), ClientError> {
        if request.content_id.is_empty() {
            return Err(ClientError::InvalidArgument(
                "content_id is required".to_string(),
            ));
        }
        let Some(derived_types) = self.catalog.derived_types(&request.job) else {
            return Err(ClientError::InvalidArgument(format!(
                "unknown job: {}",
                request.job
            )));
        };
        for derivation_type in derived_types {
            match request.versions.get(derivation_type) {
                None => {
                    return Err(ClientError::InvalidArgument(format!(
                        "versions[{derivation_type}] is required for job {}",
                        request.job
                    )));
                }
                Some(v) if *v < 1 => {
                    return Err(ClientError::InvalidArgument(format!(
                        "versions[{derivation_type}] must be a positive integer, got {v}"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

pub mod wire {
    //! Payload convention shared by the bundled client and executors.
    //!
    //! This is an adapter-level agreement, not an engine contract: the
    //! intent store and dispatcher treat payloads as opaque bytes, and
    //! third-party submitters may encode theirs however their executors
    //! expect.

    use std::collections::BTreeMap;

    use serde::{Deserialize, Serialize};

    use crate::models::ProcessRequest;

    /// JSON payload the bundled executors consume.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct JobPayload {
        pub content_id: String,
        #[serde(default)]
        pub versions: BTreeMap<String, i64>,
        #[serde(default)]
        pub metadata: BTreeMap<String, String>,
    }

    impl JobPayload {
        pub fn from_request(request: &ProcessRequest) -> Self {
            Self {
                content_id: request.content_id.clone(),
                versions: request.versions.clone(),
                metadata: request.metadata.clone(),
            }
        }

        pub fn encode(&self) -> Vec<u8> {
            // BTreeMaps and string keys only: this cannot fail.
            serde_json::to_vec(self).unwrap_or_default()
        }

        pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
            serde_json::from_slice(payload)
        }

        /// Requested version for a derivation type.
        pub fn version_for(&self, derivation_type: &str) -> Option<i64> {
            self.versions.get(derivation_type).copied()
        }
    }
}
