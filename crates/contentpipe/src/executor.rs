//! Job executor contract, the per-worker registry, and the job catalog.
//!
//! Executors are pure adapters: everything they need arrives in the claimed
//! job's payload and through the gateway they were constructed with. They
//! must be idempotent and re-entrant from scratch, because delivery is
//! at-least-once and a checkpoint may be lost between attempts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::gateway::GatewayError;
use crate::models::FailureKind;
use crate::repository::{IntentRepository, StoreError};

/// Declared-schema violation reported by [`JobExecutor::validate_payload`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PayloadError(pub String);

/// Executor failure with the classification the retry policy consumes.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Worth retrying later (transport trouble, contention, lost lease).
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help (bad payload, missing source, impossible decode).
    #[error("{0}")]
    Permanent(String),
}

impl ExecutionError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transient(_) => FailureKind::Transient,
            Self::Permanent(_) => FailureKind::Permanent,
        }
    }
}

impl From<GatewayError> for ExecutionError {
    fn from(e: GatewayError) -> Self {
        match e.failure_kind() {
            FailureKind::Transient => Self::Transient(e.to_string()),
            FailureKind::Permanent => Self::Permanent(e.to_string()),
        }
    }
}

/// Opaque success output recorded on the intent.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub result: Vec<u8>,
}

impl ExecutionOutput {
    pub fn from_bytes(result: Vec<u8>) -> Self {
        Self { result }
    }
}

/// The slice of an intent an executor is allowed to see.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub intent_id: String,
    pub name: String,
    pub payload: Vec<u8>,
    /// 1-based attempt number of this execution.
    pub attempt_count: u32,
    pub max_attempts: u32,
}

/// Per-execution capabilities handed to an executor.
///
/// Checkpointing is advisory: the engine persists the latest blob so a
/// reclaim after lease expiry can resume, but executors must tolerate the
/// checkpoint being gone.
#[derive(Clone)]
pub struct ExecutionContext {
    intent_id: String,
    repo: IntentRepository,
    cancel: CancellationToken,
    resume: Option<Arc<Vec<u8>>>,
    clock: Arc<dyn Clock>,
}

impl ExecutionContext {
    pub fn new(
        intent_id: String,
        repo: IntentRepository,
        cancel: CancellationToken,
        resume: Option<Vec<u8>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            intent_id,
            repo,
            cancel,
            resume: resume.map(Arc::new),
            clock,
        }
    }

    /// Token raised on shutdown, lease loss, or deadline expiry. Long-running
    /// executors must watch it and stop within a bounded time.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Checkpoint blob saved by a previous attempt, if it survived.
    pub fn resume_checkpoint(&self) -> Option<&[u8]> {
        self.resume.as_deref().map(Vec::as_slice)
    }

    /// Persist an intermediate checkpoint (latest wins).
    pub async fn checkpoint(&self, data: &[u8]) -> Result<(), StoreError> {
        self.repo
            .save_checkpoint(&self.intent_id, data, self.clock.now())
            .await
    }
}

/// One job type's implementation.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Job name this executor serves (e.g. `thumbnail.v1`).
    fn job_name(&self) -> &str;

    /// Check the payload against the executor's declared input schema.
    /// The dispatcher enforces this before `execute`; a violation deadletters
    /// the intent without burning retries.
    fn validate_payload(&self, payload: &[u8]) -> Result<(), PayloadError>;

    /// Run the job. Must be idempotent per `(parent, type, version)` and
    /// should short-circuit via the gateway's `has` probe when the artifact
    /// already exists.
    async fn execute(
        &self,
        job: &ClaimedJob,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError>;

    /// Wall-clock bound for one attempt; `None` defers to configuration.
    fn soft_deadline(&self) -> Option<Duration> {
        None
    }
}

/// Executors known to this worker, keyed by job name.
///
/// Populated before the dispatcher starts polling; never mutated afterwards.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its declared job name. Last one wins.
    pub fn register(&mut self, executor: Arc<dyn JobExecutor>) {
        self.executors
            .insert(executor.job_name().to_string(), executor);
    }

    pub fn get(&self, job_name: &str) -> Option<Arc<dyn JobExecutor>> {
        self.executors.get(job_name).cloned()
    }

    /// Registered job names, sorted for deterministic claim predicates.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// Globally-known job names and the derivation types each one produces.
///
/// Submission validation checks requested versions against this catalog;
/// it intentionally also lists jobs executed by out-of-process workers.
#[derive(Debug, Clone, Default)]
pub struct JobCatalog {
    jobs: BTreeMap<String, Vec<String>>,
}

impl JobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pipeline's stock jobs.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register("thumbnail.v1", &["thumbnail"]);
        catalog.register("ocr.v1", &["ocr_text"]);
        catalog.register("object_detection.v1", &["object_detections"]);
        catalog
    }

    pub fn register(&mut self, job_name: &str, derivation_types: &[&str]) {
        self.jobs.insert(
            job_name.to_string(),
            derivation_types.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn contains(&self, job_name: &str) -> bool {
        self.jobs.contains_key(job_name)
    }

    /// Derivation types produced by a job, if the job is known.
    pub fn derived_types(&self, job_name: &str) -> Option<&[String]> {
        self.jobs.get(job_name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}
