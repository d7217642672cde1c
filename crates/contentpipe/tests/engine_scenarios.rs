//! End-to-end scenarios: real workers polling a SQLite intent store,
//! scripted executors, and an in-memory content gateway.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use contentpipe::client::wire::JobPayload;
use contentpipe::clock::{Clock, SystemClock};
use contentpipe::gateway::{ContentStream, GatewayError};
use contentpipe::models::RunState;
use contentpipe::{
    ClaimedJob, ContentGateway, Engine, EngineSettings, ExecutionContext, ExecutionError,
    ExecutionOutput, ExecutorRegistry, JobExecutor, PayloadError, PipelineClient, ProcessRequest,
};

/// In-memory content store that counts artifact writes.
#[derive(Default)]
struct MemoryGateway {
    sources: Mutex<HashMap<String, Vec<u8>>>,
    derived: Mutex<HashMap<(String, String, i64), Vec<u8>>>,
    put_calls: AtomicUsize,
}

impl MemoryGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add_source(&self, id: &str, bytes: &[u8]) {
        self.sources
            .lock()
            .unwrap()
            .insert(id.to_string(), bytes.to_vec());
    }

    fn put_count(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    fn derived_bytes(&self, parent: &str, derivation_type: &str, version: i64) -> Option<Vec<u8>> {
        self.derived
            .lock()
            .unwrap()
            .get(&(parent.to_string(), derivation_type.to_string(), version))
            .cloned()
    }
}

#[async_trait]
impl ContentGateway for MemoryGateway {
    async fn exists(&self, parent_id: &str) -> Result<bool, GatewayError> {
        Ok(self.sources.lock().unwrap().contains_key(parent_id))
    }

    async fn read(&self, parent_id: &str) -> Result<ContentStream, GatewayError> {
        let bytes = self
            .sources
            .lock()
            .unwrap()
            .get(parent_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(parent_id.to_string()))?;
        Ok(Box::pin(std::io::Cursor::new(bytes)))
    }

    async fn has(
        &self,
        parent_id: &str,
        derivation_type: &str,
        version: i64,
    ) -> Result<bool, GatewayError> {
        Ok(self.derived.lock().unwrap().contains_key(&(
            parent_id.to_string(),
            derivation_type.to_string(),
            version,
        )))
    }

    async fn put(
        &self,
        parent_id: &str,
        derivation_type: &str,
        version: i64,
        bytes: Vec<u8>,
        _meta: &BTreeMap<String, String>,
    ) -> Result<String, GatewayError> {
        let key = (
            parent_id.to_string(),
            derivation_type.to_string(),
            version,
        );
        let derived_id = format!("{parent_id}/{derivation_type}_v{version}");
        let mut derived = self.derived.lock().unwrap();
        if let Some(existing) = derived.get(&key) {
            if *existing == bytes {
                return Ok(derived_id);
            }
            return Err(GatewayError::Conflict(derived_id));
        }
        derived.insert(key, bytes);
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        Ok(derived_id)
    }
}

/// Deterministic derive-and-store executor with the skip-if-present probe.
struct StubExecutor {
    job: &'static str,
    derived_type: &'static str,
    gateway: Arc<MemoryGateway>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl StubExecutor {
    fn new(job: &'static str, derived_type: &'static str, gateway: Arc<MemoryGateway>) -> Self {
        Self {
            job,
            derived_type,
            gateway,
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn executed_content_ids(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.executed)
    }
}

#[async_trait]
impl JobExecutor for StubExecutor {
    fn job_name(&self) -> &str {
        self.job
    }

    fn validate_payload(&self, payload: &[u8]) -> Result<(), PayloadError> {
        let payload = JobPayload::decode(payload).map_err(|e| PayloadError(e.to_string()))?;
        if payload.content_id.is_empty() {
            return Err(PayloadError("content_id is required".to_string()));
        }
        match payload.version_for(self.derived_type) {
            Some(v) if v >= 1 => Ok(()),
            Some(v) => Err(PayloadError(format!("invalid version: {v}"))),
            None => Err(PayloadError(format!(
                "versions[{}] is required",
                self.derived_type
            ))),
        }
    }

    async fn execute(
        &self,
        job: &ClaimedJob,
        _ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let payload = JobPayload::decode(&job.payload)
            .map_err(|e| ExecutionError::permanent(e.to_string()))?;
        let version = payload
            .version_for(self.derived_type)
            .ok_or_else(|| ExecutionError::permanent("version missing"))?;
        self.executed
            .lock()
            .unwrap()
            .push(payload.content_id.clone());

        if self
            .gateway
            .has(&payload.content_id, self.derived_type, version)
            .await?
        {
            let body = serde_json::json!({ "ok": true, "skipped": true });
            return Ok(ExecutionOutput::from_bytes(body.to_string().into_bytes()));
        }

        if !self.gateway.exists(&payload.content_id).await? {
            return Err(ExecutionError::permanent(format!(
                "source content not found: {}",
                payload.content_id
            )));
        }

        // Deterministic derivation so a replay writes identical bytes.
        let source = self.gateway.read_bytes(&payload.content_id).await?;
        let artifact = source.to_ascii_uppercase();
        let derived_id = self
            .gateway
            .put(
                &payload.content_id,
                self.derived_type,
                version,
                artifact,
                &BTreeMap::new(),
            )
            .await?;

        let body = serde_json::json!({ "ok": true, "derived_id": derived_id });
        Ok(ExecutionOutput::from_bytes(body.to_string().into_bytes()))
    }
}

/// Executor that always fails with the configured classification.
struct FailingExecutor {
    job: &'static str,
    permanent: bool,
}

#[async_trait]
impl JobExecutor for FailingExecutor {
    fn job_name(&self) -> &str {
        self.job
    }

    fn validate_payload(&self, _payload: &[u8]) -> Result<(), PayloadError> {
        Ok(())
    }

    async fn execute(
        &self,
        job: &ClaimedJob,
        _ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError> {
        if self.permanent {
            Err(ExecutionError::permanent(format!(
                "permanent failure on attempt {}",
                job.attempt_count
            )))
        } else {
            Err(ExecutionError::transient(format!(
                "transient failure on attempt {}",
                job.attempt_count
            )))
        }
    }
}

fn fast_settings(dir: &std::path::Path, name: &str) -> EngineSettings {
    let mut settings =
        EngineSettings::with_database_url(dir.join("pipeline.db").display().to_string());
    settings.worker_id = name.to_string();
    settings.poll_interval = Duration::from_millis(25);
    settings.lease_ttl = Duration::from_secs(5);
    settings.max_in_flight = 1;
    settings.retry_base = Duration::from_millis(40);
    settings.retry_cap = Duration::from_secs(2);
    settings
}

fn thumbnail_request(content_id: &str) -> ProcessRequest {
    ProcessRequest {
        content_id: content_id.to_string(),
        job: "thumbnail.v1".to_string(),
        versions: BTreeMap::from([("thumbnail".to_string(), 1)]),
        metadata: BTreeMap::from([
            ("width".to_string(), "300".to_string()),
            ("height".to_string(), "300".to_string()),
        ]),
    }
}

fn ocr_request(content_id: &str) -> ProcessRequest {
    ProcessRequest {
        content_id: content_id.to_string(),
        job: "ocr.v1".to_string(),
        versions: BTreeMap::from([("ocr_text".to_string(), 1)]),
        metadata: BTreeMap::new(),
    }
}

/// Poll status until the run reaches `expected` or the timeout passes.
async fn wait_for_state(
    client: &PipelineClient,
    run_id: &str,
    expected: RunState,
    timeout: Duration,
) -> contentpipe::RunStatus {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let status = client.status(run_id).await.expect("status read");
        if status.state == expected {
            return status;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "run {run_id} stuck in {:?} (wanted {:?}); error={:?}",
            status.state,
            expected,
            status.error
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// Happy path: pending, claimed, succeeded, with exactly one artifact put.
#[tokio::test]
async fn happy_path_produces_one_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = MemoryGateway::new();
    gateway.add_source("C1", b"source image bytes");

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(StubExecutor::new(
        "thumbnail.v1",
        "thumbnail",
        Arc::clone(&gateway),
    )));

    let mut engine = Engine::connect(fast_settings(dir.path(), "s1"), registry)
        .await
        .unwrap();
    let client = engine.client();
    engine.spawn_workers(1);

    let receipt = client.submit(thumbnail_request("C1")).await.unwrap();
    assert_eq!(receipt.dedupe_seen_count, 1);

    let status = wait_for_state(
        &client,
        &receipt.run_id,
        RunState::Succeeded,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(status.attempt_count, 1);
    assert_eq!(gateway.put_count(), 1);
    assert_eq!(
        gateway.derived_bytes("C1", "thumbnail", 1).unwrap(),
        b"SOURCE IMAGE BYTES"
    );
    let result: serde_json::Value = serde_json::from_slice(&status.result.unwrap()).unwrap();
    assert_eq!(result["ok"], true);

    engine.shutdown(Duration::from_secs(5)).await;
}

// Duplicate submission: two run ids, seen counts 1 and 2, a single put.
#[tokio::test]
async fn duplicate_submission_hits_skip_if_present() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = MemoryGateway::new();
    gateway.add_source("C1", b"bytes");

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(StubExecutor::new(
        "thumbnail.v1",
        "thumbnail",
        Arc::clone(&gateway),
    )));

    // One worker, one slot: the runs execute serially.
    let mut engine = Engine::connect(fast_settings(dir.path(), "s2"), registry)
        .await
        .unwrap();
    let client = engine.client();
    engine.spawn_workers(1);

    let first = client.submit(thumbnail_request("C1")).await.unwrap();
    let second = client.submit(thumbnail_request("C1")).await.unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.dedupe_seen_count, 1);
    assert_eq!(second.dedupe_seen_count, 2);

    wait_for_state(&client, &first.run_id, RunState::Succeeded, Duration::from_secs(5)).await;
    let second_status = wait_for_state(
        &client,
        &second.run_id,
        RunState::Succeeded,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(gateway.put_count(), 1);
    let result: serde_json::Value =
        serde_json::from_slice(&second_status.result.unwrap()).unwrap();
    assert_eq!(result["skipped"], true);

    engine.shutdown(Duration::from_secs(5)).await;
}

// Worker crash mid-execution: the lease expires, a live worker reclaims,
// and the replay writes identical bytes before succeeding.
#[tokio::test]
async fn crashed_worker_is_recovered_by_lease_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = MemoryGateway::new();
    gateway.add_source("C1", b"bytes");

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(StubExecutor::new(
        "thumbnail.v1",
        "thumbnail",
        Arc::clone(&gateway),
    )));

    let mut engine = Engine::connect(fast_settings(dir.path(), "s3"), registry)
        .await
        .unwrap();
    let client = engine.client();
    let repo = engine.db().intents();

    let receipt = client.submit(thumbnail_request("C1")).await.unwrap();

    // A "worker" claims the intent with a short lease and dies without
    // completing or failing it.
    let ghost_claim = repo
        .claim_one(
            "ghost-w0",
            &["thumbnail.v1".to_string()],
            "default",
            Duration::from_millis(300),
            SystemClock.now(),
        )
        .await
        .unwrap()
        .expect("ghost claim");
    assert_eq!(ghost_claim.id, receipt.run_id);
    assert_eq!(ghost_claim.attempt_count, 1);

    // A healthy worker pool takes over once the lease lapses.
    engine.spawn_workers(1);
    let status = wait_for_state(
        &client,
        &receipt.run_id,
        RunState::Succeeded,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(status.attempt_count, 2);
    assert_eq!(gateway.put_count(), 1);
    assert_eq!(
        gateway.derived_bytes("C1", "thumbnail", 1).unwrap(),
        b"BYTES"
    );

    engine.shutdown(Duration::from_secs(5)).await;
}

// A permanent failure deadletters on the first attempt.
#[tokio::test]
async fn permanent_failure_deadletters_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = MemoryGateway::new();
    // "MISSING" is never seeded as a source.

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(StubExecutor::new(
        "thumbnail.v1",
        "thumbnail",
        Arc::clone(&gateway),
    )));

    let mut engine = Engine::connect(fast_settings(dir.path(), "s4"), registry)
        .await
        .unwrap();
    let client = engine.client();
    engine.spawn_workers(1);

    let receipt = client.submit(thumbnail_request("MISSING")).await.unwrap();
    let status = wait_for_state(
        &client,
        &receipt.run_id,
        RunState::Failed,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(status.attempt_count, 1);
    assert!(status.error.unwrap().contains("not found"));
    assert_eq!(gateway.put_count(), 0);

    engine.shutdown(Duration::from_secs(5)).await;
}

// Transient failures exhaust max_attempts, then deadletter with the
// most recent error visible.
#[tokio::test]
async fn transient_failures_exhaust_retries() {
    let dir = tempfile::tempdir().unwrap();

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(FailingExecutor {
        job: "thumbnail.v1",
        permanent: false,
    }));

    let mut settings = fast_settings(dir.path(), "s5");
    settings.max_attempts_default = 3;
    let mut engine = Engine::connect(settings, registry).await.unwrap();
    let client = engine.client();
    engine.spawn_workers(1);

    let receipt = client.submit(thumbnail_request("C1")).await.unwrap();
    let status = wait_for_state(
        &client,
        &receipt.run_id,
        RunState::Failed,
        Duration::from_secs(10),
    )
    .await;

    assert_eq!(status.attempt_count, 3);
    assert_eq!(status.max_attempts, 3);
    assert_eq!(
        status.error.as_deref(),
        Some("transient failure on attempt 3")
    );

    engine.shutdown(Duration::from_secs(5)).await;
}

// Job-name partitioning: each worker pool claims only what it supports.
#[tokio::test]
async fn workers_only_claim_supported_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = MemoryGateway::new();
    gateway.add_source("C1", b"image");
    gateway.add_source("C2", b"scan");

    let thumb_executor = StubExecutor::new("thumbnail.v1", "thumbnail", Arc::clone(&gateway));
    let thumb_log = thumb_executor.executed_content_ids();
    let ocr_executor = StubExecutor::new("ocr.v1", "ocr_text", Arc::clone(&gateway));
    let ocr_log = ocr_executor.executed_content_ids();

    let mut registry_a = ExecutorRegistry::new();
    registry_a.register(Arc::new(thumb_executor));
    let mut registry_b = ExecutorRegistry::new();
    registry_b.register(Arc::new(ocr_executor));

    // Two engines over the same store, as two processes would be.
    let mut engine_a = Engine::connect(fast_settings(dir.path(), "pool-a"), registry_a)
        .await
        .unwrap();
    let mut engine_b = Engine::connect(fast_settings(dir.path(), "pool-b"), registry_b)
        .await
        .unwrap();
    let client = engine_a.client();
    engine_a.spawn_workers(1);
    engine_b.spawn_workers(1);

    let thumb = client.submit(thumbnail_request("C1")).await.unwrap();
    let ocr = client.submit(ocr_request("C2")).await.unwrap();

    wait_for_state(&client, &thumb.run_id, RunState::Succeeded, Duration::from_secs(5)).await;
    wait_for_state(&client, &ocr.run_id, RunState::Succeeded, Duration::from_secs(5)).await;

    assert_eq!(*thumb_log.lock().unwrap(), vec!["C1".to_string()]);
    assert_eq!(*ocr_log.lock().unwrap(), vec!["C2".to_string()]);
    assert!(gateway.derived_bytes("C1", "thumbnail", 1).is_some());
    assert!(gateway.derived_bytes("C2", "ocr_text", 1).is_some());

    engine_a.shutdown(Duration::from_secs(5)).await;
    engine_b.shutdown(Duration::from_secs(5)).await;
}

// Executor panics stay inside the per-intent scope: the intent retries and
// the worker keeps polling.
#[tokio::test]
async fn executor_panic_is_contained() {
    struct PanickingExecutor;

    #[async_trait]
    impl JobExecutor for PanickingExecutor {
        fn job_name(&self) -> &str {
            "thumbnail.v1"
        }
        fn validate_payload(&self, _payload: &[u8]) -> Result<(), PayloadError> {
            Ok(())
        }
        async fn execute(
            &self,
            _job: &ClaimedJob,
            _ctx: &ExecutionContext,
        ) -> Result<ExecutionOutput, ExecutionError> {
            panic!("executor bug");
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(PanickingExecutor));

    let mut settings = fast_settings(dir.path(), "panic");
    settings.max_attempts_default = 2;
    let mut engine = Engine::connect(settings, registry).await.unwrap();
    let client = engine.client();
    engine.spawn_workers(1);

    let receipt = client.submit(thumbnail_request("C1")).await.unwrap();
    let status = wait_for_state(
        &client,
        &receipt.run_id,
        RunState::Failed,
        Duration::from_secs(10),
    )
    .await;

    // Both attempts ran (the loop survived the first panic) and the failure
    // was classified transient.
    assert_eq!(status.attempt_count, 2);
    assert!(status.error.unwrap().contains("panicked"));

    engine.shutdown(Duration::from_secs(5)).await;
}

// Invalid payloads never reach the executor; they deadletter as permanent.
#[tokio::test]
async fn schema_violation_is_permanent() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = MemoryGateway::new();

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(StubExecutor::new(
        "thumbnail.v1",
        "thumbnail",
        Arc::clone(&gateway),
    )));

    let mut engine = Engine::connect(fast_settings(dir.path(), "schema"), registry)
        .await
        .unwrap();
    let client = engine.client();
    let repo = engine.db().intents();

    // Bypass the client API to smuggle in a payload the executor's declared
    // schema rejects.
    let intent = repo
        .insert(
            contentpipe::models::NewIntent {
                queue: "default".to_string(),
                name: "thumbnail.v1".to_string(),
                payload: b"not json at all".to_vec(),
                max_attempts: 5,
                run_after: SystemClock.now(),
            },
            SystemClock.now(),
        )
        .await
        .unwrap();

    engine.spawn_workers(1);
    let status = wait_for_state(&client, &intent.id, RunState::Failed, Duration::from_secs(5)).await;

    assert_eq!(status.attempt_count, 1);
    assert!(status.error.unwrap().contains("invalid payload"));

    engine.shutdown(Duration::from_secs(5)).await;
}
