//! The engine handle: one object owning the pool, registry, and workers.
//!
//! Construction wires everything explicitly; there is no process-global
//! runtime. Teardown is explicit and bounded by a timeout; whatever does not
//! drain in time is abandoned to lease-expiry reclaim.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::PipelineClient;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineSettings;
use crate::dispatcher::{HealthProbe, Worker};
use crate::executor::{ExecutorRegistry, JobCatalog};
use crate::metrics;
use crate::repository::util::redact_url_password;
use crate::repository::{DbContext, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coordinating handle for one engine instance.
pub struct Engine {
    settings: EngineSettings,
    ctx: DbContext,
    registry: Arc<ExecutorRegistry>,
    catalog: Arc<JobCatalog>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    health: Arc<HealthProbe>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Connect to the intent store, run pending migrations, and return a
    /// ready (but not yet polling) engine.
    ///
    /// The registry must be fully populated: workers derive their claim
    /// predicate from it.
    pub async fn connect(
        settings: EngineSettings,
        registry: ExecutorRegistry,
    ) -> Result<Self, EngineError> {
        metrics::register_metrics();
        let ctx = DbContext::open(&settings.database_url).await?;
        info!(
            database = %redact_url_password(&settings.database_url),
            queue = %settings.queue_name,
            "intent store ready"
        );

        Ok(Self {
            health: Arc::new(HealthProbe::new(settings.poll_interval)),
            settings,
            ctx,
            registry: Arc::new(registry),
            catalog: Arc::new(JobCatalog::builtin()),
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
        })
    }

    /// Replace the job catalog used for submission validation.
    pub fn with_catalog(mut self, catalog: JobCatalog) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    /// Substitute the time source. Useful for tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The submission/status surface bound to this engine's store.
    pub fn client(&self) -> PipelineClient {
        PipelineClient::new(
            self.ctx.intents(),
            self.ctx.dedupe(),
            Arc::clone(&self.catalog),
            self.settings.queue_name.clone(),
            self.settings.max_attempts_default,
            Arc::clone(&self.clock),
        )
    }

    /// Health view of this process's poll loops.
    pub fn health(&self) -> Arc<HealthProbe> {
        Arc::clone(&self.health)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn db(&self) -> &DbContext {
        &self.ctx
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Start `count` polling workers.
    pub fn spawn_workers(&mut self, count: usize) {
        for _ in 0..count {
            let worker = Worker::from_settings(
                &self.settings,
                self.workers.len(),
                self.ctx.intents(),
                Arc::clone(&self.registry),
                Arc::clone(&self.clock),
                self.shutdown.child_token(),
                Arc::clone(&self.health),
            );
            self.workers.push(worker.spawn());
        }
    }

    /// Number of live worker tasks.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Cancel workers, drain in-flight executions, and stop.
    ///
    /// Executions that ignore cancellation past `timeout` are abandoned;
    /// their claims resurface via lease expiry.
    pub async fn shutdown(mut self, timeout: Duration) {
        info!(workers = self.workers.len(), "engine shutting down");
        self.shutdown.cancel();

        let drain = async {
            for handle in self.workers.drain(..) {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("worker drain timed out; abandoning in-flight claims to lease expiry");
        }
        info!("engine stopped");
    }
}
