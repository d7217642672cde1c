//! HTTP surface for the pipeline engine.
//!
//! Exposes submission and status for applications plus the operational
//! endpoints: Prometheus scrape and worker health.

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use contentpipe::clock::Clock;
use contentpipe::dispatcher::HealthProbe;
use contentpipe::{Engine, PipelineClient};

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<PipelineClient>,
    pub clock: Arc<dyn Clock>,
    /// Poll-loop health of this process; `None` when no workers run here.
    pub health: Option<Arc<HealthProbe>>,
    /// Render handle for /metrics; `None` when no recorder is installed.
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// State for a worker process: submission plus health and metrics.
    pub fn for_engine(engine: &Engine, prometheus: Option<PrometheusHandle>) -> Self {
        Self {
            client: Arc::new(engine.client()),
            clock: engine.clock(),
            health: Some(engine.health()),
            prometheus,
        }
    }

    /// State for a submission-only process (no poll loop to monitor).
    pub fn submission_only(engine: &Engine, prometheus: Option<PrometheusHandle>) -> Self {
        Self {
            client: Arc::new(engine.client()),
            clock: engine.clock(),
            health: None,
            prometheus,
        }
    }
}

/// Install the Prometheus recorder for this process.
///
/// Only one recorder can exist per process; a second install attempt logs
/// and returns `None` rather than failing startup.
pub fn install_prometheus() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!("prometheus recorder not installed: {e}");
            None
        }
    }
}

/// Start the HTTP server.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    tracing::info!("pipeline API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
