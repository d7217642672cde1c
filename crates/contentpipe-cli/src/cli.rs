//! Command-line interface.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use contentpipe::executor::JobCatalog;
use contentpipe::gateway::{FilesystemGateway, HttpGateway};
use contentpipe::repository::migrations;
use contentpipe::{ContentGateway, Engine, EngineSettings, ExecutorRegistry, ProcessRequest};
use contentpipe_executors::ThumbnailExecutor;
use contentpipe_server::AppState;

/// Shutdown grace period for in-flight executions.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "contentpipe", about = "Durable content-processing pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ServeArgs {
    /// Address to bind the HTTP API to.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 8081)]
    port: u16,
}

#[derive(Args)]
struct GatewayArgs {
    /// Base URL of a content API; when unset, a local filesystem store is
    /// used instead.
    #[arg(long, env = "CONTENT_API_URL")]
    content_api: Option<String>,
    /// Root directory of the filesystem content store.
    #[arg(long, env = "PIPELINE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Bring the intent store schema up to date.
    Migrate,
    /// Run workers plus the HTTP API in this process.
    Worker {
        #[command(flatten)]
        serve: ServeArgs,
        #[command(flatten)]
        gateway: GatewayArgs,
        /// Number of polling workers.
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Run the submission API without any workers.
    Serve {
        #[command(flatten)]
        serve: ServeArgs,
    },
    /// Enqueue one processing request.
    Submit {
        #[arg(long)]
        content_id: String,
        /// Job name (e.g. thumbnail.v1).
        #[arg(long, default_value = "thumbnail.v1")]
        job: String,
        /// Artifact version for every derivation type the job produces.
        #[arg(long, default_value_t = 1)]
        version: i64,
        /// Extra metadata entries, `key=value`.
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },
    /// Show the status of a run.
    Status { run_id: String },
    /// Show per-status queue counts.
    Queue,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Migrate => {
            let settings = settings_from_env()?;
            migrations::run_migrations(&settings.database_url).await?;
            info!("intent store schema is up to date");
            Ok(())
        }
        Command::Worker {
            serve,
            gateway,
            workers,
        } => run_worker(serve, gateway, workers).await,
        Command::Serve { serve } => run_serve(serve).await,
        Command::Submit {
            content_id,
            job,
            version,
            metadata,
        } => run_submit(content_id, job, version, metadata).await,
        Command::Status { run_id } => run_status(run_id).await,
        Command::Queue => run_queue().await,
    }
}

async fn run_queue() -> anyhow::Result<()> {
    let settings = settings_from_env()?;
    let engine = Engine::connect(settings, ExecutorRegistry::new()).await?;
    let stats = engine.client().queue_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn settings_from_env() -> anyhow::Result<EngineSettings> {
    EngineSettings::from_env().map_err(|e| anyhow::anyhow!(e))
}

fn build_gateway(args: &GatewayArgs) -> anyhow::Result<Arc<dyn ContentGateway>> {
    match &args.content_api {
        Some(url) => {
            info!(url = %url, "using content API gateway");
            Ok(Arc::new(HttpGateway::new(url.clone())))
        }
        None => {
            info!(dir = %args.data_dir.display(), "using filesystem content store");
            let gateway = FilesystemGateway::new(&args.data_dir)
                .with_context(|| format!("opening content store at {}", args.data_dir.display()))?;
            Ok(Arc::new(gateway))
        }
    }
}

async fn run_worker(serve: ServeArgs, gateway: GatewayArgs, workers: usize) -> anyhow::Result<()> {
    let settings = settings_from_env()?;
    let gateway = build_gateway(&gateway)?;

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(ThumbnailExecutor::new(gateway)));
    // OCR and object detection are claimed by the external ML worker.

    let prometheus = contentpipe_server::install_prometheus();
    let mut engine = Engine::connect(settings, registry).await?;
    engine.spawn_workers(workers.max(1));

    let state = AppState::for_engine(&engine, prometheus);
    let server = tokio::spawn(async move {
        if let Err(e) = contentpipe_server::serve(state, &serve.host, serve.port).await {
            tracing::error!("HTTP server failed: {e}");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    engine.shutdown(SHUTDOWN_TIMEOUT).await;
    server.abort();
    Ok(())
}

async fn run_serve(serve: ServeArgs) -> anyhow::Result<()> {
    let settings = settings_from_env()?;
    let engine = Engine::connect(settings, ExecutorRegistry::new()).await?;
    let prometheus = contentpipe_server::install_prometheus();
    let state = AppState::submission_only(&engine, prometheus);
    contentpipe_server::serve(state, &serve.host, serve.port).await
}

async fn run_submit(
    content_id: String,
    job: String,
    version: i64,
    metadata: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let settings = settings_from_env()?;
    let engine = Engine::connect(settings, ExecutorRegistry::new()).await?;
    let client = engine.client();

    let catalog = JobCatalog::builtin();
    let versions: BTreeMap<String, i64> = catalog
        .derived_types(&job)
        .unwrap_or_default()
        .iter()
        .map(|derivation_type| (derivation_type.clone(), version))
        .collect();

    let receipt = client
        .submit(ProcessRequest {
            content_id,
            job,
            versions,
            metadata: metadata.into_iter().collect(),
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

async fn run_status(run_id: String) -> anyhow::Result<()> {
    let settings = settings_from_env()?;
    let engine = Engine::connect(settings, ExecutorRegistry::new()).await?;
    let status = engine.client().status(&run_id).await?;

    let result = status.result.as_deref().map(|bytes| {
        serde_json::from_slice::<serde_json::Value>(bytes)
            .unwrap_or_else(|_| serde_json::json!(String::from_utf8_lossy(bytes)))
    });
    let view = serde_json::json!({
        "run_id": status.run_id,
        "state": status.state.as_str(),
        "attempt_count": status.attempt_count,
        "max_attempts": status.max_attempts,
        "started_at": status.started_at.to_rfc3339(),
        "finished_at": status.finished_at.map(|t| t.to_rfc3339()),
        "result": result,
        "error": status.error,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_parsing() {
        assert_eq!(
            parse_key_value("width=300").unwrap(),
            ("width".to_string(), "300".to_string())
        );
        assert_eq!(
            parse_key_value("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("naked").is_err());
        assert!(parse_key_value("=v").is_err());
    }
}
