//! contentpipe - durable, queue-driven content-processing workflow engine.
//!
//! Core library exposing the intent store, claim protocol, workflow
//! dispatcher, and derived-artifact gateway seam for workspace crates.

// Model types use `from_str` methods that return Option<Self>,
// not Result<Self, Error> as std::str::FromStr requires.
#![allow(clippy::should_implement_trait)]

pub mod client;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod gateway;
pub mod metrics;
pub mod models;
pub mod repository;
pub mod retry;
pub mod schema;

pub use client::{ClientError, PipelineClient, QueueStats, SubmitReceipt};
pub use clock::{Clock, SystemClock};
pub use config::EngineSettings;
pub use engine::Engine;
pub use executor::{
    ClaimedJob, ExecutionContext, ExecutionError, ExecutionOutput, ExecutorRegistry, JobCatalog,
    JobExecutor, PayloadError,
};
pub use gateway::{ContentGateway, GatewayError};
pub use models::{Intent, IntentStatus, ProcessRequest, RunState, RunStatus};
