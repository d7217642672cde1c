//! Durable persistence for intents, checkpoints, and the dedupe ledger.
//!
//! The intent store is the sole coordination point between workers: there is
//! no in-memory state shared across processes, and every state transition is
//! a guarded SQL update.

pub mod claim;
pub mod dedupe;
pub mod intents;
pub mod migrations;
pub mod pool;
pub mod records;
pub mod util;

use thiserror::Error;

pub use dedupe::DedupeLedger;
pub use intents::IntentRepository;
pub use pool::DbPool;

/// Errors surfaced by the intent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    /// The row is no longer owned by the calling worker: the lease expired
    /// and someone else claimed it, or the intent already reached a terminal
    /// state.
    #[error("stale lease: intent no longer owned by this worker")]
    StaleLease,
    #[error("intent not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Shared handle to all repositories backed by one pool.
#[derive(Clone)]
pub struct DbContext {
    pool: DbPool,
}

impl DbContext {
    /// Open a context from a database URL without touching the schema.
    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            pool: DbPool::from_url(url)?,
        })
    }

    /// Open a context and bring the schema up to date.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        migrations::run_migrations(url).await?;
        Self::from_url(url)
    }

    pub fn intents(&self) -> IntentRepository {
        IntentRepository::new(self.pool.clone())
    }

    pub fn dedupe(&self) -> DedupeLedger {
        DedupeLedger::new(self.pool.clone())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}
