//! Boundary seam to the external content store.
//!
//! The engine reads source bytes and writes versioned derived artifacts only
//! through [`ContentGateway`]. Two adapters conform to the same trait, a
//! local filesystem store and an HTTP content API client, and core logic
//! never branches on which one it holds.

mod fs;
mod http;

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::models::FailureKind;

pub use fs::FilesystemGateway;
pub use http::HttpGateway;

/// Byte stream over a parent's source content.
pub type ContentStream = Pin<Box<dyn AsyncRead + Send>>;

/// Failure modes surfaced to the engine.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("content not found: {0}")]
    NotFound(String),
    /// A concurrent put raced on the same `(parent, type, version)` tuple
    /// with different bytes. Adapters resolve equal-content races to success
    /// themselves.
    #[error("conflicting derived artifact: {0}")]
    Conflict(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authorization failed: {0}")]
    Auth(String),
}

impl GatewayError {
    /// How the engine classifies this failure for retry purposes.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::NotFound(_) | Self::Auth(_) => FailureKind::Permanent,
            Self::Conflict(_) | Self::Transport(_) => FailureKind::Transient,
        }
    }
}

/// Deterministic artifact variant name: a function of `(type, version)` only.
pub fn variant_name(derivation_type: &str, version: i64) -> String {
    format!("{derivation_type}_v{version}")
}

/// Read and write access to stored content and derived artifacts.
#[async_trait]
pub trait ContentGateway: Send + Sync {
    /// Cheap existence probe for the source content.
    async fn exists(&self, parent_id: &str) -> Result<bool, GatewayError>;

    /// Open a byte stream over the parent's source content.
    async fn read(&self, parent_id: &str) -> Result<ContentStream, GatewayError>;

    /// True iff a ready artifact exists for the exact tuple.
    async fn has(
        &self,
        parent_id: &str,
        derivation_type: &str,
        version: i64,
    ) -> Result<bool, GatewayError>;

    /// Create or upsert the artifact for the tuple; returns a stable id.
    ///
    /// Implementations must enforce uniqueness of the tuple.
    async fn put(
        &self,
        parent_id: &str,
        derivation_type: &str,
        version: i64,
        bytes: Vec<u8>,
        meta: &BTreeMap<String, String>,
    ) -> Result<String, GatewayError>;

    /// Convenience: drain [`ContentGateway::read`] into memory.
    async fn read_bytes(&self, parent_id: &str) -> Result<Vec<u8>, GatewayError> {
        let mut stream = self.read(parent_id).await?;
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .await
            .map_err(|e| GatewayError::Transport(format!("read of {parent_id} failed: {e}")))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names_are_deterministic() {
        assert_eq!(variant_name("thumbnail", 1), "thumbnail_v1");
        assert_eq!(variant_name("ocr_text", 12), "ocr_text_v12");
    }

    #[test]
    fn failure_kind_classification() {
        assert_eq!(
            GatewayError::NotFound("x".into()).failure_kind(),
            FailureKind::Permanent
        );
        assert_eq!(
            GatewayError::Auth("x".into()).failure_kind(),
            FailureKind::Permanent
        );
        assert_eq!(
            GatewayError::Conflict("x".into()).failure_kind(),
            FailureKind::Transient
        );
        assert_eq!(
            GatewayError::Transport("x".into()).failure_kind(),
            FailureKind::Transient
        );
    }
}
