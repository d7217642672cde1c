//! Filesystem-backed content gateway.
//!
//! Source bytes live under `content/`, derived artifacts under `derived/`,
//! both sharded into two-level directories by id prefix for filesystem
//! efficiency. Derived writes go through a temp file and an atomic rename,
//! and every artifact carries a JSON metadata sidecar.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{variant_name, ContentGateway, ContentStream, GatewayError};

const SOURCE_SUBDIR: &str = "content";
const DERIVED_SUBDIR: &str = "derived";
const META_SUFFIX: &str = ".meta.json";

/// Metadata sidecar stored next to each derived artifact.
#[derive(Debug, Serialize, Deserialize)]
struct ArtifactMeta {
    derived_id: String,
    parent_id: String,
    derivation_type: String,
    version: i64,
    size: u64,
    content_hash: String,
    #[serde(default)]
    meta: BTreeMap<String, String>,
}

/// Content gateway over a local directory tree.
#[derive(Debug, Clone)]
pub struct FilesystemGateway {
    base_dir: PathBuf,
}

impl FilesystemGateway {
    /// Open (and create, if needed) a gateway rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(base_dir.join(SOURCE_SUBDIR)).map_err(io_transport)?;
        std::fs::create_dir_all(base_dir.join(DERIVED_SUBDIR)).map_err(io_transport)?;
        Ok(Self { base_dir })
    }

    fn source_path(&self, parent_id: &str) -> PathBuf {
        self.base_dir
            .join(SOURCE_SUBDIR)
            .join(shard(parent_id))
            .join(parent_id)
    }

    fn derived_path(&self, parent_id: &str, derivation_type: &str, version: i64) -> PathBuf {
        self.base_dir
            .join(DERIVED_SUBDIR)
            .join(shard(parent_id))
            .join(parent_id)
            .join(variant_name(derivation_type, version))
    }

    /// Seed source content, mostly for imports and tests.
    pub async fn put_source(&self, parent_id: &str, bytes: &[u8]) -> Result<(), GatewayError> {
        let path = self.source_path(parent_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_transport)?;
        }
        tokio::fs::write(&path, bytes).await.map_err(io_transport)?;
        Ok(())
    }
}

#[async_trait]
impl ContentGateway for FilesystemGateway {
    async fn exists(&self, parent_id: &str) -> Result<bool, GatewayError> {
        match tokio::fs::metadata(self.source_path(parent_id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_transport(e)),
        }
    }

    async fn read(&self, parent_id: &str) -> Result<ContentStream, GatewayError> {
        match tokio::fs::File::open(self.source_path(parent_id)).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GatewayError::NotFound(parent_id.to_string()))
            }
            Err(e) => Err(io_transport(e)),
        }
    }

    async fn has(
        &self,
        parent_id: &str,
        derivation_type: &str,
        version: i64,
    ) -> Result<bool, GatewayError> {
        match tokio::fs::metadata(self.derived_path(parent_id, derivation_type, version)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_transport(e)),
        }
    }

    async fn put(
        &self,
        parent_id: &str,
        derivation_type: &str,
        version: i64,
        bytes: Vec<u8>,
        meta: &BTreeMap<String, String>,
    ) -> Result<String, GatewayError> {
        let variant = variant_name(derivation_type, version);
        let final_path = self.derived_path(parent_id, derivation_type, version);
        let dir = final_path
            .parent()
            .ok_or_else(|| GatewayError::Transport("derived path has no parent".to_string()))?;
        tokio::fs::create_dir_all(dir).await.map_err(io_transport)?;

        let derived_id = format!("{parent_id}/{variant}");
        let new_hash = content_hash(&bytes);

        // Tuple uniqueness: a pre-existing artifact with equal bytes is a
        // benign replay, different bytes are a conflict.
        if let Ok(existing) = tokio::fs::read(&final_path).await {
            if content_hash(&existing) == new_hash {
                return Ok(derived_id);
            }
            return Err(GatewayError::Conflict(derived_id));
        }

        // Temp file + rename keeps readers from ever observing a partial
        // artifact.
        let tmp_path = dir.join(format!(".{variant}.{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp_path, &bytes).await.map_err(io_transport)?;

        let sidecar = ArtifactMeta {
            derived_id: derived_id.clone(),
            parent_id: parent_id.to_string(),
            derivation_type: derivation_type.to_string(),
            version,
            size: bytes.len() as u64,
            content_hash: new_hash,
            meta: meta.clone(),
        };
        let sidecar_json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| GatewayError::Transport(format!("metadata encode failed: {e}")))?;
        let meta_path = dir.join(format!("{variant}{META_SUFFIX}"));
        tokio::fs::write(&meta_path, sidecar_json)
            .await
            .map_err(io_transport)?;

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(io_transport)?;

        Ok(derived_id)
    }
}

/// Two-character shard directory for an id.
fn shard(id: &str) -> &str {
    if id.len() >= 2 {
        &id[..2]
    } else {
        "_"
    }
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn io_transport(e: std::io::Error) -> GatewayError {
    GatewayError::Transport(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta() -> BTreeMap<String, String> {
        BTreeMap::from([("mime_type".to_string(), "image/jpeg".to_string())])
    }

    #[tokio::test]
    async fn source_round_trip() {
        let dir = tempdir().unwrap();
        let gw = FilesystemGateway::new(dir.path()).unwrap();

        assert!(!gw.exists("C1").await.unwrap());
        gw.put_source("C1", b"source bytes").await.unwrap();
        assert!(gw.exists("C1").await.unwrap());
        assert_eq!(gw.read_bytes("C1").await.unwrap(), b"source bytes");
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let dir = tempdir().unwrap();
        let gw = FilesystemGateway::new(dir.path()).unwrap();
        match gw.read("nope").await {
            Err(e) => assert!(matches!(e, GatewayError::NotFound(_))),
            Ok(_) => panic!("expected NotFound error"),
        }
    }

    #[tokio::test]
    async fn put_is_idempotent_for_equal_bytes() {
        let dir = tempdir().unwrap();
        let gw = FilesystemGateway::new(dir.path()).unwrap();

        assert!(!gw.has("C1", "thumbnail", 1).await.unwrap());
        let id1 = gw
            .put("C1", "thumbnail", 1, b"jpeg".to_vec(), &meta())
            .await
            .unwrap();
        assert!(gw.has("C1", "thumbnail", 1).await.unwrap());

        let id2 = gw
            .put("C1", "thumbnail", 1, b"jpeg".to_vec(), &meta())
            .await
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn put_conflicts_on_different_bytes() {
        let dir = tempdir().unwrap();
        let gw = FilesystemGateway::new(dir.path()).unwrap();
        gw.put("C1", "thumbnail", 1, b"aaa".to_vec(), &meta())
            .await
            .unwrap();
        assert!(matches!(
            gw.put("C1", "thumbnail", 1, b"bbb".to_vec(), &meta())
                .await
                .unwrap_err(),
            GatewayError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn versions_are_distinct_tuples() {
        let dir = tempdir().unwrap();
        let gw = FilesystemGateway::new(dir.path()).unwrap();
        gw.put("C1", "thumbnail", 1, b"v1".to_vec(), &meta())
            .await
            .unwrap();
        assert!(!gw.has("C1", "thumbnail", 2).await.unwrap());
        gw.put("C1", "thumbnail", 2, b"v2".to_vec(), &meta())
            .await
            .unwrap();
        assert!(gw.has("C1", "thumbnail", 2).await.unwrap());
    }
}
