//! Content-API gateway speaking HTTP.
//!
//! Talks to an external content service:
//! `GET  /api/v1/contents/{id}`            existence probe
//! `GET  /api/v1/contents/{id}/download`   source byte stream
//! `GET  /api/v1/contents/{id}/derived`    list derived artifacts
//! `POST /api/v1/contents/{id}/derived`    multipart artifact upload

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::StreamReader;

use super::{variant_name, ContentGateway, ContentStream, GatewayError};

/// Artifact statuses the content service reports as usable.
const READY_STATUSES: [&str; 2] = ["uploaded", "processed"];

#[derive(Debug, Deserialize)]
struct DerivedEntry {
    variant: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

/// Content gateway over a remote content API.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn content_url(&self, parent_id: &str) -> String {
        format!("{}/api/v1/contents/{}", self.base_url, parent_id)
    }

    /// Map non-success statuses onto the gateway taxonomy.
    fn status_error(status: reqwest::StatusCode, context: &str) -> GatewayError {
        use reqwest::StatusCode;
        match status {
            StatusCode::NOT_FOUND => GatewayError::NotFound(context.to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                GatewayError::Auth(format!("{context}: status {status}"))
            }
            StatusCode::CONFLICT => GatewayError::Conflict(context.to_string()),
            _ => GatewayError::Transport(format!("{context}: status {status}")),
        }
    }
}

fn transport(e: reqwest::Error) -> GatewayError {
    GatewayError::Transport(e.to_string())
}

#[async_trait]
impl ContentGateway for HttpGateway {
    async fn exists(&self, parent_id: &str) -> Result<bool, GatewayError> {
        let resp = self
            .client
            .get(self.content_url(parent_id))
            .send()
            .await
            .map_err(transport)?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => Err(Self::status_error(s, parent_id)),
        }
    }

    async fn read(&self, parent_id: &str) -> Result<ContentStream, GatewayError> {
        let resp = self
            .client
            .get(format!("{}/download", self.content_url(parent_id)))
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(Self::status_error(resp.status(), parent_id));
        }
        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn has(
        &self,
        parent_id: &str,
        derivation_type: &str,
        version: i64,
    ) -> Result<bool, GatewayError> {
        let resp = self
            .client
            .get(format!("{}/derived", self.content_url(parent_id)))
            .send()
            .await
            .map_err(transport)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(Self::status_error(resp.status(), parent_id));
        }

        let entries: Vec<DerivedEntry> = resp.json().await.map_err(transport)?;
        let wanted = variant_name(derivation_type, version);
        Ok(entries
            .iter()
            .any(|e| e.variant == wanted && READY_STATUSES.contains(&e.status.as_str())))
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
        let file_name = meta
            .get("file_name")
            .cloned()
            .unwrap_or_else(|| format!("derived_{derivation_type}.dat"));

        let meta_json = serde_json::to_string(meta)
            .map_err(|e| GatewayError::Transport(format!("metadata encode failed: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("derivation_type", derivation_type.to_string())
            .text("variant", variant.clone())
            .text("metadata", meta_json)
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let resp = self
            .client
            .post(format!("{}/derived", self.content_url(parent_id)))
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(Self::status_error(
                resp.status(),
                &format!("{parent_id}/{variant}"),
            ));
        }

        let uploaded: UploadResponse = resp.json().await.map_err(transport)?;
        Ok(uploaded.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let gw = HttpGateway::new("http://content.local/");
        assert_eq!(gw.content_url("C1"), "http://content.local/api/v1/contents/C1");
    }

    #[test]
    fn status_mapping() {
        use reqwest::StatusCode;
        assert!(matches!(
            HttpGateway::status_error(StatusCode::NOT_FOUND, "c"),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            HttpGateway::status_error(StatusCode::FORBIDDEN, "c"),
            GatewayError::Auth(_)
        ));
        assert!(matches!(
            HttpGateway::status_error(StatusCode::CONFLICT, "c"),
            GatewayError::Conflict(_)
        ));
        assert!(matches!(
            HttpGateway::status_error(StatusCode::BAD_GATEWAY, "c"),
            GatewayError::Transport(_)
        ));
    }
}
