//! Thumbnail generation executor.
//!
//! Steps per attempt: skip-if-present probe, source existence check,
//! download, decode, aspect-fit resize (Lanczos), JPEG encode, derived
//! write. Decode failures are permanent (the bytes will not get better on
//! retry) while gateway transport trouble stays transient.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use image::imageops::FilterType;
use tracing::{debug, info};

use contentpipe::client::wire::JobPayload;
use contentpipe::metrics;
use contentpipe::{
    ClaimedJob, ContentGateway, ExecutionContext, ExecutionError, ExecutionOutput, JobExecutor,
    PayloadError,
};

pub const JOB_NAME: &str = "thumbnail.v1";
const DERIVED_TYPE: &str = "thumbnail";
const DEFAULT_EDGE: u32 = 300;
const JPEG_QUALITY: u8 = 80;

/// Validated view of a thumbnail payload.
struct ThumbnailParams {
    content_id: String,
    version: i64,
    width: u32,
    height: u32,
}

/// Generates a JPEG thumbnail for image content.
pub struct ThumbnailExecutor {
    gateway: Arc<dyn ContentGateway>,
}

impl ThumbnailExecutor {
    pub fn new(gateway: Arc<dyn ContentGateway>) -> Self {
        Self { gateway }
    }

    /// Declared input schema: JSON `{content_id, versions: {thumbnail: n},
    /// metadata: {width?, height?}}` with a positive version.
    fn parse(payload: &[u8]) -> Result<ThumbnailParams, PayloadError> {
        let payload = JobPayload::decode(payload)
            .map_err(|e| PayloadError(format!("payload is not valid JSON: {e}")))?;

        if payload.content_id.is_empty() {
            return Err(PayloadError("content_id is required".to_string()));
        }
        let version = payload
            .version_for(DERIVED_TYPE)
            .ok_or_else(|| PayloadError("thumbnail version not provided".to_string()))?;
        if version < 1 {
            return Err(PayloadError(format!("invalid thumbnail version: {version}")));
        }

        let width = dimension(&payload.metadata, "width")?;
        let height = dimension(&payload.metadata, "height")?;

        Ok(ThumbnailParams {
            content_id: payload.content_id,
            version,
            width,
            height,
        })
    }
}

fn dimension(meta: &BTreeMap<String, String>, key: &str) -> Result<u32, PayloadError> {
    match meta.get(key) {
        None => Ok(DEFAULT_EDGE),
        Some(raw) => match raw.parse::<u32>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(PayloadError(format!("invalid {key}: {raw}"))),
        },
    }
}

#[async_trait]
impl JobExecutor for ThumbnailExecutor {
    fn job_name(&self) -> &str {
        JOB_NAME
    }

    fn validate_payload(&self, payload: &[u8]) -> Result<(), PayloadError> {
        Self::parse(payload).map(|_| ())
    }

    async fn execute(
        &self,
        job: &ClaimedJob,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutput, ExecutionError> {
        let params =
            Self::parse(&job.payload).map_err(|e| ExecutionError::permanent(e.to_string()))?;
        let content_id = params.content_id;

        // Skip-if-present: the artifact may already exist from an earlier
        // attempt or a duplicate submission.
        match self
            .gateway
            .has(&content_id, DERIVED_TYPE, params.version)
            .await
        {
            Ok(true) => {
                metrics::record_skipped(JOB_NAME);
                info!(
                    intent = %job.intent_id,
                    content_id = %content_id,
                    version = params.version,
                    "derived artifact already exists; skipping"
                );
                let result = serde_json::json!({
                    "ok": true,
                    "skipped": true,
                    "outputs": {
                        "content_id": content_id,
                        "derived_type": DERIVED_TYPE,
                        "version": params.version,
                    },
                });
                return Ok(ExecutionOutput::from_bytes(result.to_string().into_bytes()));
            }
            Ok(false) => {}
            // The probe is an optimization; a failed check is not fatal.
            Err(e) => debug!(intent = %job.intent_id, error = %e, "skip probe failed; continuing"),
        }

        if !self.gateway.exists(&content_id).await? {
            return Err(ExecutionError::permanent(format!(
                "source content not found: {content_id}"
            )));
        }

        let bytes = self.gateway.read_bytes(&content_id).await?;
        debug!(
            intent = %job.intent_id,
            size = bytes.len(),
            "source content downloaded"
        );

        if ctx.is_cancelled() {
            return Err(ExecutionError::transient("canceled before decode"));
        }

        // Decode and resize are CPU-bound; keep them off the runtime.
        let (jpeg, width, height) = tokio::task::spawn_blocking({
            let (w, h) = (params.width, params.height);
            move || render_thumbnail(&bytes, w, h)
        })
        .await
        .map_err(|_| ExecutionError::transient("thumbnail render task failed"))??;

        let meta = BTreeMap::from([
            (
                "file_name".to_string(),
                format!("thumbnail_v{}.jpg", params.version),
            ),
            ("width".to_string(), width.to_string()),
            ("height".to_string(), height.to_string()),
            ("mime_type".to_string(), "image/jpeg".to_string()),
        ]);
        let derived_id = self
            .gateway
            .put(&content_id, DERIVED_TYPE, params.version, jpeg, &meta)
            .await?;

        info!(
            intent = %job.intent_id,
            content_id = %content_id,
            derived_id = %derived_id,
            width,
            height,
            "thumbnail written"
        );

        let result = serde_json::json!({
            "ok": true,
            "derived_id": derived_id,
            "outputs": {
                "content_id": content_id,
                "derived_type": DERIVED_TYPE,
                "version": params.version,
                "width": width,
                "height": height,
            },
        });
        Ok(ExecutionOutput::from_bytes(result.to_string().into_bytes()))
    }
}

/// Decode, aspect-fit into `width × height`, and encode as JPEG.
fn render_thumbnail(
    bytes: &[u8],
    width: u32,
    height: u32,
) -> Result<(Vec<u8>, u32, u32), ExecutionError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| ExecutionError::permanent(format!("image decode failed: {e}")))?;

    let thumb = img.resize(width, height, FilterType::Lanczos3);
    let (actual_width, actual_height) = (thumb.width(), thumb.height());

    let mut out = Vec::new();
    let rgb = thumb.to_rgb8();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| ExecutionError::permanent(format!("JPEG encode failed: {e}")))?;

    Ok((out, actual_width, actual_height))
}
