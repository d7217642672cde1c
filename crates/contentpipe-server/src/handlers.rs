//! Endpoint handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use contentpipe::{ClientError, IntentStatus, ProcessRequest, RunStatus};

use super::AppState;

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn client_error(e: ClientError) -> Response {
    match e {
        ClientError::InvalidArgument(msg) => error_body(StatusCode::BAD_REQUEST, &msg),
        ClientError::NotFound(id) => {
            error_body(StatusCode::NOT_FOUND, &format!("run not found: {id}"))
        }
        ClientError::Unavailable(msg) => error_body(StatusCode::SERVICE_UNAVAILABLE, &msg),
    }
}

/// POST /v1/process: enqueue a run and return immediately.
pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> Response {
    match state.client.submit(request).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => client_error(e),
    }
}

/// GET /v1/runs/{run_id}: externally-visible run status.
pub async fn run_status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    match state.client.status(&run_id).await {
        Ok(status) => Json(status_body(&status)).into_response(),
        Err(e) => client_error(e),
    }
}

/// Executor results are conventionally JSON; pass them through structured
/// when they parse, fall back to a lossy string otherwise.
fn status_body(status: &RunStatus) -> serde_json::Value {
    let result = status.result.as_deref().map(|bytes| {
        serde_json::from_slice::<serde_json::Value>(bytes)
            .unwrap_or_else(|_| json!(String::from_utf8_lossy(bytes)))
    });

    json!({
        "run_id": status.run_id,
        "state": status.state.as_str(),
        "attempt_count": status.attempt_count,
        "max_attempts": status.max_attempts,
        "started_at": status.started_at.to_rfc3339(),
        "finished_at": status.finished_at.map(|t| t.to_rfc3339()),
        "result": result,
        "error": status.error,
    })
}

/// GET /api/status: per-status queue counts.
pub async fn api_status(State(state): State<AppState>) -> Response {
    match state.client.queue_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => client_error(e),
    }
}

/// Parameters for intent listings.
#[derive(Debug, serde::Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
}

/// GET /api/intents/{status}: operator view of intents in one engine status.
pub async fn list_intents(
    State(state): State<AppState>,
    Path(status): Path<String>,
    axum::extract::Query(params): axum::extract::Query<ListParams>,
) -> Response {
    let Some(status) = IntentStatus::from_str(&status) else {
        return error_body(
            StatusCode::BAD_REQUEST,
            &format!("unknown status: {status}"),
        );
    };
    let limit = params.limit.unwrap_or(50).min(500);

    match state.client.list_by_status(status, limit).await {
        Ok(intents) => {
            let rows: Vec<_> = intents
                .iter()
                .map(|i| {
                    json!({
                        "id": i.id,
                        "queue": i.queue,
                        "name": i.name,
                        "status": i.status.as_str(),
                        "attempt_count": i.attempt_count,
                        "max_attempts": i.max_attempts,
                        "run_after": i.run_after.to_rfc3339(),
                        "claimed_by": i.claimed_by,
                        "last_error": i.last_error,
                        "updated_at": i.updated_at.to_rfc3339(),
                    })
                })
                .collect();
            Json(rows).into_response()
        }
        Err(e) => client_error(e),
    }
}

/// GET /health: healthy iff the worker's last poll cycle is recent enough.
///
/// Processes without a poll loop (submission-only) are always healthy.
pub async fn health(State(state): State<AppState>) -> Response {
    let healthy = state
        .health
        .as_ref()
        .map(|probe| probe.is_healthy(state.clock.now()))
        .unwrap_or(true);

    if healthy {
        (StatusCode::OK, Json(json!({ "status": "healthy" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy" })),
        )
            .into_response()
    }
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics_scrape(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        ),
    }
}
