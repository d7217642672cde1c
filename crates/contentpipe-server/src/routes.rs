//! Router configuration.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/process", post(handlers::submit))
        .route("/v1/runs/:run_id", get(handlers::run_status))
        // Operator/observability reads
        .route("/api/status", get(handlers::api_status))
        .route("/api/intents/:status", get(handlers::list_intents))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_scrape))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
