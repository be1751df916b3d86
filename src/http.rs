//! Health, readiness and counters over HTTP.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::source::{EventSource, SourceState};

/// Router exposing `/health`, `/ready` and `/stats` for `source`
pub fn router(source: EventSource) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(source)
}

/// Liveness: the process is up
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "healthy" })))
}

/// Readiness: the consume loop is accepting new messages
async fn readiness_check(State(source): State<EventSource>) -> impl IntoResponse {
    let state = source.state();
    let status = if state == SourceState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "state": state, "in_flight": source.in_flight() })))
}

async fn stats(State(source): State<EventSource>) -> impl IntoResponse {
    Json(source.stats())
}
