pub mod executions;
pub mod sessions;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/api/sessions", post(sessions::create_or_get))
        .route("/api/sessions/{id}", get(sessions::get))
        .route("/api/sessions/{id}/approve", post(sessions::approve))
        .route("/api/sessions/{id}/abort", post(sessions::abort))
        .route("/api/sessions/{id}/fail", post(sessions::fail))
        .route("/api/sessions/{id}/reset", post(sessions::reset))
        .route("/api/sessions/{id}/quality", get(sessions::quality))
        .route("/api/sessions/{id}/history", get(sessions::history))
        .route("/api/sessions/{id}/snapshots", get(sessions::snapshots))
        .route("/api/sessions/{id}/recommendation", post(sessions::recommend))
        .route("/api/sessions/{id}/advisor-accuracy", get(sessions::advisor_accuracy))
        .route(
            "/api/sessions/{id}/conflicts/{conflict_id}/resolve",
            post(sessions::resolve_conflict),
        )
        .route("/api/sessions/{id}/executions", post(executions::request))
        .route(
            "/api/sessions/{id}/executions/{execution_id}",
            get(executions::result),
        )
        .with_state(state)
}
