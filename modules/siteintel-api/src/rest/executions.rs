use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use siteintel_common::ExecutionUpdate;
use siteintel_engine::{ExecutionHandle, ExecutionRequest, ExecutionStart};

use crate::error::ApiError;
use crate::AppState;

/// Start a run. A fresh run answers with a server-sent event stream that
/// ends after the `complete` or `error` event; everything else is plain JSON.
pub async fn request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExecutionRequest>,
) -> Result<Response, ApiError> {
    let start = state.orchestrator.request_execution(id, body).await?;
    let response = match start {
        ExecutionStart::Cached(cached) => {
            Json(json!({ "status": "cached", "result": cached })).into_response()
        }
        ExecutionStart::Recorded(run) => {
            Json(json!({ "status": "recorded", "run": run })).into_response()
        }
        ExecutionStart::Busy { remaining } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "An execution over this URL set is already in flight",
                "status": "busy",
                "remaining_ms": remaining.as_millis() as u64,
            })),
        )
            .into_response(),
        ExecutionStart::Started(handle) => {
            info!(
                session_id = %id,
                execution_id = %handle.execution_id,
                scraper = %handle.scraper_id,
                "Streaming execution events"
            );
            event_stream(handle).into_response()
        }
    };
    Ok(response)
}

fn sse_event(update: &ExecutionUpdate) -> Event {
    let event = Event::default()
        .event(update.event.event_type())
        .id(update.seq.to_string());
    match serde_json::to_string(update) {
        Ok(data) => event.data(data),
        Err(e) => {
            warn!(execution_id = %update.execution_id, error = %e, "Failed to encode execution event");
            event.data("{}")
        }
    }
}

fn event_stream(
    mut handle: ExecutionHandle,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(update) = handle.next().await {
            let done = update.event.is_final();
            yield Ok(sse_event(&update));
            if done {
                break;
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn result(
    State(state): State<Arc<AppState>>,
    Path((id, execution_id)): Path<(Uuid, String)>,
) -> Result<Response, ApiError> {
    if let Some(cached) = state.orchestrator.cached_result(id, &execution_id).await? {
        return Ok(Json(json!({ "status": "cached", "result": cached })).into_response());
    }
    let session = state.orchestrator.get_session(id).await?;
    match session.run(&execution_id) {
        Some(run) => Ok(Json(json!({ "status": "recorded", "run": run })).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Execution not found: {execution_id}") })),
        )
            .into_response()),
    }
}
