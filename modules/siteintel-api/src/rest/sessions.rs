use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use siteintel_common::{Cents, Phase, SnapshotKind};
use siteintel_engine::ConflictChoice;

use crate::error::ApiError;
use crate::AppState;

// --- Request bodies ---

#[derive(Deserialize)]
pub struct CreateSessionBody {
    owner: String,
    domain: String,
    budget_cents: Option<Cents>,
}

#[derive(Deserialize)]
pub struct ApproveBody {
    phase: Phase,
}

#[derive(Deserialize)]
pub struct ReasonBody {
    reason: String,
}

#[derive(Deserialize)]
pub struct ResolveBody {
    choice: ConflictChoice,
    resolver: String,
}

#[derive(Deserialize)]
pub struct SnapshotsQuery {
    kind: Option<String>,
}

// --- Handlers ---

pub async fn create_or_get(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Response, ApiError> {
    let session = state
        .orchestrator
        .create_or_get_session(&body.owner, &body.domain, body.budget_cents)
        .await?;
    Ok(Json(session).into_response())
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state.orchestrator.get_session(id).await?;
    Ok(Json(session).into_response())
}

pub async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApproveBody>,
) -> Result<Response, ApiError> {
    let session = state.orchestrator.approve_phase(id, body.phase).await?;
    Ok(Json(session).into_response())
}

pub async fn abort(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReasonBody>,
) -> Result<Response, ApiError> {
    let session = state.orchestrator.abort_session(id, &body.reason).await?;
    Ok(Json(session).into_response())
}

pub async fn fail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReasonBody>,
) -> Result<Response, ApiError> {
    let session = state.orchestrator.fail_session(id, &body.reason).await?;
    Ok(Json(session).into_response())
}

pub async fn reset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state.orchestrator.reset_session(id).await?;
    info!(session_id = %id, "Session reset via API");
    Ok(Json(session).into_response())
}

pub async fn quality(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let quality = state.orchestrator.get_quality(id).await?;
    Ok(Json(json!({ "quality": quality })).into_response())
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let runs = state.orchestrator.get_history(id).await?;
    Ok(Json(json!({ "runs": runs })).into_response())
}

pub async fn snapshots(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<SnapshotsQuery>,
) -> Result<Response, ApiError> {
    let kind = params
        .kind
        .as_deref()
        .map(str::parse::<SnapshotKind>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let snapshots = state.orchestrator.get_snapshots(id, kind).await?;
    Ok(Json(json!({ "snapshots": snapshots })).into_response())
}

pub async fn recommend(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let decision = state.orchestrator.recommend_next(id).await?;
    Ok(Json(decision).into_response())
}

pub async fn advisor_accuracy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let accuracy = state.orchestrator.advisor_accuracy(id).await?;
    Ok(Json(accuracy).into_response())
}

pub async fn resolve_conflict(
    State(state): State<Arc<AppState>>,
    Path((id, conflict_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<ResolveBody>,
) -> Result<Response, ApiError> {
    let session = state
        .orchestrator
        .resolve_conflict(id, conflict_id, body.choice, &body.resolver)
        .await?;
    Ok(Json(session).into_response())
}
