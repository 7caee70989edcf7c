use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::{error, warn};

use siteintel_engine::EngineError;

/// Engine failures as HTTP responses. The body is always `{"error": ...}`
/// plus whatever context the variant carries.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        let ApiError::Engine(err) = self else {
            return StatusCode::BAD_REQUEST;
        };
        match err {
            EngineError::SessionNotFound(_)
            | EngineError::ConflictNotFound { .. }
            | EngineError::UnknownScraper(_) => StatusCode::NOT_FOUND,
            EngineError::BudgetExceeded { .. } | EngineError::RunCostCeiling { .. } => {
                StatusCode::PAYMENT_REQUIRED
            }
            EngineError::PhaseMismatch { .. }
            | EngineError::ConflictAlreadyResolved { .. }
            | EngineError::VersionConflict { .. } => StatusCode::CONFLICT,
            EngineError::InvalidTransition { .. }
            | EngineError::ExecutionNotAllowed { .. }
            | EngineError::InvalidRequest(_)
            | EngineError::EmptyUrlSet { .. }
            | EngineError::InvalidResolution { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Persistence { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn context(&self) -> serde_json::Value {
        let ApiError::Engine(err) = self else {
            return json!({});
        };
        match err {
            EngineError::SessionNotFound(id) => json!({ "session_id": id }),
            EngineError::UnknownScraper(id) | EngineError::EmptyUrlSet { scraper_id: id } => {
                json!({ "scraper_id": id })
            }
            EngineError::BudgetExceeded {
                session_id,
                scraper_id,
                estimated_cents,
                spent_cents,
                reserved_cents,
                budget_cents,
            } => json!({
                "session_id": session_id,
                "scraper_id": scraper_id,
                "estimated_cents": estimated_cents,
                "spent_cents": spent_cents,
                "reserved_cents": reserved_cents,
                "budget_cents": budget_cents,
            }),
            EngineError::RunCostCeiling {
                session_id,
                scraper_id,
                estimated_cents,
                ceiling_cents,
            } => json!({
                "session_id": session_id,
                "scraper_id": scraper_id,
                "estimated_cents": estimated_cents,
                "ceiling_cents": ceiling_cents,
            }),
            EngineError::PhaseMismatch {
                session_id,
                expected,
                actual,
            } => json!({ "session_id": session_id, "expected": expected, "actual": actual }),
            EngineError::InvalidTransition { session_id, phase }
            | EngineError::ExecutionNotAllowed { session_id, phase } => {
                json!({ "session_id": session_id, "phase": phase })
            }
            EngineError::ConflictNotFound { conflict_id, .. }
            | EngineError::ConflictAlreadyResolved { conflict_id }
            | EngineError::InvalidResolution { conflict_id, .. } => {
                json!({ "conflict_id": conflict_id })
            }
            EngineError::VersionConflict {
                session_id,
                attempts,
            } => json!({ "session_id": session_id, "attempts": attempts }),
            EngineError::Persistence { attempts, .. } => json!({ "attempts": attempts }),
            EngineError::InvalidRequest(_) | EngineError::Config(_) => json!({}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            warn!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let mut body = self.context();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("error".to_string(), json!(self.to_string()));
        }
        (status, Json(body)).into_response()
    }
}
