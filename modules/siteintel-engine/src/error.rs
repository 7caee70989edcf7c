use siteintel_common::{Cents, Phase};
use siteintel_store::StoreError;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failures surfaced to callers of the orchestrator. Lock contention and
/// version conflicts are retried internally and only appear here once the
/// retry budget is spent.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown scraper: {0}")]
    UnknownScraper(String),

    #[error("No URLs given for scraper {scraper_id}")]
    EmptyUrlSet { scraper_id: String },

    #[error(
        "Budget exceeded for session {session_id}: {scraper_id} estimated at {estimated_cents}c, \
         spent {spent_cents}c and reserved {reserved_cents}c of {budget_cents}c"
    )]
    BudgetExceeded {
        session_id: Uuid,
        scraper_id: String,
        estimated_cents: Cents,
        spent_cents: Cents,
        reserved_cents: Cents,
        budget_cents: Cents,
    },

    #[error(
        "Run cost ceiling: {scraper_id} estimated at {estimated_cents}c exceeds per-run limit \
         of {ceiling_cents}c (session {session_id})"
    )]
    RunCostCeiling {
        session_id: Uuid,
        scraper_id: String,
        estimated_cents: Cents,
        ceiling_cents: Cents,
    },

    #[error("Session {session_id} is in phase {actual}, not {expected}")]
    PhaseMismatch {
        session_id: Uuid,
        expected: Phase,
        actual: Phase,
    },

    #[error("Session {session_id} cannot leave terminal phase {phase}")]
    InvalidTransition { session_id: Uuid, phase: Phase },

    #[error("Session {session_id} does not accept executions in phase {phase}")]
    ExecutionNotAllowed { session_id: Uuid, phase: Phase },

    #[error("Conflict {conflict_id} not found on session {session_id}")]
    ConflictNotFound { session_id: Uuid, conflict_id: Uuid },

    #[error("Conflict {conflict_id} is already resolved")]
    ConflictAlreadyResolved { conflict_id: Uuid },

    #[error("Invalid resolution for conflict {conflict_id}: {message}")]
    InvalidResolution { conflict_id: Uuid, message: String },

    #[error("Session {session_id} kept changing underneath {attempts} write attempts")]
    VersionConflict { session_id: Uuid, attempts: u32 },

    #[error("Persistence failed after {attempts} attempts: {source}")]
    Persistence {
        #[source]
        source: StoreError,
        attempts: u32,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Wrap a store error that has already been through the retry policy.
    pub fn persistence(source: StoreError, attempts: u32) -> Self {
        match source {
            StoreError::SessionNotFound(id) => EngineError::SessionNotFound(id),
            source => EngineError::Persistence { source, attempts },
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(source: StoreError) -> Self {
        EngineError::persistence(source, 1)
    }
}
