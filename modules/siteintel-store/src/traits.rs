//! Persistence boundaries.
//!
//! Implemented by `PgStore` (postgres) and `MemoryStore` (tests, single process).
//! Time is always passed in by the caller so expiry logic stays deterministic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use siteintel_common::{CachedResult, ExecutionLock, Session, SessionSnapshot, SnapshotKind};

use crate::error::Result;

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the session for (owner, domain), creating it at version 0 if absent.
    /// Concurrent callers for the same pair all observe the same session id.
    async fn create_or_get(&self, candidate: &Session) -> Result<Session>;

    async fn get(&self, id: Uuid) -> Result<Option<Session>>;

    /// Write `session` only if the stored version still equals `expected_version`.
    /// On success the stored (and returned) record carries `expected_version + 1`.
    /// A stale version yields `StoreError::VersionConflict`.
    async fn save(&self, session: &Session, expected_version: i64) -> Result<Session>;
}

// ---------------------------------------------------------------------------
// LockStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum LockAttempt {
    Acquired(ExecutionLock),
    /// Another unreleased, unexpired lock holds the key.
    Held(ExecutionLock),
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomic check-and-create. Replaces a released or expired row for the same
    /// key; never waits.
    async fn try_acquire(&self, candidate: &ExecutionLock, now: DateTime<Utc>) -> Result<LockAttempt>;

    /// Mark the lock released if `token` still owns the key. Returns whether an
    /// active lock was released; stale or foreign tokens are a no-op.
    async fn release(&self, key: &str, token: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Release every lock held for a session. Returns how many were active.
    async fn release_session(&self, session_id: Uuid) -> Result<u64>;

    async fn active(&self, key: &str, now: DateTime<Utc>) -> Result<Option<ExecutionLock>>;

    /// Delete released and expired rows.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// ResultCache
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ResultCache: Send + Sync {
    /// The cached result for an execution id, unless it has expired.
    async fn get(&self, execution_id: &str, now: DateTime<Utc>) -> Result<Option<CachedResult>>;

    /// Store a result. An unexpired entry for the same execution id is kept
    /// as-is so replays stay identical.
    async fn put(&self, result: &CachedResult) -> Result<()>;

    async fn clear_session(&self, session_id: Uuid) -> Result<u64>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// SnapshotLog
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SnapshotLog: Send + Sync {
    async fn append(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// Snapshots for a session in recording order, optionally filtered by kind.
    async fn list(&self, session_id: Uuid, kind: Option<SnapshotKind>) -> Result<Vec<SessionSnapshot>>;
}
