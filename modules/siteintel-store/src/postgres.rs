//! Postgres backend.
//!
//! The session record is stored whole as JSONB; scalar columns mirror the
//! fields used for lookup and the optimistic version guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use siteintel_common::{CachedResult, ExecutionLock, Session, SessionSnapshot, SnapshotKind};

use crate::error::{Result, StoreError};
use crate::traits::{LockAttempt, LockStore, ResultCache, SessionStore, SnapshotLog};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Session store migrations applied");
        Ok(())
    }

    /// Wipe every table. Test isolation only.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn truncate_all(&self) -> Result<()> {
        sqlx::query(
            "TRUNCATE research_sessions, execution_locks, cached_results, session_snapshots",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

type LockRow = (String, Uuid, String, Uuid, DateTime<Utc>, DateTime<Utc>, bool);

fn lock_from_row(row: LockRow) -> ExecutionLock {
    let (key, session_id, scraper_id, token, acquired_at, expires_at, released) = row;
    ExecutionLock {
        key,
        session_id,
        scraper_id,
        token,
        acquired_at,
        expires_at,
        released,
    }
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SessionStore for PgStore {
    async fn create_or_get(&self, candidate: &Session) -> Result<Session> {
        let record = serde_json::to_value(candidate)?;

        // DO NOTHING keeps the first writer's row; the follow-up SELECT makes
        // every concurrent caller observe that same row.
        sqlx::query(
            r#"
            INSERT INTO research_sessions (id, owner, domain, phase, version, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (owner, domain) DO NOTHING
            "#,
        )
        .bind(candidate.id)
        .bind(&candidate.owner)
        .bind(&candidate.domain)
        .bind(candidate.phase.as_str())
        .bind(candidate.version)
        .bind(&record)
        .bind(candidate.created_at)
        .bind(candidate.updated_at)
        .execute(&self.pool)
        .await?;

        let (record,): (serde_json::Value,) = sqlx::query_as(
            "SELECT record FROM research_sessions WHERE owner = $1 AND domain = $2",
        )
        .bind(&candidate.owner)
        .bind(&candidate.domain)
        .fetch_one(&self.pool)
        .await?;

        Ok(serde_json::from_value(record)?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT record FROM research_sessions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(record,)| serde_json::from_value(record).map_err(StoreError::from))
            .transpose()
    }

    async fn save(&self, session: &Session, expected_version: i64) -> Result<Session> {
        let mut next = session.clone();
        next.version = expected_version + 1;
        let record = serde_json::to_value(&next)?;

        let updated = sqlx::query(
            r#"
            UPDATE research_sessions
            SET phase = $3, version = $4, record = $5, updated_at = $6
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(session.id)
        .bind(expected_version)
        .bind(next.phase.as_str())
        .bind(next.version)
        .bind(&record)
        .bind(next.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(next);
        }

        let actual: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM research_sessions WHERE id = $1")
                .bind(session.id)
                .fetch_optional(&self.pool)
                .await?;
        match actual {
            Some((actual,)) => {
                debug!(session_id = %session.id, expected_version, actual, "Stale session write");
                Err(StoreError::VersionConflict {
                    session_id: session.id,
                    expected: expected_version,
                    actual,
                })
            }
            None => Err(StoreError::SessionNotFound(session.id)),
        }
    }
}

// ---------------------------------------------------------------------------
// LockStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LockStore for PgStore {
    async fn try_acquire(&self, candidate: &ExecutionLock, now: DateTime<Utc>) -> Result<LockAttempt> {
        // Single-statement check-and-set: a row is only replaced when it is
        // released or expired. No row back means someone else holds the key.
        let acquired: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO execution_locks (lock_key, session_id, scraper_id, token, acquired_at, expires_at, released)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE)
            ON CONFLICT (lock_key) DO UPDATE
            SET session_id = EXCLUDED.session_id,
                scraper_id = EXCLUDED.scraper_id,
                token = EXCLUDED.token,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at,
                released = FALSE
            WHERE execution_locks.released OR execution_locks.expires_at <= $7
            RETURNING token
            "#,
        )
        .bind(&candidate.key)
        .bind(candidate.session_id)
        .bind(&candidate.scraper_id)
        .bind(candidate.token)
        .bind(candidate.acquired_at)
        .bind(candidate.expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if acquired.is_some_and(|(token,)| token == candidate.token) {
            return Ok(LockAttempt::Acquired(candidate.clone()));
        }

        // The holder may have released since; report it as it was seen.
        let holder: Option<LockRow> = sqlx::query_as(
            r#"
            SELECT lock_key, session_id, scraper_id, token, acquired_at, expires_at, released
            FROM execution_locks
            WHERE lock_key = $1
            "#,
        )
        .bind(&candidate.key)
        .fetch_optional(&self.pool)
        .await?;
        match holder {
            Some(row) => Ok(LockAttempt::Held(lock_from_row(row))),
            // purged in between; the key is free again
            None => self.try_acquire(candidate, now).await,
        }
    }

    async fn release(&self, key: &str, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let released = sqlx::query(
            r#"
            UPDATE execution_locks SET released = TRUE
            WHERE lock_key = $1 AND token = $2 AND NOT released AND expires_at > $3
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(released == 1)
    }

    async fn release_session(&self, session_id: Uuid) -> Result<u64> {
        let released = sqlx::query(
            "UPDATE execution_locks SET released = TRUE WHERE session_id = $1 AND NOT released",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(released)
    }

    async fn active(&self, key: &str, now: DateTime<Utc>) -> Result<Option<ExecutionLock>> {
        let row: Option<LockRow> = sqlx::query_as(
            r#"
            SELECT lock_key, session_id, scraper_id, token, acquired_at, expires_at, released
            FROM execution_locks
            WHERE lock_key = $1 AND NOT released AND expires_at > $2
            "#,
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(lock_from_row))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM execution_locks WHERE released OR expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// ResultCache
// ---------------------------------------------------------------------------

#[async_trait]
impl ResultCache for PgStore {
    async fn get(&self, execution_id: &str, now: DateTime<Utc>) -> Result<Option<CachedResult>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT payload FROM cached_results WHERE execution_id = $1 AND expires_at > $2",
        )
        .bind(execution_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(payload,)| serde_json::from_value(payload).map_err(StoreError::from))
            .transpose()
    }

    async fn put(&self, result: &CachedResult) -> Result<()> {
        let payload = serde_json::to_value(result)?;
        sqlx::query(
            r#"
            INSERT INTO cached_results (execution_id, session_id, payload, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (execution_id) DO UPDATE
            SET session_id = EXCLUDED.session_id,
                payload = EXCLUDED.payload,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            WHERE cached_results.expires_at <= EXCLUDED.created_at
            "#,
        )
        .bind(&result.execution_id)
        .bind(result.session_id)
        .bind(&payload)
        .bind(result.created_at)
        .bind(result.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_session(&self, session_id: Uuid) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM cached_results WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM cached_results WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// SnapshotLog
// ---------------------------------------------------------------------------

#[async_trait]
impl SnapshotLog for PgStore {
    async fn append(&self, snapshot: &SessionSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_snapshots (session_id, kind, version, payload, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(snapshot.session_id)
        .bind(snapshot.kind.as_str())
        .bind(snapshot.version)
        .bind(&snapshot.payload)
        .bind(snapshot.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, session_id: Uuid, kind: Option<SnapshotKind>) -> Result<Vec<SessionSnapshot>> {
        let rows: Vec<(String, i64, serde_json::Value, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT kind, version, payload, recorded_at
            FROM session_snapshots
            WHERE session_id = $1 AND ($2::TEXT IS NULL OR kind = $2)
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(kind, version, payload, recorded_at)| {
                let kind = kind
                    .parse::<SnapshotKind>()
                    .map_err(StoreError::InvalidRecord)?;
                Ok(SessionSnapshot {
                    session_id,
                    kind,
                    version,
                    payload,
                    recorded_at,
                })
            })
            .collect()
    }
}
