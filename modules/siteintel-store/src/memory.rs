//! In-process backend. Same semantics as `PgStore`, guarded by mutexes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use siteintel_common::{CachedResult, ExecutionLock, Session, SessionSnapshot, SnapshotKind};

use crate::error::{Result, StoreError};
use crate::traits::{LockAttempt, LockStore, ResultCache, SessionStore, SnapshotLog};

#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<Uuid, Session>>,
    locks: Mutex<HashMap<String, ExecutionLock>>,
    cache: Mutex<HashMap<String, CachedResult>>,
    snapshots: Mutex<Vec<SessionSnapshot>>,
    /// Number of upcoming session writes that fail with `Unavailable`.
    fail_writes: AtomicU32,
}

fn guard<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` session saves fail with a transient error.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Every lock row, released or not. Test inspection only.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn lock_rows(&self) -> Vec<ExecutionLock> {
        self.locks
            .lock()
            .map(|l| l.values().cloned().collect())
            .unwrap_or_default()
    }

    fn take_injected_failure(&self) -> Result<()> {
        let taken = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Unavailable("injected write failure".into())),
            Err(_) => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_or_get(&self, candidate: &Session) -> Result<Session> {
        let mut sessions = guard(&self.sessions)?;
        if let Some(existing) = sessions
            .values()
            .find(|s| s.owner == candidate.owner && s.domain == candidate.domain)
        {
            return Ok(existing.clone());
        }
        sessions.insert(candidate.id, candidate.clone());
        Ok(candidate.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(guard(&self.sessions)?.get(&id).cloned())
    }

    async fn save(&self, session: &Session, expected_version: i64) -> Result<Session> {
        self.take_injected_failure()?;
        let mut sessions = guard(&self.sessions)?;
        let stored = sessions
            .get_mut(&session.id)
            .ok_or(StoreError::SessionNotFound(session.id))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                session_id: session.id,
                expected: expected_version,
                actual: stored.version,
            });
        }
        let mut next = session.clone();
        next.version = expected_version + 1;
        *stored = next.clone();
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// LockStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(&self, candidate: &ExecutionLock, now: DateTime<Utc>) -> Result<LockAttempt> {
        let mut locks = guard(&self.locks)?;
        if let Some(existing) = locks.get(&candidate.key) {
            if existing.is_active(now) {
                return Ok(LockAttempt::Held(existing.clone()));
            }
        }
        locks.insert(candidate.key.clone(), candidate.clone());
        Ok(LockAttempt::Acquired(candidate.clone()))
    }

    async fn release(&self, key: &str, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut locks = guard(&self.locks)?;
        match locks.get_mut(key) {
            Some(lock) if lock.token == token && lock.is_active(now) => {
                lock.released = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_session(&self, session_id: Uuid) -> Result<u64> {
        let mut locks = guard(&self.locks)?;
        let mut released = 0;
        for lock in locks.values_mut() {
            if lock.session_id == session_id && !lock.released {
                lock.released = true;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn active(&self, key: &str, now: DateTime<Utc>) -> Result<Option<ExecutionLock>> {
        Ok(guard(&self.locks)?
            .get(key)
            .filter(|l| l.is_active(now))
            .cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut locks = guard(&self.locks)?;
        let before = locks.len();
        locks.retain(|_, l| l.is_active(now));
        Ok((before - locks.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// ResultCache
// ---------------------------------------------------------------------------

#[async_trait]
impl ResultCache for MemoryStore {
    async fn get(&self, execution_id: &str, now: DateTime<Utc>) -> Result<Option<CachedResult>> {
        Ok(guard(&self.cache)?
            .get(execution_id)
            .filter(|r| r.expires_at > now)
            .cloned())
    }

    async fn put(&self, result: &CachedResult) -> Result<()> {
        let mut cache = guard(&self.cache)?;
        let keep_existing = cache
            .get(&result.execution_id)
            .is_some_and(|r| r.expires_at > result.created_at);
        if !keep_existing {
            cache.insert(result.execution_id.clone(), result.clone());
        }
        Ok(())
    }

    async fn clear_session(&self, session_id: Uuid) -> Result<u64> {
        let mut cache = guard(&self.cache)?;
        let before = cache.len();
        cache.retain(|_, r| r.session_id != session_id);
        Ok((before - cache.len()) as u64)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut cache = guard(&self.cache)?;
        let before = cache.len();
        cache.retain(|_, r| r.expires_at > now);
        Ok((before - cache.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// SnapshotLog
// ---------------------------------------------------------------------------

#[async_trait]
impl SnapshotLog for MemoryStore {
    async fn append(&self, snapshot: &SessionSnapshot) -> Result<()> {
        guard(&self.snapshots)?.push(snapshot.clone());
        Ok(())
    }

    async fn list(&self, session_id: Uuid, kind: Option<SnapshotKind>) -> Result<Vec<SessionSnapshot>> {
        Ok(guard(&self.snapshots)?
            .iter()
            .filter(|s| s.session_id == session_id && kind.is_none_or(|k| s.kind == k))
            .cloned()
            .collect())
    }
}
