//! Execution locks over (session, scraper, URL set).
//!
//! The key is a sha256 over the session id, scraper id and the sorted,
//! canonicalised URL set, so the same material in any order or spelling maps
//! to the same lock. Acquisition never waits: callers get a token or `Busy`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use siteintel_common::ExecutionLock;
use siteintel_store::{LockAttempt, LockStore, RetryPolicy};

use crate::error::{EngineError, Result};

/// Lowercase scheme and host, drop fragments, default ports and trailing
/// slashes on non-root paths. Unparseable input is only trimmed.
pub fn canonicalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = url::Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    url.set_fragment(None);
    // Url::parse already lowercases scheme/host and strips default ports.
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    url.to_string()
}

/// Sorted, de-duplicated canonical URL set.
pub fn canonical_url_set(urls: &[String]) -> Vec<String> {
    urls.iter()
        .map(|u| canonicalize_url(u))
        .filter(|u| !u.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn lock_key(session_id: Uuid, scraper_id: &str, urls: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(scraper_id.as_bytes());
    for url in canonical_url_set(urls) {
        hasher.update(b"\x1e");
        hasher.update(url.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Proof of holding a lock. Release is idempotent.
#[derive(Debug, Clone, PartialEq)]
pub struct LockToken {
    pub key: String,
    pub token: Uuid,
    pub session_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Acquisition {
    Acquired(LockToken),
    Busy { remaining: Duration },
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    ttl: Duration,
    retry: RetryPolicy,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, ttl: Duration, retry: RetryPolicy) -> Self {
        Self { store, ttl, retry }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn acquire(
        &self,
        session_id: Uuid,
        scraper_id: &str,
        urls: &[String],
        now: DateTime<Utc>,
    ) -> Result<Acquisition> {
        let key = lock_key(session_id, scraper_id, urls);
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(30));
        let candidate = ExecutionLock {
            key: key.clone(),
            session_id,
            scraper_id: scraper_id.to_string(),
            token: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + ttl,
            released: false,
        };

        let attempt = self
            .retry
            .run("acquire_lock", || self.store.try_acquire(&candidate, now))
            .await
            .map_err(|(e, attempts)| EngineError::persistence(e, attempts))?;

        match attempt {
            LockAttempt::Acquired(lock) => {
                debug!(session_id = %session_id, scraper = scraper_id, key = %key, "Execution lock acquired");
                Ok(Acquisition::Acquired(LockToken {
                    key: lock.key,
                    token: lock.token,
                    session_id,
                    expires_at: lock.expires_at,
                }))
            }
            LockAttempt::Held(holder) => {
                let remaining = (holder.expires_at - now).to_std().unwrap_or(Duration::ZERO);
                debug!(
                    session_id = %session_id,
                    scraper = scraper_id,
                    remaining_ms = remaining.as_millis() as u64,
                    "Execution lock busy"
                );
                Ok(Acquisition::Busy { remaining })
            }
        }
    }

    /// Returns whether this call released an active lock. Releasing a lock
    /// that already expired or was released is a no-op.
    pub async fn release(&self, token: &LockToken, now: DateTime<Utc>) -> Result<bool> {
        self.retry
            .run("release_lock", || self.store.release(&token.key, token.token, now))
            .await
            .map_err(|(e, attempts)| EngineError::persistence(e, attempts))
    }

    pub async fn release_session(&self, session_id: Uuid) -> Result<u64> {
        self.retry
            .run("release_session_locks", || self.store.release_session(session_id))
            .await
            .map_err(|(e, attempts)| EngineError::persistence(e, attempts))
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        Ok(self.store.purge_expired(now).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siteintel_store::MemoryStore;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn key_ignores_order_case_and_fragments() {
        let session = Uuid::new_v4();
        let a = lock_key(session, "basic", &urls(&["https://Acme.com/about/", "https://acme.com/"]));
        let b = lock_key(session, "basic", &urls(&["https://acme.com", "https://acme.com/about#team"]));
        assert_eq!(a, b);
    }

    #[test]
    fn key_differs_by_scraper_and_session() {
        let session = Uuid::new_v4();
        let set = urls(&["https://acme.com/"]);
        assert_ne!(lock_key(session, "basic", &set), lock_key(session, "ai", &set));
        assert_ne!(lock_key(session, "basic", &set), lock_key(Uuid::new_v4(), "basic", &set));
    }

    #[test]
    fn canonical_set_dedups() {
        let set = canonical_url_set(&urls(&["https://acme.com/a/", "https://ACME.com/a", "  "]));
        assert_eq!(set, vec!["https://acme.com/a".to_string()]);
    }

    #[tokio::test]
    async fn second_acquire_is_busy_with_remaining_ttl() {
        let manager = LockManager::new(Arc::new(MemoryStore::new()), Duration::from_secs(30), RetryPolicy::immediate(3));
        let session = Uuid::new_v4();
        let set = urls(&["https://acme.com/"]);
        let now = Utc::now();

        let Acquisition::Acquired(token) = manager.acquire(session, "basic", &set, now).await.unwrap() else {
            panic!("first acquire should succeed");
        };
        let later = now + chrono::Duration::seconds(10);
        match manager.acquire(session, "basic", &set, later).await.unwrap() {
            Acquisition::Busy { remaining } => assert_eq!(remaining, Duration::from_secs(20)),
            other => panic!("expected Busy, got {other:?}"),
        }

        assert!(manager.release(&token, later).await.unwrap());
        assert!(!manager.release(&token, later).await.unwrap());
        assert!(matches!(
            manager.acquire(session, "basic", &set, later).await.unwrap(),
            Acquisition::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn expired_lock_is_treated_as_absent() {
        let manager = LockManager::new(Arc::new(MemoryStore::new()), Duration::from_secs(30), RetryPolicy::immediate(3));
        let session = Uuid::new_v4();
        let set = urls(&["https://acme.com/"]);
        let now = Utc::now();

        let Acquisition::Acquired(stale) = manager.acquire(session, "basic", &set, now).await.unwrap() else {
            panic!("first acquire should succeed");
        };
        let after_ttl = now + chrono::Duration::seconds(31);
        assert!(matches!(
            manager.acquire(session, "basic", &set, after_ttl).await.unwrap(),
            Acquisition::Acquired(_)
        ));
        // the stale holder's release must not free the new lock
        assert!(!manager.release(&stale, after_ttl).await.unwrap());
    }
}
