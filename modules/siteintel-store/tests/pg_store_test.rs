//! Integration tests for PgStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use chrono::{Duration, Utc};
use siteintel_common::{ExecutionLock, Session, SessionSnapshot, SnapshotKind};
use siteintel_store::{LockAttempt, LockStore, PgStore, SessionStore, SnapshotLog, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

/// Get a migrated store, or skip if no test DB is available.
async fn test_store() -> Option<PgStore> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    let store = PgStore::new(pool);
    store.migrate().await.ok()?;
    Some(store)
}

/// Owners are unique per test so tests can share one database concurrently.
fn fresh_session() -> Session {
    Session::new(&format!("owner-{}", Uuid::new_v4()), "acme.com", 500, Utc::now())
}

// =========================================================================
// Sessions
// =========================================================================

#[tokio::test]
async fn concurrent_create_or_get_converges_on_one_session() {
    let Some(store) = test_store().await else {
        return;
    };
    let base = fresh_session();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let mut candidate = base.clone();
        candidate.id = Uuid::new_v4();
        handles.push(tokio::spawn(async move {
            store.create_or_get(&candidate).await.unwrap().id
        }));
    }

    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn stale_save_is_rejected_with_actual_version() {
    let Some(store) = test_store().await else {
        return;
    };
    let session = store.create_or_get(&fresh_session()).await.unwrap();

    let mut edited = session.clone();
    edited.budget_cents = 900;
    let saved = store.save(&edited, 0).await.unwrap();
    assert_eq!(saved.version, 1);

    let err = store.save(&session, 0).await.unwrap_err();
    assert!(matches!(err, StoreError::VersionConflict { actual: 1, .. }));

    let reloaded = store.get(session.id).await.unwrap().unwrap();
    assert_eq!(reloaded.budget_cents, 900);
    assert_eq!(reloaded.version, 1);
}

// =========================================================================
// Locks
// =========================================================================

#[tokio::test]
async fn lock_upsert_only_replaces_free_rows() {
    let Some(store) = test_store().await else {
        return;
    };
    let now = Utc::now();
    let key = format!("lock-{}", Uuid::new_v4());
    let make = |at| ExecutionLock {
        key: key.clone(),
        session_id: Uuid::new_v4(),
        scraper_id: "basic".into(),
        token: Uuid::new_v4(),
        acquired_at: at,
        expires_at: at + Duration::seconds(30),
        released: false,
    };

    let first = make(now);
    assert!(matches!(
        store.try_acquire(&first, now).await.unwrap(),
        LockAttempt::Acquired(_)
    ));

    let second = make(now);
    match store.try_acquire(&second, now).await.unwrap() {
        LockAttempt::Held(holder) => assert_eq!(holder.token, first.token),
        other => panic!("expected Held, got {other:?}"),
    }

    assert!(store.release(&key, first.token, now).await.unwrap());
    assert!(matches!(
        store.try_acquire(&second, now).await.unwrap(),
        LockAttempt::Acquired(_)
    ));

    let later = now + Duration::seconds(45);
    let third = make(later);
    assert!(matches!(
        store.try_acquire(&third, later).await.unwrap(),
        LockAttempt::Acquired(_)
    ));
}

// =========================================================================
// Snapshots
// =========================================================================

#[tokio::test]
async fn snapshots_come_back_in_append_order() {
    let Some(store) = test_store().await else {
        return;
    };
    let session_id = Uuid::new_v4();
    for version in 1..=3 {
        store
            .append(&SessionSnapshot {
                session_id,
                kind: SnapshotKind::Cost,
                version,
                payload: serde_json::json!({ "total_cents": version * 10 }),
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    let cost = store.list(session_id, Some(SnapshotKind::Cost)).await.unwrap();
    assert_eq!(cost.iter().map(|s| s.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(store
        .list(session_id, Some(SnapshotKind::Routing))
        .await
        .unwrap()
        .is_empty());
}
