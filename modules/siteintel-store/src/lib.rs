//! Durable state for research sessions.
//!
//! One versioned record per (owner, domain), plus auxiliary records for
//! execution locks, cached execution results, and append-only snapshots.
//! Every backend implements the same four traits; Postgres for production,
//! an in-memory store for tests and single-process use.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod retry;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retry::RetryPolicy;
pub use traits::{LockAttempt, LockStore, ResultCache, SessionStore, SnapshotLog};
