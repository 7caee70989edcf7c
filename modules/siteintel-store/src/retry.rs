use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::Result;

/// Bounded retry for transient store failures.
///
/// Delay is `base * 3^attempt` plus up to `base` of random jitter. Only errors
/// that report [`StoreError::is_transient`](crate::StoreError::is_transient)
/// are retried; everything else is returned on the first occurrence.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        if self.base.is_zero() {
            return Duration::ZERO;
        }
        let backoff = self.base * 3u32.pow(attempt);
        let jitter_ms = rand::rng().random_range(0..self.base.as_millis().max(1) as u64);
        backoff + Duration::from_millis(jitter_ms)
    }

    /// Run `f` until it succeeds, fails permanently, or attempts run out.
    /// Returns the last error together with how many attempts were made.
    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> std::result::Result<T, (crate::StoreError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < max => {
                    let delay = self.backoff(attempt);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store error, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err((e, attempt + 1)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = RetryPolicy::immediate(3)
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Unavailable("blip".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let out: std::result::Result<(), _> = RetryPolicy::immediate(2)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("down".into()))
            })
            .await;
        let (err, attempts) = out.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: std::result::Result<(), _> = RetryPolicy::immediate(5)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::SessionNotFound(uuid::Uuid::nil()))
            })
            .await;
        assert_eq!(out.unwrap_err().1, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
