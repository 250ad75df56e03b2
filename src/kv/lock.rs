//! Distributed lock with lease and jitter backoff.
//!
//! The submission pipeline serializes work per dedupe fingerprint through
//! this lock. The lease bounds how long a crashed holder can block others;
//! the unique store index remains the final guard, so a lost lock degrades
//! to a duplicate-detection race the store still wins.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;

use super::KeyValueStore;
use crate::{config::LockConfig, errors::CoreResult};

/// A held lock. Release is explicit; the lease expires it otherwise.
pub struct LockGuard {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Release the lock if this guard still owns it.
    ///
    /// Failure to release is logged and recoverable: the lease expires on
    /// its own and the store's unique index backstops correctness.
    pub async fn release(mut self) {
        self.released = true;
        match self.kv.delete_if_value(&self.key, &self.token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(key = %self.key, "lock already expired at release");
            }
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "failed to release lock");
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(key = %self.key, "lock guard dropped without release; lease will expire it");
        }
    }
}

/// Acquires leased locks with capped exponential backoff and jitter.
#[derive(Clone)]
pub struct LockManager {
    kv: Arc<dyn KeyValueStore>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        Self { kv, config }
    }

    /// Try to acquire `key` within the configured wait ceiling.
    ///
    /// Returns `None` when the ceiling elapses without an acquire; the
    /// caller decides whether that is a duplicate or a contention error.
    pub async fn acquire(&self, key: &str) -> CoreResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let lease = Duration::from_secs(self.config.lease_secs);
        let deadline = Instant::now() + Duration::from_millis(self.config.acquire_wait_ms);
        let mut backoff = Duration::from_millis(self.config.backoff_initial_ms.max(1));
        let cap = Duration::from_millis(self.config.backoff_cap_ms.max(1));

        loop {
            if self.kv.set_nx(key, &token, lease).await? {
                return Ok(Some(LockGuard {
                    kv: Arc::clone(&self.kv),
                    key: key.to_string(),
                    token,
                    released: false,
                }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }

            let step = self.jittered(backoff);
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(step.min(remaining)).await;
            backoff = (backoff * 2).min(cap);
        }
    }

    fn jittered(&self, step: Duration) -> Duration {
        let jitter_span = step.as_millis() as u64 * u64::from(self.config.jitter_pct) / 100;
        if jitter_span == 0 {
            return step;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_span);
        step + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{kv::MemoryKv, time::ManualClock};

    fn manager(kv: Arc<MemoryKv>, wait_ms: u64) -> LockManager {
        LockManager::new(
            kv,
            LockConfig {
                lease_secs: 30,
                acquire_wait_ms: wait_ms,
                backoff_initial_ms: 5,
                backoff_cap_ms: 20,
                jitter_pct: 25,
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv = Arc::new(MemoryKv::new(clock));
        let manager = manager(Arc::clone(&kv), 50);

        let guard = manager
            .acquire("intent:dedupe:T1:abc")
            .await
            .expect("acquire")
            .expect("granted");
        guard.release().await;

        assert!(
            manager
                .acquire("intent:dedupe:T1:abc")
                .await
                .expect("acquire")
                .is_some(),
            "released lock is reacquirable"
        );
    }

    #[tokio::test]
    async fn test_contention_times_out() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv = Arc::new(MemoryKv::new(clock));
        let manager = manager(Arc::clone(&kv), 40);

        let held = manager
            .acquire("intent:dedupe:T1:abc")
            .await
            .expect("acquire")
            .expect("granted");

        let second = manager.acquire("intent:dedupe:T1:abc").await.expect("acquire");
        assert!(second.is_none(), "second caller hits the wait ceiling");

        held.release().await;
    }

    #[tokio::test]
    async fn test_expired_lease_is_reacquirable() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let kv = Arc::new(MemoryKv::new(Arc::clone(&clock) as Arc<dyn crate::time::Clock>));
        let manager = manager(Arc::clone(&kv), 40);

        let _held = manager
            .acquire("intent:dedupe:T1:abc")
            .await
            .expect("acquire")
            .expect("granted");

        clock.advance(chrono::Duration::seconds(31));
        assert!(
            manager
                .acquire("intent:dedupe:T1:abc")
                .await
                .expect("acquire")
                .is_some(),
            "lease expiry frees the key"
        );
    }
}
