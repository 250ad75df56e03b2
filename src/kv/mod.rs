//! Key-value adapter: locks, hot caches, and rebuildable indices.
//!
//! The store is the source of truth; the KV plays exactly three roles —
//! distributed locks, TTL caches, and auxiliary indices that can always be
//! reconstructed from the store. Every operation the services need is
//! expressed on the [`KeyValueStore`] trait so the Redis-backed production
//! implementation and the in-process implementation are interchangeable.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::CoreResult;

pub mod leader;
pub mod lock;
pub mod memory;
pub mod redis;

pub use leader::LeaderElector;
pub use lock::{LockGuard, LockManager};
pub use memory::MemoryKv;
pub use self::redis::RedisKv;

/// Storage-level key-value operations.
///
/// This trait only covers the primitives the core needs; it is not a Redis
/// facade. Implementations must make each operation atomic on its key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a string value, honoring expiry.
    async fn get(&self, key: &str) -> CoreResult<Option<String>>;

    /// Set a string value with an optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CoreResult<()>;

    /// Set only if the key is absent, with a TTL. Returns true on acquire.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool>;

    /// Delete a key. Returns true when something was removed.
    async fn delete(&self, key: &str) -> CoreResult<bool>;

    /// Delete the key only while it still holds `value` (lock release).
    async fn delete_if_value(&self, key: &str, value: &str) -> CoreResult<bool>;

    /// Refresh the TTL only while the key still holds `value` (lease
    /// heartbeat). Returns false when ownership was lost.
    async fn expire_if_value(&self, key: &str, value: &str, ttl: Duration) -> CoreResult<bool>;

    /// Add a member to an unordered set.
    async fn set_add(&self, key: &str, member: &str) -> CoreResult<()>;

    /// Remove a member from an unordered set.
    async fn set_remove(&self, key: &str, member: &str) -> CoreResult<()>;

    /// All members of an unordered set.
    async fn set_members(&self, key: &str) -> CoreResult<Vec<String>>;

    /// Add (or rescore) a member in a score-ordered set.
    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> CoreResult<()>;

    /// Remove a member from a score-ordered set.
    async fn sorted_remove(&self, key: &str, member: &str) -> CoreResult<()>;

    /// Members with `score <= max_score`, ascending, capped at `limit`.
    async fn sorted_range_to(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> CoreResult<Vec<String>>;

    /// Append a value to a list.
    async fn list_push(&self, key: &str, value: &str) -> CoreResult<()>;

    /// The whole list, oldest first.
    async fn list_range(&self, key: &str) -> CoreResult<Vec<String>>;

    /// Remove all occurrences of a value from a list.
    async fn list_remove(&self, key: &str, value: &str) -> CoreResult<()>;
}

/// Well-known key layouts shared by services and operators.
pub mod keys {
    /// Distributed lock for one submission fingerprint.
    pub fn dedupe_lock(tenant_id: &str, dedupe_hash: &str) -> String {
        format!("intent:dedupe:{tenant_id}:{dedupe_hash}")
    }

    /// Informational fast-path marker for a recent fingerprint.
    pub fn dedupe_marker(tenant_id: &str, dedupe_hash: &str) -> String {
        format!("intent:dedupe:marker:{tenant_id}:{dedupe_hash}")
    }

    /// Escalation read cache.
    pub fn escalation_cache(escalation_id: &str) -> String {
        format!("escalation:cache:{escalation_id}")
    }

    /// Per-tenant pending escalation index (unordered set).
    pub fn escalation_pending(tenant_id: &str) -> String {
        format!("escalation:idx:pending:{tenant_id}")
    }

    /// Global timeout index (sorted by deadline millis).
    pub const ESCALATION_TIMEOUTS: &str = "escalation:idx:timeouts";

    /// Per-intent escalation history (ordered list).
    pub fn escalation_by_intent(intent_id: &str) -> String {
        format!("escalation:idx:intent:{intent_id}")
    }

    /// Scheduler leader lease.
    pub const SCHEDULER_LEADER: &str = "scheduler:leader";
}
