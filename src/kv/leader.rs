//! Leader election over a KV lease.
//!
//! A fleet of scheduler instances all call [`LeaderElector::try_acquire`]
//! on a shared key; exactly one wins the lease and keeps it alive by
//! heartbeating. Followers probe on the same interval and take over when
//! the lease lapses. Losing the KV only pauses scheduled work until a new
//! lease is written; it never corrupts state.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::KeyValueStore;
use crate::{errors::CoreResult, time::Clock};

/// Lease record written by the current leader.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct LeaseRecord {
    instance_id: String,
    heartbeat_at_ms: i64,
}

/// One participant in the election.
pub struct LeaderElector {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    key: String,
    instance_id: String,
    ttl: Duration,
    leading: AtomicBool,
}

impl LeaderElector {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            kv,
            clock,
            key: key.into(),
            instance_id: Uuid::new_v4().to_string(),
            ttl,
            leading: AtomicBool::new(false),
        }
    }

    /// Stable identity of this participant.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Whether this instance currently believes it leads.
    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    fn lease_value(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(&LeaseRecord {
            instance_id: self.instance_id.clone(),
            heartbeat_at_ms: self.clock.now_millis(),
        })?)
    }

    fn holds(&self, raw: &str) -> bool {
        serde_json::from_str::<LeaseRecord>(raw)
            .map(|lease| lease.instance_id == self.instance_id)
            .unwrap_or(false)
    }

    /// Probe for leadership. Acquires the lease when free, renews it when
    /// already held by this instance. Returns the resulting leadership.
    pub async fn try_acquire(&self) -> CoreResult<bool> {
        if self.kv.set_nx(&self.key, &self.lease_value()?, self.ttl).await? {
            if !self.leading.swap(true, Ordering::SeqCst) {
                tracing::info!(instance = %self.instance_id, key = %self.key, "acquired leadership");
            }
            return Ok(true);
        }

        match self.kv.get(&self.key).await? {
            Some(raw) if self.holds(&raw) => self.heartbeat().await,
            _ => {
                if self.leading.swap(false, Ordering::SeqCst) {
                    tracing::warn!(instance = %self.instance_id, "lost leadership to another instance");
                }
                Ok(false)
            }
        }
    }

    /// Refresh the lease while still the holder. The renewal is conditional
    /// on the stored value, so a lapsed lease taken by another instance is
    /// never clobbered.
    pub async fn heartbeat(&self) -> CoreResult<bool> {
        let current = self.kv.get(&self.key).await?;
        let renewed = match current {
            Some(raw) if self.holds(&raw) => {
                self.kv.expire_if_value(&self.key, &raw, self.ttl).await?
            }
            _ => false,
        };

        let was_leading = self.leading.swap(renewed, Ordering::SeqCst);
        if was_leading && !renewed {
            tracing::warn!(instance = %self.instance_id, "leadership lease lapsed");
        }
        Ok(renewed)
    }

    /// Voluntarily give up the lease (clean shutdown).
    pub async fn resign(&self) -> CoreResult<()> {
        if let Some(raw) = self.kv.get(&self.key).await? {
            if self.holds(&raw) {
                self.kv.delete_if_value(&self.key, &raw).await?;
            }
        }
        if self.leading.swap(false, Ordering::SeqCst) {
            tracing::info!(instance = %self.instance_id, "resigned leadership");
        }
        Ok(())
    }
}
