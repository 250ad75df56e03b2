//! Durable queue adapter publishing accepted intents to downstream workers.
//!
//! One logical queue family per routing namespace, FIFO within a priority
//! band, idempotent on intent id. Delivery is at-least-once; consumers are
//! required to be idempotent (the store's state machine rejects replayed
//! transitions anyway).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreResult;

pub mod memory;
pub mod redis;

pub use memory::MemoryQueue;
pub use self::redis::RedisQueue;

/// Priority bands accepted by submissions (0 = lowest, 9 = highest).
pub const MAX_PRIORITY: u8 = 9;

/// The job shape consumed by evaluation workers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmissionJob {
    pub intent_id: Uuid,
    pub tenant_id: String,
    pub priority: u8,
    /// Propagated trace headers, when the host runs distributed tracing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_carrier: Option<HashMap<String, String>>,
}

/// Named, namespaced FIFO with persistence and priority.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Returns false when the intent id was already seen in
    /// this namespace (idempotent re-enqueue).
    async fn enqueue(&self, namespace: &str, job: &SubmissionJob) -> CoreResult<bool>;

    /// Pop the next job: highest priority band first, FIFO within a band.
    async fn dequeue(&self, namespace: &str) -> CoreResult<Option<SubmissionJob>>;

    /// Jobs currently waiting in the namespace.
    async fn depth(&self, namespace: &str) -> CoreResult<u64>;
}
