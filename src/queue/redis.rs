//! Redis-backed [`JobQueue`] implementation.
//!
//! Layout per namespace:
//! - `queue:{ns}:p{priority}` — one persistent list per priority band
//! - `queue:{ns}:seen` — set of intent ids for idempotent enqueue
//!
//! Dequeue walks bands from highest to lowest. Persistence and delivery
//! semantics are Redis's (RDB/AOF as deployed); the control plane only
//! requires that an enqueue acknowledged here survives a process restart.

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

use super::{JobQueue, MAX_PRIORITY, SubmissionJob};
use crate::errors::CoreResult;

#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
}

impl RedisQueue {
    pub async fn connect(url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(crate::errors::CoreError::from)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(crate::errors::CoreError::from)?;
        Ok(Self { manager })
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    fn band_key(namespace: &str, priority: u8) -> String {
        format!("queue:{namespace}:p{priority}")
    }

    fn seen_key(namespace: &str) -> String {
        format!("queue:{namespace}:seen")
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, namespace: &str, job: &SubmissionJob) -> CoreResult<bool> {
        let mut con = self.manager.clone();
        let fresh: i64 = con
            .sadd(Self::seen_key(namespace), job.intent_id.to_string())
            .await?;
        if fresh == 0 {
            return Ok(false);
        }
        let payload = serde_json::to_string(job)?;
        let priority = job.priority.min(MAX_PRIORITY);
        let _: i64 = con.rpush(Self::band_key(namespace, priority), payload).await?;
        Ok(true)
    }

    async fn dequeue(&self, namespace: &str) -> CoreResult<Option<SubmissionJob>> {
        let mut con = self.manager.clone();
        for priority in (0..=MAX_PRIORITY).rev() {
            let popped: Option<String> = con.lpop(Self::band_key(namespace, priority), None).await?;
            if let Some(raw) = popped {
                return Ok(Some(serde_json::from_str(&raw)?));
            }
        }
        Ok(None)
    }

    async fn depth(&self, namespace: &str) -> CoreResult<u64> {
        let mut con = self.manager.clone();
        let mut total = 0u64;
        for priority in 0..=MAX_PRIORITY {
            let len: u64 = con.llen(Self::band_key(namespace, priority)).await?;
            total += len;
        }
        Ok(total)
    }
}
