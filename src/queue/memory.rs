//! In-process [`JobQueue`] for tests and single-node deployments.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use uuid::Uuid;

use super::{JobQueue, SubmissionJob};
use crate::errors::CoreResult;

#[derive(Default)]
struct NamespaceState {
    seen: HashSet<Uuid>,
    // priority -> FIFO of jobs in that band
    bands: BTreeMap<u8, VecDeque<SubmissionJob>>,
}

/// Mutex-guarded queue keyed by namespace.
#[derive(Default)]
pub struct MemoryQueue {
    namespaces: Mutex<HashMap<String, NamespaceState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, namespace: &str, job: &SubmissionJob) -> CoreResult<bool> {
        let mut namespaces = self.namespaces.lock().expect("queue poisoned");
        let state = namespaces.entry(namespace.to_string()).or_default();
        if !state.seen.insert(job.intent_id) {
            return Ok(false);
        }
        state
            .bands
            .entry(job.priority)
            .or_default()
            .push_back(job.clone());
        Ok(true)
    }

    async fn dequeue(&self, namespace: &str) -> CoreResult<Option<SubmissionJob>> {
        let mut namespaces = self.namespaces.lock().expect("queue poisoned");
        let Some(state) = namespaces.get_mut(namespace) else {
            return Ok(None);
        };
        // Highest band first.
        let band = state
            .bands
            .iter_mut()
            .rev()
            .find(|(_, jobs)| !jobs.is_empty())
            .map(|(priority, _)| *priority);
        Ok(band.and_then(|priority| {
            state
                .bands
                .get_mut(&priority)
                .and_then(VecDeque::pop_front)
        }))
    }

    async fn depth(&self, namespace: &str) -> CoreResult<u64> {
        let namespaces = self.namespaces.lock().expect("queue poisoned");
        Ok(namespaces
            .get(namespace)
            .map(|state| state.bands.values().map(|jobs| jobs.len() as u64).sum())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u128, priority: u8) -> SubmissionJob {
        SubmissionJob {
            intent_id: Uuid::from_u128(id),
            tenant_id: "T1".to_string(),
            priority,
            trace_carrier: None,
        }
    }

    #[tokio::test]
    async fn test_priority_bands_drain_high_first() {
        let queue = MemoryQueue::new();
        queue.enqueue("default", &job(1, 0)).await.expect("enqueue");
        queue.enqueue("default", &job(2, 9)).await.expect("enqueue");
        queue.enqueue("default", &job(3, 5)).await.expect("enqueue");

        let order: Vec<u128> = [
            queue.dequeue("default").await.expect("dequeue"),
            queue.dequeue("default").await.expect("dequeue"),
            queue.dequeue("default").await.expect("dequeue"),
        ]
        .into_iter()
        .map(|j| j.expect("job").intent_id.as_u128())
        .collect();

        assert_eq!(order, vec![2, 3, 1]);
        assert!(queue.dequeue("default").await.expect("dequeue").is_none());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_namespace() {
        let queue = MemoryQueue::new();
        assert!(queue.enqueue("default", &job(1, 0)).await.expect("enqueue"));
        assert!(!queue.enqueue("default", &job(1, 0)).await.expect("enqueue"));
        assert_eq!(queue.depth("default").await.expect("depth"), 1);

        // A different namespace is a different queue family.
        assert!(queue.enqueue("billing", &job(1, 0)).await.expect("enqueue"));
    }
}
