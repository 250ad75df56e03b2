//! Escalation engine: human-in-the-loop decisions with SLA timers.
//!
//! The store row is authoritative; the KV carries three rebuildable
//! auxiliaries — a per-tenant pending set, a global timeout index sorted by
//! absolute deadline milliseconds, and a per-intent history list — plus a
//! TTL read cache. Losing the KV loses none of the workflow state;
//! `rebuild_indexes` reconstructs everything from the store.
//!
//! Resolution is two-phase: the escalation row transitions first (this
//! service owns those writes), then the parent intent is moved through the
//! state machine via the [`IntentDirectory`] capability. A stale second
//! phase (say the intent was cancelled while the human deliberated) is
//! logged and the escalation's own resolution stands.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{EscalationLink, IntentDirectory, TransitionFlags};
use crate::{
    breaker::{BreakerRegistry, CircuitBreaker},
    config::EscalationConfig,
    errors::{CoreError, CoreResult},
    kv::{KeyValueStore, keys},
    state::IntentStatus,
    store::{
        EscalationRepository,
        escalations::{Escalation, EscalationStatus, NewEscalation, ReasonCategory},
    },
    time::{Clock, parse_duration},
};

const BREAKER_NAME: &str = "escalation";
const SWEEP_BATCH: u64 = 500;

/// Request to open an escalation for an intent.
#[derive(Debug, Clone)]
pub struct CreateEscalation {
    pub intent_id: Uuid,
    pub tenant_id: String,
    pub reason: String,
    pub reason_category: ReasonCategory,
    pub escalated_to: String,
    pub escalated_by: Option<String>,
    /// ISO-8601 duration; the configured default applies when absent.
    pub timeout: Option<String>,
    pub context: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

/// Aggregate SLA counters for a tenant.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationStats {
    pub pending: u64,
    pub acknowledged: u64,
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub sla_breached: u64,
}

/// Human-in-the-loop escalation workflow over store rows + KV indices.
pub struct EscalationService {
    repo: EscalationRepository,
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: EscalationConfig,
    breaker: Arc<CircuitBreaker>,
    intents: OnceLock<Arc<dyn IntentDirectory>>,
}

impl EscalationService {
    pub fn new(
        repo: EscalationRepository,
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: EscalationConfig,
        breakers: &BreakerRegistry,
    ) -> Self {
        Self {
            repo,
            kv,
            clock,
            config,
            breaker: breakers.get(BREAKER_NAME),
            intents: OnceLock::new(),
        }
    }

    /// Late-bind the intent capability (breaks the constructor cycle).
    pub fn bind_intents(&self, intents: Arc<dyn IntentDirectory>) {
        let _ = self.intents.set(intents);
    }

    fn intents(&self) -> CoreResult<&Arc<dyn IntentDirectory>> {
        self.intents.get().ok_or_else(|| {
            CoreError::Internal("escalation service used before intent binding".to_string())
        })
    }

    fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.cache_ttl_secs)
    }

    async fn add_indices(&self, escalation: &Escalation) {
        let id = escalation.id.to_string();
        let results = [
            self.kv
                .set_add(&keys::escalation_pending(&escalation.tenant_id), &id)
                .await,
            self.kv
                .sorted_add(
                    keys::ESCALATION_TIMEOUTS,
                    escalation.timeout_at.timestamp_millis(),
                    &id,
                )
                .await,
            self.kv
                .list_push(&keys::escalation_by_intent(&escalation.intent_id.to_string()), &id)
                .await,
        ];
        for result in results {
            if let Err(err) = result {
                tracing::warn!(escalation = %id, error = %err, "failed to update escalation index");
            }
        }
    }

    async fn remove_pending_index(&self, escalation: &Escalation) {
        let id = escalation.id.to_string();
        if let Err(err) = self
            .kv
            .set_remove(&keys::escalation_pending(&escalation.tenant_id), &id)
            .await
        {
            tracing::warn!(escalation = %id, error = %err, "failed to trim pending index");
        }
    }

    async fn remove_timeout_index(&self, escalation: &Escalation) {
        let id = escalation.id.to_string();
        if let Err(err) = self.kv.sorted_remove(keys::ESCALATION_TIMEOUTS, &id).await {
            tracing::warn!(escalation = %id, error = %err, "failed to trim timeout index");
        }
    }

    async fn write_cache(&self, escalation: &Escalation) {
        match serde_json::to_string(escalation) {
            Ok(json) => {
                if let Err(err) = self
                    .kv
                    .set(
                        &keys::escalation_cache(&escalation.id.to_string()),
                        &json,
                        Some(self.cache_ttl()),
                    )
                    .await
                {
                    tracing::debug!(escalation = %escalation.id, error = %err, "cache write failed");
                }
            }
            Err(err) => {
                tracing::debug!(escalation = %escalation.id, error = %err, "cache serialize failed");
            }
        }
    }

    async fn drop_cache(&self, id: Uuid) {
        if let Err(err) = self
            .kv
            .delete(&keys::escalation_cache(&id.to_string()))
            .await
        {
            tracing::debug!(escalation = %id, error = %err, "cache invalidation failed");
        }
    }

    /// Open a pending escalation and start its SLA timer.
    pub async fn create(&self, request: CreateEscalation) -> CoreResult<Escalation> {
        let intent = self
            .intents()?
            .find_intent(request.intent_id, &request.tenant_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "intent",
                id: request.intent_id.to_string(),
            })?;
        if intent.status != IntentStatus::Escalated {
            return Err(CoreError::Conflict(format!(
                "intent `{}` is {}, not escalated",
                intent.id, intent.status
            )));
        }
        if let Some(open) = self.repo.find_open_by_intent(request.intent_id).await? {
            return Err(CoreError::Conflict(format!(
                "intent `{}` already has open escalation `{}`",
                request.intent_id, open.id
            )));
        }

        let timeout_text = request
            .timeout
            .clone()
            .unwrap_or_else(|| self.config.default_timeout.clone());
        let timeout_at = self.clock.now() + parse_duration(&timeout_text)?;

        let escalation = self
            .repo
            .insert(
                NewEscalation {
                    intent_id: request.intent_id,
                    tenant_id: request.tenant_id,
                    reason: request.reason,
                    reason_category: request.reason_category,
                    escalated_to: request.escalated_to,
                    escalated_by: request.escalated_by,
                    context: request.context,
                    metadata: request.metadata,
                },
                &timeout_text,
                timeout_at,
            )
            .await?;

        self.add_indices(&escalation).await;
        self.write_cache(&escalation).await;
        tracing::info!(
            escalation = %escalation.id,
            intent = %escalation.intent_id,
            category = escalation.reason_category.as_str(),
            deadline = %escalation.timeout_at,
            "escalation opened"
        );
        Ok(escalation)
    }

    /// Cache-first read, tenant-scoped. Store reads run behind the breaker.
    pub async fn get(&self, id: Uuid, tenant_id: &str) -> CoreResult<Escalation> {
        let not_found = || CoreError::NotFound {
            entity: "escalation",
            id: id.to_string(),
        };

        match self.kv.get(&keys::escalation_cache(&id.to_string())).await {
            Ok(Some(json)) => {
                if let Ok(escalation) = serde_json::from_str::<Escalation>(&json) {
                    if escalation.tenant_id == tenant_id {
                        return Ok(escalation);
                    }
                    return Err(not_found());
                }
                tracing::debug!(escalation = %id, "evicting undecodable cache entry");
                self.drop_cache(id).await;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(escalation = %id, error = %err, "cache read failed");
            }
        }

        let escalation = self
            .breaker
            .call(|| self.repo.find_by_id(id))
            .await?
            .ok_or_else(not_found)?;
        if escalation.tenant_id != tenant_id {
            return Err(not_found());
        }
        self.write_cache(&escalation).await;
        Ok(escalation)
    }

    /// `pending -> acknowledged`; stamps the acknowledger and drops the
    /// pending-index membership.
    pub async fn acknowledge(
        &self,
        id: Uuid,
        tenant_id: &str,
        acknowledged_by: &str,
    ) -> CoreResult<Escalation> {
        let current = self.get(id, tenant_id).await?;
        let updated = self
            .repo
            .acknowledge(id, acknowledged_by)
            .await?
            .ok_or_else(|| {
                CoreError::Conflict(format!(
                    "escalation `{id}` is {}, not pending",
                    current.status
                ))
            })?;

        self.remove_pending_index(&updated).await;
        self.write_cache(&updated).await;
        Ok(updated)
    }

    /// Approve the escalation and move the intent to `approved`.
    pub async fn approve(
        &self,
        id: Uuid,
        tenant_id: &str,
        resolved_by: &str,
        resolution_notes: Option<&str>,
    ) -> CoreResult<Escalation> {
        self.resolve(
            id,
            tenant_id,
            EscalationStatus::Approved,
            resolved_by,
            resolution_notes,
            Some(IntentStatus::Approved),
        )
        .await
    }

    /// Reject the escalation and move the intent to `denied`.
    pub async fn reject(
        &self,
        id: Uuid,
        tenant_id: &str,
        resolved_by: &str,
        resolution_notes: Option<&str>,
    ) -> CoreResult<Escalation> {
        self.resolve(
            id,
            tenant_id,
            EscalationStatus::Rejected,
            resolved_by,
            resolution_notes,
            Some(IntentStatus::Denied),
        )
        .await
    }

    /// Cancel the escalation itself. The intent is left untouched; a
    /// withdrawn intent cancels its escalation through this path, not the
    /// reverse.
    pub async fn cancel(
        &self,
        id: Uuid,
        tenant_id: &str,
        resolved_by: &str,
        resolution_notes: Option<&str>,
    ) -> CoreResult<Escalation> {
        self.resolve(
            id,
            tenant_id,
            EscalationStatus::Cancelled,
            resolved_by,
            resolution_notes,
            None,
        )
        .await
    }

    async fn resolve(
        &self,
        id: Uuid,
        tenant_id: &str,
        to: EscalationStatus,
        resolved_by: &str,
        resolution_notes: Option<&str>,
        intent_status: Option<IntentStatus>,
    ) -> CoreResult<Escalation> {
        let current = self.get(id, tenant_id).await?;
        if !current.status.is_open() {
            return Err(CoreError::Conflict(format!(
                "escalation `{id}` already resolved as {}",
                current.status
            )));
        }

        let sla_breached = is_sla_breached(self.clock.now(), current.timeout_at);
        let resolved = self
            .repo
            .resolve(id, to, resolved_by, resolution_notes, sla_breached)
            .await?
            .ok_or_else(|| {
                CoreError::Conflict(format!("escalation `{id}` resolved concurrently"))
            })?;

        self.remove_pending_index(&resolved).await;
        self.remove_timeout_index(&resolved).await;
        self.drop_cache(id).await;

        if let Some(status) = intent_status {
            let flags = TransitionFlags {
                expected_from: Some(IntentStatus::Escalated),
                reason: None,
                permission: true,
                actor: Some(resolved_by.to_string()),
            };
            if let Err(err) = self
                .intents()?
                .update_intent_status(resolved.intent_id, tenant_id, status, flags)
                .await
            {
                tracing::warn!(
                    escalation = %id,
                    intent = %resolved.intent_id,
                    target = status.as_str(),
                    error = %err,
                    "escalation resolved but intent linkage was stale"
                );
            }
        }

        if sla_breached {
            tracing::warn!(escalation = %id, "resolved past its SLA deadline");
        }
        Ok(resolved)
    }

    /// Sweep overdue escalations to `timeout`.
    ///
    /// The store scan is authoritative (the KV index may have been lost);
    /// conditional updates make the sweep safe to re-run, and the leader
    /// election around the scheduler keeps it single-flight.
    pub async fn process_timeouts(&self) -> CoreResult<Vec<Uuid>> {
        let now = self.clock.now();
        let overdue = self.repo.list_overdue(now, SWEEP_BATCH).await?;
        let mut processed = Vec::new();

        for escalation in overdue {
            if self.repo.mark_timeout(escalation.id).await? {
                self.remove_pending_index(&escalation).await;
                self.remove_timeout_index(&escalation).await;
                self.drop_cache(escalation.id).await;
                tracing::warn!(
                    escalation = %escalation.id,
                    intent = %escalation.intent_id,
                    deadline = %escalation.timeout_at,
                    "escalation timed out"
                );
                processed.push(escalation.id);
            }
        }
        Ok(processed)
    }

    /// Pending escalations for a tenant: index-first, store fallback.
    pub async fn list_pending(&self, tenant_id: &str) -> CoreResult<Vec<Escalation>> {
        let members = self
            .kv
            .set_members(&keys::escalation_pending(tenant_id))
            .await
            .unwrap_or_default();

        if !members.is_empty() {
            let mut pending = Vec::with_capacity(members.len());
            for member in members {
                let Ok(id) = Uuid::parse_str(&member) else {
                    continue;
                };
                if let Some(escalation) = self.repo.find_by_id(id).await? {
                    if escalation.status == EscalationStatus::Pending
                        && escalation.tenant_id == tenant_id
                    {
                        pending.push(escalation);
                    }
                }
            }
            pending.sort_by_key(|e| e.created_at);
            return Ok(pending);
        }
        self.repo.list_pending(tenant_id).await
    }

    /// Warm-reconstruct the KV indices from the store.
    pub async fn rebuild_indexes(&self, tenant_id: Option<&str>) -> CoreResult<u64> {
        let open = self.repo.list_open(tenant_id).await?;

        if tenant_id.is_none() {
            let _ = self.kv.delete(keys::ESCALATION_TIMEOUTS).await;
        }
        let mut cleared_tenants = std::collections::HashSet::new();
        for escalation in &open {
            if cleared_tenants.insert(escalation.tenant_id.clone()) {
                let _ = self
                    .kv
                    .delete(&keys::escalation_pending(&escalation.tenant_id))
                    .await;
            }
        }
        if let Some(tenant_id) = tenant_id {
            let _ = self.kv.delete(&keys::escalation_pending(tenant_id)).await;
        }

        let mut rebuilt = 0u64;
        for escalation in &open {
            let id = escalation.id.to_string();
            if escalation.status == EscalationStatus::Pending {
                self.kv
                    .set_add(&keys::escalation_pending(&escalation.tenant_id), &id)
                    .await?;
            }
            self.kv
                .sorted_add(
                    keys::ESCALATION_TIMEOUTS,
                    escalation.timeout_at.timestamp_millis(),
                    &id,
                )
                .await?;
            rebuilt += 1;
        }
        tracing::info!(rebuilt, tenant = tenant_id.unwrap_or("*"), "escalation indexes rebuilt");
        Ok(rebuilt)
    }

    /// Escalation history for one intent, oldest first.
    pub async fn list_by_intent(&self, intent_id: Uuid) -> CoreResult<Vec<Escalation>> {
        self.repo.list_by_intent(intent_id).await
    }

    /// SLA counters for a tenant; the per-status counts run concurrently.
    pub async fn sla_stats(&self, tenant_id: &str) -> CoreResult<EscalationStats> {
        let (pending, acknowledged, approved, rejected, timed_out, cancelled, sla_breached) =
            futures::try_join!(
                self.repo.count_status(tenant_id, EscalationStatus::Pending),
                self.repo.count_status(tenant_id, EscalationStatus::Acknowledged),
                self.repo.count_status(tenant_id, EscalationStatus::Approved),
                self.repo.count_status(tenant_id, EscalationStatus::Rejected),
                self.repo.count_status(tenant_id, EscalationStatus::Timeout),
                self.repo.count_status(tenant_id, EscalationStatus::Cancelled),
                self.repo.count_breached(tenant_id),
            )?;
        Ok(EscalationStats {
            pending,
            acknowledged,
            approved,
            rejected,
            timed_out,
            cancelled,
            sla_breached,
        })
    }

    /// Escalations due on or before `deadline_ms`, straight from the
    /// timeout index (operator tooling).
    pub async fn due_by(&self, deadline_ms: i64, limit: usize) -> CoreResult<Vec<Uuid>> {
        let members = self
            .kv
            .sorted_range_to(keys::ESCALATION_TIMEOUTS, deadline_ms, limit)
            .await?;
        Ok(members
            .iter()
            .filter_map(|m| Uuid::parse_str(m).ok())
            .collect())
    }
}

#[async_trait]
impl EscalationLink for EscalationService {
    async fn create_escalation(&self, request: CreateEscalation) -> CoreResult<Escalation> {
        self.create(request).await
    }

    async fn escalation_by_intent(&self, intent_id: Uuid) -> CoreResult<Option<Escalation>> {
        self.repo.find_open_by_intent(intent_id).await
    }
}

/// `sla_breached` as specified: strictly after the deadline.
pub fn is_sla_breached(resolved_at: chrono::DateTime<chrono::Utc>, timeout_at: chrono::DateTime<chrono::Utc>) -> bool {
    resolved_at > timeout_at
}
