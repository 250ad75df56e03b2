//! Intent service: submission orchestration and lifecycle transitions.
//!
//! # Submission pipeline
//!
//! ```text
//!  validate → consent gate → trust gate → fingerprint → dup lookup
//!    → tenant cap → lock(fingerprint) → recheck → redact → encrypt
//!    → insert intent + intent.submitted event (one txn) → unlock → enqueue
//! ```
//!
//! Every step either completes or returns a typed error without advancing.
//! Two concurrent submissions of the same fingerprint are linearized by the
//! distributed lock, with the partial unique index on
//! `(tenant_id, dedupe_hash)` as the final guard: one caller inserts, the
//! other gets the existing row back as a duplicate.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::{EscalationLink, IntentDirectory, OpContext, TransitionFlags};
use crate::{
    config::CoreConfig,
    crypto::{PayloadCipher, canonical_json_bytes, dedupe_fingerprint},
    errors::{CoreError, CoreResult},
    kv::{KeyValueStore, LockManager, keys},
    queue::{JobQueue, SubmissionJob},
    redact::Redactor,
    state::{IntentStatus, validate_transition},
    store::{
        IntentRepository,
        escalations::{Escalation, ReasonCategory},
        intents::{ChainVerification, EvaluationResult, Intent, IntentFilter, IntentPage, NewIntent},
    },
};

const MAX_GOAL_CHARS: usize = 1024;
const MAX_CONTEXT_BYTES: usize = 64 * 1024;
const MAX_TYPE_CHARS: usize = 128;
const MAX_TRUST_LEVEL: u8 = 4;
const MAX_TRUST_SCORE: u32 = 1000;

/// Submission payload, as supplied by the calling agent.
#[derive(Debug, Clone, Default)]
pub struct SubmitPayload {
    pub entity_id: String,
    pub goal: String,
    pub context: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub intent_type: Option<String>,
    pub priority: u8,
    pub idempotency_key: Option<String>,
}

/// Caller-scoped submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub tenant_id: String,
    pub trust_level: Option<u8>,
    pub trust_score: Option<u32>,
    pub trust_snapshot: Option<Value>,
    pub user_id: Option<String>,
    pub bypass_trust_gate: bool,
    pub bypass_consent_check: bool,
}

/// Submission outcome. `duplicate` marks a dedupe hit returning the
/// pre-existing intent.
#[derive(Debug, Clone)]
pub struct Submission {
    pub intent: Intent,
    pub duplicate: bool,
}

/// Request body for `escalate`.
#[derive(Debug, Clone)]
pub struct EscalateRequest {
    pub reason: String,
    pub reason_category: ReasonCategory,
    pub escalated_to: String,
    pub escalated_by: Option<String>,
    pub timeout: Option<String>,
}

/// Process-local submission outcome counters.
#[derive(Debug, Default)]
pub struct SubmissionMetrics {
    success: AtomicU64,
    duplicate: AtomicU64,
    consent_denied: AtomicU64,
    rejected: AtomicU64,
}

/// Snapshot of [`SubmissionMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmissionCounts {
    pub success: u64,
    pub duplicate: u64,
    pub consent_denied: u64,
    pub rejected: u64,
}

impl SubmissionMetrics {
    pub fn snapshot(&self) -> SubmissionCounts {
        SubmissionCounts {
            success: self.success.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            consent_denied: self.consent_denied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Lifecycle engine owning all intent and event writes.
pub struct IntentService {
    repo: IntentRepository,
    consents: Arc<super::ConsentService>,
    kv: Arc<dyn KeyValueStore>,
    locks: LockManager,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn crate::time::Clock>,
    config: CoreConfig,
    redactor: Redactor,
    cipher: Option<Arc<PayloadCipher>>,
    metrics: SubmissionMetrics,
    escalations: OnceLock<Arc<dyn EscalationLink>>,
}

impl IntentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: IntentRepository,
        consents: Arc<super::ConsentService>,
        kv: Arc<dyn KeyValueStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn crate::time::Clock>,
        config: CoreConfig,
        cipher: Option<Arc<PayloadCipher>>,
    ) -> Self {
        let locks = LockManager::new(Arc::clone(&kv), config.lock.clone());
        let redactor = Redactor::new(&config.redaction.paths);
        Self {
            repo,
            consents,
            kv,
            locks,
            queue,
            clock,
            config,
            redactor,
            cipher,
            metrics: SubmissionMetrics::default(),
            escalations: OnceLock::new(),
        }
    }

    /// Late-bind the escalation capability (breaks the constructor cycle).
    pub fn bind_escalations(&self, escalations: Arc<dyn EscalationLink>) {
        let _ = self.escalations.set(escalations);
    }

    fn escalations(&self) -> CoreResult<&Arc<dyn EscalationLink>> {
        self.escalations.get().ok_or_else(|| {
            CoreError::Internal("intent service used before escalation binding".to_string())
        })
    }

    pub fn metrics(&self) -> SubmissionCounts {
        self.metrics.snapshot()
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Drive a submission through the full pipeline.
    pub async fn submit(
        &self,
        payload: SubmitPayload,
        opts: SubmitOptions,
        ctx: &OpContext,
    ) -> CoreResult<Submission> {
        ctx.ensure_active()?;
        self.validate(&payload, &opts)?;

        if let Some(user_id) = &opts.user_id {
            if !opts.bypass_consent_check {
                let verdict = self
                    .consents
                    .validate_consent(
                        user_id,
                        &opts.tenant_id,
                        crate::store::consents::ConsentType::DataProcessing,
                    )
                    .await?;
                if !verdict.valid {
                    self.metrics.consent_denied.fetch_add(1, Ordering::Relaxed);
                    return Err(CoreError::ConsentRequired {
                        user_id: user_id.clone(),
                        consent_type: "data_processing".to_string(),
                    });
                }
            }
        }

        if !opts.bypass_trust_gate {
            let required = payload
                .intent_type
                .as_deref()
                .and_then(|t| self.config.trust.gates.get(t).copied())
                .unwrap_or(self.config.trust.default_min_trust_level);
            let actual = opts.trust_level.unwrap_or(0);
            if actual < required {
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::TrustInsufficient { required, actual });
            }
        }

        let fingerprint = self.fingerprint(&payload, &opts)?;

        if let Some(existing) = self
            .repo
            .find_by_dedupe(&opts.tenant_id, &fingerprint)
            .await?
        {
            return Ok(self.duplicate_hit(existing));
        }

        let cap = self.config.limits.max_in_flight(&opts.tenant_id);
        let active = self.repo.count_active(&opts.tenant_id).await?;
        if active >= cap {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::IntentRateLimit {
                tenant_id: opts.tenant_id.clone(),
                active,
                limit: cap,
            });
        }

        let lock_key = keys::dedupe_lock(&opts.tenant_id, &fingerprint);
        let Some(guard) = self.locks.acquire(&lock_key).await? else {
            // Lost the race; the winner has either inserted or given up.
            if let Some(existing) = self
                .repo
                .find_by_dedupe(&opts.tenant_id, &fingerprint)
                .await?
            {
                return Ok(self.duplicate_hit(existing));
            }
            return Err(CoreError::IntentLocked(lock_key));
        };

        if let Some(existing) = self
            .repo
            .find_by_dedupe(&opts.tenant_id, &fingerprint)
            .await?
        {
            guard.release().await;
            return Ok(self.duplicate_hit(existing));
        }

        let marker_key = keys::dedupe_marker(&opts.tenant_id, &fingerprint);
        let marker_ttl = std::time::Duration::from_secs(self.config.dedupe.marker_ttl_secs);
        if let Err(err) = self.kv.set(&marker_key, "1", Some(marker_ttl)).await {
            tracing::debug!(key = %marker_key, error = %err, "dedupe marker write failed");
        }

        let inserted = self
            .insert_submission(&payload, &opts, &fingerprint, ctx)
            .await;
        guard.release().await;

        let intent = match inserted {
            Ok(intent) => intent,
            Err(CoreError::Conflict(_)) => {
                // The unique index caught a racer that slipped past the lock.
                let existing = self
                    .repo
                    .find_by_dedupe(&opts.tenant_id, &fingerprint)
                    .await?
                    .ok_or_else(|| {
                        CoreError::Internal(
                            "dedupe conflict without a surviving row".to_string(),
                        )
                    })?;
                return Ok(self.duplicate_hit(existing));
            }
            Err(err) => return Err(err),
        };

        if let Some(snapshot) = &opts.trust_snapshot {
            let result = EvaluationResult::TrustSnapshot {
                snapshot: snapshot.clone(),
            };
            if let Err(err) = self
                .repo
                .record_evaluation(intent.id, &opts.tenant_id, &result)
                .await
            {
                tracing::warn!(intent = %intent.id, error = %err, "trust snapshot record failed");
            }
        }

        self.enqueue_submission(&intent).await;
        self.metrics.success.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            intent = %intent.id,
            tenant = %intent.tenant_id,
            intent_type = intent.intent_type.as_deref().unwrap_or("-"),
            priority = intent.priority,
            "intent submitted"
        );
        Ok(Submission {
            intent,
            duplicate: false,
        })
    }

    fn duplicate_hit(&self, intent: Intent) -> Submission {
        self.metrics.duplicate.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(intent = %intent.id, tenant = %intent.tenant_id, "duplicate submission collapsed");
        Submission {
            intent,
            duplicate: true,
        }
    }

    fn validate(&self, payload: &SubmitPayload, opts: &SubmitOptions) -> CoreResult<()> {
        let fail = |message: &str| Err(CoreError::Validation(message.to_string()));

        if opts.tenant_id.trim().is_empty() {
            return fail("tenant_id must not be empty");
        }
        if payload.entity_id.trim().is_empty() {
            return fail("entity_id must not be empty");
        }
        let goal_chars = payload.goal.chars().count();
        if goal_chars == 0 || goal_chars > MAX_GOAL_CHARS {
            return fail("goal must be between 1 and 1024 characters");
        }
        if let Some(intent_type) = &payload.intent_type {
            if intent_type.is_empty() || intent_type.chars().count() > MAX_TYPE_CHARS {
                return fail("intent_type must be between 1 and 128 characters");
            }
        }
        if payload.priority > crate::queue::MAX_PRIORITY {
            return fail("priority must be between 0 and 9");
        }
        let context_bytes = serde_json::to_vec(&Value::Object(payload.context.clone()))?.len();
        if context_bytes > MAX_CONTEXT_BYTES {
            return fail("serialized context exceeds 64 KiB");
        }
        if let Some(level) = opts.trust_level {
            if level > MAX_TRUST_LEVEL {
                return fail("trust_level must be between 0 and 4");
            }
        }
        if let Some(score) = opts.trust_score {
            if score > MAX_TRUST_SCORE {
                return fail("trust_score must be between 0 and 1000");
            }
        }
        Ok(())
    }

    /// HMAC fingerprint over the canonical submission identity plus a
    /// replay-window bucket.
    fn fingerprint(&self, payload: &SubmitPayload, opts: &SubmitOptions) -> CoreResult<String> {
        let canonical_context =
            String::from_utf8_lossy(&canonical_json_bytes(&Value::Object(payload.context.clone()))?)
                .into_owned();
        let window = self.config.dedupe.window_secs.max(1) as i64;
        let bucket = self.clock_now_secs() / window;

        let preimage = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            opts.tenant_id,
            payload.entity_id,
            payload.goal,
            canonical_context,
            payload.intent_type.as_deref().unwrap_or(""),
            payload.idempotency_key.as_deref().unwrap_or(""),
            bucket,
        );
        Ok(dedupe_fingerprint(
            self.config.dedupe.secret.as_deref(),
            &preimage,
        ))
    }

    fn clock_now_secs(&self) -> i64 {
        self.clock.now().timestamp()
    }

    async fn insert_submission(
        &self,
        payload: &SubmitPayload,
        opts: &SubmitOptions,
        fingerprint: &str,
        ctx: &OpContext,
    ) -> CoreResult<Intent> {
        // Last cancellation point before the transactional write; once the
        // insert commits the submission is reported as success.
        ctx.ensure_active()?;

        let context = self.redactor.redact_section("context", &payload.context);
        let metadata = self.redactor.redact_section("metadata", &payload.metadata);

        let (context, metadata) = if self.config.encryption.enabled_for(&opts.tenant_id) {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                CoreError::Encryption("tenant requires encryption but no key is loaded".to_string())
            })?;
            (cipher.encrypt_map(&context)?, cipher.encrypt_map(&metadata)?)
        } else {
            (Value::Object(context), Value::Object(metadata))
        };

        self.repo
            .create_intent_with_event(NewIntent {
                id: Uuid::new_v4(),
                tenant_id: opts.tenant_id.clone(),
                entity_id: payload.entity_id.clone(),
                goal: payload.goal.clone(),
                intent_type: payload.intent_type.clone(),
                priority: payload.priority,
                context,
                metadata,
                dedupe_hash: fingerprint.to_string(),
                trust_snapshot: opts.trust_snapshot.clone(),
                trust_level: opts.trust_level,
                trust_score: opts.trust_score,
            })
            .await
    }

    /// Enqueue failures are logged, never fatal: the intent row exists and
    /// a reconciler can re-enqueue stuck `pending` intents downstream.
    async fn enqueue_submission(&self, intent: &Intent) {
        let namespace = self
            .config
            .queue
            .namespace_for(intent.intent_type.as_deref())
            .to_string();
        let job = SubmissionJob {
            intent_id: intent.id,
            tenant_id: intent.tenant_id.clone(),
            priority: intent.priority,
            trace_carrier: None,
        };
        let timeout = std::time::Duration::from_millis(self.config.queue.enqueue_timeout_ms);

        match tokio::time::timeout(timeout, self.queue.enqueue(&namespace, &job)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::error!(intent = %intent.id, namespace, error = %err, "submission enqueue failed");
            }
            Err(_) => {
                tracing::error!(intent = %intent.id, namespace, "submission enqueue timed out");
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Tenant-scoped fetch. Soft-deleted intents read as absent.
    pub async fn get(&self, id: Uuid, tenant_id: &str) -> CoreResult<Option<Intent>> {
        let intent = self.repo.find_by_id(id, tenant_id).await?;
        if self.config.audit_reads {
            if let Some(intent) = &intent {
                // Fire-and-forget: a failed read-audit never fails the read.
                if let Err(err) = self
                    .repo
                    .record_event(intent.id, "intent.read", json!({"tenant_id": tenant_id}))
                    .await
                {
                    tracing::debug!(intent = %intent.id, error = %err, "read audit failed");
                }
            }
        }
        Ok(intent)
    }

    pub async fn list_intents(&self, filter: IntentFilter) -> CoreResult<IntentPage> {
        self.repo.list_intents(filter).await
    }

    pub async fn verify_event_chain(&self, intent_id: Uuid) -> CoreResult<ChainVerification> {
        self.repo.verify_event_chain(intent_id).await
    }

    pub async fn list_events(
        &self,
        intent_id: Uuid,
    ) -> CoreResult<Vec<crate::store::intents::IntentEvent>> {
        self.repo.list_events(intent_id).await
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Validated, linearized status transition with its canonical event.
    pub async fn update_status(
        &self,
        id: Uuid,
        tenant_id: &str,
        to: IntentStatus,
        flags: TransitionFlags,
    ) -> CoreResult<Intent> {
        let intent = self
            .repo
            .find_by_id(id, tenant_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "intent",
                id: id.to_string(),
            })?;

        let from = flags.expected_from.unwrap_or(intent.status);
        if from != intent.status {
            return Err(CoreError::Conflict(format!(
                "intent `{id}` is {}, expected {}",
                intent.status, from
            )));
        }
        let rule = validate_transition(from, to, flags.reason.is_some(), flags.permission)?;

        if to == IntentStatus::Cancelled {
            let reason = flags.reason.clone().unwrap_or_default();
            return self
                .cancel(id, tenant_id, &reason, flags.actor.as_deref())
                .await;
        }

        let moved = self.repo.update_status(id, tenant_id, from, to).await?;
        if !moved {
            return Err(CoreError::Conflict(format!(
                "intent `{id}` left {} concurrently",
                from
            )));
        }

        self.repo
            .record_event(
                id,
                rule.event_type,
                json!({
                    "from": from.as_str(),
                    "to": to.as_str(),
                    "reason": flags.reason,
                    "actor": flags.actor,
                }),
            )
            .await?;

        self.repo
            .find_by_id(id, tenant_id)
            .await?
            .ok_or_else(|| CoreError::Internal("intent vanished mid-transition".to_string()))
    }

    /// Cancel with a mandatory reason from any cancellable status.
    pub async fn cancel(
        &self,
        id: Uuid,
        tenant_id: &str,
        reason: &str,
        cancelled_by: Option<&str>,
    ) -> CoreResult<Intent> {
        if reason.trim().is_empty() {
            return Err(CoreError::Validation(
                "cancellation reason must not be empty".to_string(),
            ));
        }
        let intent = self
            .repo
            .find_by_id(id, tenant_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "intent",
                id: id.to_string(),
            })?;
        validate_transition(intent.status, IntentStatus::Cancelled, true, false)?;

        let cancelled = self
            .repo
            .cancel_intent(id, tenant_id, reason)
            .await?
            .ok_or_else(|| {
                CoreError::Conflict(format!(
                    "intent `{id}` left a cancellable status concurrently"
                ))
            })?;

        self.repo
            .record_event(
                id,
                "intent.cancelled",
                json!({
                    "from": intent.status.as_str(),
                    "to": "cancelled",
                    "reason": reason,
                    "actor": cancelled_by,
                }),
            )
            .await?;

        let result = EvaluationResult::Cancelled {
            reason: Some(reason.to_string()),
        };
        if let Err(err) = self.repo.record_evaluation(id, tenant_id, &result).await {
            tracing::warn!(intent = %id, error = %err, "cancellation evaluation record failed");
        }

        tracing::info!(intent = %id, tenant = tenant_id, reason, "intent cancelled");
        Ok(cancelled)
    }

    /// Move an evaluating intent to `escalated` and open the escalation.
    pub async fn escalate(
        &self,
        id: Uuid,
        tenant_id: &str,
        request: EscalateRequest,
    ) -> CoreResult<(Intent, Escalation)> {
        let intent = self
            .update_status(id, tenant_id, IntentStatus::Escalated, TransitionFlags::default())
            .await?;

        let escalation = self
            .escalations()?
            .create_escalation(crate::service::escalation::CreateEscalation {
                intent_id: id,
                tenant_id: tenant_id.to_string(),
                reason: request.reason,
                reason_category: request.reason_category,
                escalated_to: request.escalated_to,
                escalated_by: request.escalated_by,
                timeout: request.timeout,
                context: intent.context.clone(),
                metadata: Map::new(),
            })
            .await?;
        Ok((intent, escalation))
    }

    // ------------------------------------------------------------------
    // Metadata and evaluations
    // ------------------------------------------------------------------

    /// Persist refreshed trust metadata, with its audit event.
    pub async fn update_trust_metadata(
        &self,
        id: Uuid,
        tenant_id: &str,
        snapshot: Option<Value>,
        level: Option<u8>,
        score: Option<u32>,
    ) -> CoreResult<Intent> {
        if let Some(level) = level {
            if level > MAX_TRUST_LEVEL {
                return Err(CoreError::Validation(
                    "trust_level must be between 0 and 4".to_string(),
                ));
            }
        }
        if let Some(score) = score {
            if score > MAX_TRUST_SCORE {
                return Err(CoreError::Validation(
                    "trust_score must be between 0 and 1000".to_string(),
                ));
            }
        }

        let updated = self
            .repo
            .update_trust(id, tenant_id, snapshot.clone(), level, score)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "intent",
                id: id.to_string(),
            })?;

        self.repo
            .record_event(
                id,
                "intent.trust.updated",
                json!({"trust_level": level, "trust_score": score}),
            )
            .await?;

        if let Some(snapshot) = snapshot {
            let result = EvaluationResult::TrustSnapshot { snapshot };
            if let Err(err) = self.repo.record_evaluation(id, tenant_id, &result).await {
                tracing::warn!(intent = %id, error = %err, "trust snapshot record failed");
            }
        }
        Ok(updated)
    }

    /// Append a worker-reported evaluation outcome.
    pub async fn record_evaluation(
        &self,
        intent_id: Uuid,
        tenant_id: &str,
        result: EvaluationResult,
    ) -> CoreResult<crate::store::intents::Evaluation> {
        self.repo
            .record_evaluation(intent_id, tenant_id, &result)
            .await
    }

    pub async fn list_evaluations(
        &self,
        intent_id: Uuid,
    ) -> CoreResult<Vec<crate::store::intents::Evaluation>> {
        self.repo.list_evaluations(intent_id).await
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Soft delete: hides the row, empties payloads, keeps the audit trail.
    pub async fn soft_delete(&self, id: Uuid, tenant_id: &str) -> CoreResult<bool> {
        let deleted = self.repo.soft_delete(id, tenant_id).await?;
        if deleted {
            if let Err(err) = self
                .repo
                .record_event(id, "intent.deleted", json!({"tenant_id": tenant_id}))
                .await
            {
                tracing::warn!(intent = %id, error = %err, "deletion audit event failed");
            }
        }
        Ok(deleted)
    }

    /// Purge soft-deleted rows past retention (scheduler entry point).
    pub async fn purge_deleted(&self, retention_days: i64) -> CoreResult<u64> {
        let purged = self.repo.purge_deleted(retention_days).await?;
        if purged > 0 {
            tracing::info!(purged, retention_days, "purged soft-deleted intents");
        }
        Ok(purged)
    }
}

#[async_trait]
impl IntentDirectory for IntentService {
    async fn find_intent(&self, id: Uuid, tenant_id: &str) -> CoreResult<Option<Intent>> {
        self.repo.find_by_id(id, tenant_id).await
    }

    async fn update_intent_status(
        &self,
        id: Uuid,
        tenant_id: &str,
        to: IntentStatus,
        flags: TransitionFlags,
    ) -> CoreResult<Intent> {
        self.update_status(id, tenant_id, to, flags).await
    }
}
