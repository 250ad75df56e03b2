//! Escalation workflow integration: acknowledgement, resolution linkage,
//! SLA timeouts, index rebuilds, consent policies, and the audit chain.

mod common;

use chrono::Duration;
use serde_json::json;

use common::{boot, notify_payload, tenant_opts};
use intent_core::{
    errors::{CoreError, ErrorKind},
    kv::{KeyValueStore, keys},
    service::{EscalateRequest, OpContext, TransitionFlags},
    state::IntentStatus,
    store::{
        consents::ConsentType,
        escalations::{EscalationStatus, ReasonCategory},
    },
    time::Clock,
};
use uuid::Uuid;

fn notify_gate(level: u8) -> impl FnOnce(&mut intent_core::config::CoreConfig) {
    move |config| {
        config.trust.gates.insert("notify".to_string(), level);
    }
}

async fn escalated_intent(core: &common::TestCore, timeout: &str) -> (Uuid, Uuid) {
    let intents = core.ctx.intents();
    let id = intents
        .submit(notify_payload(), tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("submit")
        .intent
        .id;
    intents
        .update_status(id, "T1", IntentStatus::Evaluating, TransitionFlags::default())
        .await
        .expect("evaluating");
    let (_, escalation) = intents
        .escalate(
            id,
            "T1",
            EscalateRequest {
                reason: "manual review requested".to_string(),
                reason_category: ReasonCategory::ManualReview,
                escalated_to: "governance-team".to_string(),
                escalated_by: Some("worker-7".to_string()),
                timeout: Some(timeout.to_string()),
            },
        )
        .await
        .expect("escalate");
    (id, escalation.id)
}

#[tokio::test]
async fn timeout_sweep_transitions_overdue_escalations() {
    let core = boot(notify_gate(2)).await;
    let (_, escalation_id) = escalated_intent(&core, "PT1H").await;
    let escalations = core.ctx.escalations();

    // Indexed as due within the hour.
    let deadline_ms = (core.clock.now() + Duration::hours(1)).timestamp_millis();
    assert_eq!(
        escalations.due_by(deadline_ms, 10).await.expect("due"),
        vec![escalation_id]
    );

    // Nothing due yet.
    assert!(escalations.process_timeouts().await.expect("sweep").is_empty());

    core.clock.advance(Duration::seconds(3601));
    let processed = escalations.process_timeouts().await.expect("sweep");
    assert_eq!(processed, vec![escalation_id]);

    let timed_out = escalations
        .get(escalation_id, "T1")
        .await
        .expect("get");
    assert_eq!(timed_out.status, EscalationStatus::Timeout);
    assert!(timed_out.sla_breached);

    // Removed from both indices; the sweep is idempotent.
    assert!(escalations.due_by(i64::MAX, 10).await.expect("due").is_empty());
    assert!(escalations.list_pending("T1").await.expect("pending").is_empty());
    assert!(escalations.process_timeouts().await.expect("resweep").is_empty());
}

#[tokio::test]
async fn acknowledge_then_approve_links_back_to_the_intent() {
    let core = boot(notify_gate(2)).await;
    let (intent_id, escalation_id) = escalated_intent(&core, "PT1H").await;
    let escalations = core.ctx.escalations();

    let acked = escalations
        .acknowledge(escalation_id, "T1", "alice")
        .await
        .expect("acknowledge");
    assert_eq!(acked.status, EscalationStatus::Acknowledged);
    assert!(acked.acknowledged_at.is_some());
    assert_eq!(acked.metadata["acknowledged_by"], "alice");

    // Acknowledging twice is a conflict, not a silent no-op.
    let err = escalations
        .acknowledge(escalation_id, "T1", "bob")
        .await
        .expect_err("already acknowledged");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let approved = escalations
        .approve(escalation_id, "T1", "alice", Some("looks safe"))
        .await
        .expect("approve");
    assert_eq!(approved.status, EscalationStatus::Approved);
    assert_eq!(approved.resolved_by.as_deref(), Some("alice"));
    assert_eq!(approved.resolution_notes.as_deref(), Some("looks safe"));
    assert!(!approved.sla_breached, "resolved before the deadline");

    let intent = core
        .ctx
        .intents()
        .get(intent_id, "T1")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(intent.status, IntentStatus::Approved);

    let events = core.ctx.intents().list_events(intent_id).await.expect("events");
    assert_eq!(events.last().expect("last").event_type, "intent.approved");
}

#[tokio::test]
async fn reject_resolves_intent_to_denied() {
    let core = boot(notify_gate(2)).await;
    let (intent_id, escalation_id) = escalated_intent(&core, "PT1H").await;

    let rejected = core
        .ctx
        .escalations()
        .reject(escalation_id, "T1", "bob", None)
        .await
        .expect("reject");
    assert_eq!(rejected.status, EscalationStatus::Rejected);

    let intent = core
        .ctx
        .intents()
        .get(intent_id, "T1")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(intent.status, IntentStatus::Denied);
}

#[tokio::test]
async fn late_resolution_marks_sla_breached() {
    let core = boot(notify_gate(2)).await;
    let (_, escalation_id) = escalated_intent(&core, "PT1H").await;

    core.clock.advance(Duration::seconds(3700));
    let approved = core
        .ctx
        .escalations()
        .approve(escalation_id, "T1", "alice", None)
        .await
        .expect("approve");
    assert!(approved.sla_breached);
}

#[tokio::test]
async fn escalation_reads_are_tenant_scoped() {
    let core = boot(notify_gate(2)).await;
    let (_, escalation_id) = escalated_intent(&core, "PT1H").await;

    let err = core
        .ctx
        .escalations()
        .get(escalation_id, "T2")
        .await
        .expect_err("wrong tenant");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn second_open_escalation_is_rejected() {
    let core = boot(notify_gate(2)).await;
    let (intent_id, _) = escalated_intent(&core, "PT1H").await;

    let err = core
        .ctx
        .escalations()
        .create(intent_core::service::CreateEscalation {
            intent_id,
            tenant_id: "T1".to_string(),
            reason: "second opinion".to_string(),
            reason_category: ReasonCategory::HighRisk,
            escalated_to: "governance-team".to_string(),
            escalated_by: None,
            timeout: None,
            context: Default::default(),
            metadata: Default::default(),
        })
        .await
        .expect_err("one open escalation per intent");
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn rebuild_indexes_recovers_from_kv_loss() {
    let core = boot(notify_gate(2)).await;
    let (_, escalation_id) = escalated_intent(&core, "PT2H").await;
    let escalations = core.ctx.escalations();

    // Simulate KV loss.
    core.kv
        .delete(keys::ESCALATION_TIMEOUTS)
        .await
        .expect("drop timeouts");
    core.kv
        .delete(&keys::escalation_pending("T1"))
        .await
        .expect("drop pending");
    assert!(escalations.due_by(i64::MAX, 10).await.expect("due").is_empty());

    // The store fallback still answers while indices are gone.
    let pending = escalations.list_pending("T1").await.expect("pending");
    assert_eq!(pending.len(), 1);

    let rebuilt = escalations.rebuild_indexes(None).await.expect("rebuild");
    assert_eq!(rebuilt, 1);
    assert_eq!(
        escalations.due_by(i64::MAX, 10).await.expect("due"),
        vec![escalation_id]
    );

    let stats = escalations.sla_stats("T1").await.expect("stats");
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.sla_breached, 0);
}

#[tokio::test]
async fn consent_versioning_revokes_and_replaces() {
    let core = boot(|_| {}).await;
    let consents = core.ctx.consents();

    consents
        .grant_consent("U1", "T1", ConsentType::DataProcessing, "v1", Default::default())
        .await
        .expect("grant v1");

    // Same version: no-op.
    let outcome = consents
        .grant_consent("U1", "T1", ConsentType::DataProcessing, "v1", Default::default())
        .await
        .expect("regrant");
    assert!(matches!(
        outcome,
        intent_core::store::consents::GrantOutcome::Unchanged(_)
    ));

    core.clock.advance(Duration::seconds(5));
    let outcome = consents
        .grant_consent("U1", "T1", ConsentType::DataProcessing, "v2", Default::default())
        .await
        .expect("upgrade");
    assert!(matches!(
        outcome,
        intent_core::store::consents::GrantOutcome::Upgraded { .. }
    ));

    let verdict = consents
        .validate_consent("U1", "T1", ConsentType::DataProcessing)
        .await
        .expect("validate");
    assert!(verdict.valid);
    assert_eq!(verdict.version.as_deref(), Some("v2"));

    // grant v1, revoke v1, grant v2 = three history entries so far.
    let history = consents.get_consent_history("U1", "T1").await.expect("history");
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].action, "grant");
    assert_eq!(history[0].version, "v2");

    core.clock.advance(Duration::seconds(5));
    assert!(
        consents
            .revoke_consent("U1", "T1", ConsentType::DataProcessing)
            .await
            .expect("revoke")
            .is_some()
    );
    // Idempotent: a second revoke finds nothing active.
    assert!(
        consents
            .revoke_consent("U1", "T1", ConsentType::DataProcessing)
            .await
            .expect("revoke again")
            .is_none()
    );
    assert!(
        !consents
            .has_valid_consent("U1", "T1", ConsentType::DataProcessing)
            .await
            .expect("check")
    );
}

#[tokio::test]
async fn policy_versions_keep_one_current_row() {
    let core = boot(|_| {}).await;
    let consents = core.ctx.consents();

    consents
        .create_policy("T1", ConsentType::DataProcessing, "v1", "original text")
        .await
        .expect("v1");
    core.clock.advance(Duration::seconds(5));
    consents
        .create_policy("T1", ConsentType::DataProcessing, "v2", "revised text")
        .await
        .expect("v2");

    let current = consents
        .get_current_policy("T1", ConsentType::DataProcessing)
        .await
        .expect("current")
        .expect("present");
    assert_eq!(current.version, "v2");
    assert!(current.effective_to.is_none());

    let v1 = consents
        .get_policy("T1", ConsentType::DataProcessing, "v1")
        .await
        .expect("v1")
        .expect("present");
    assert!(v1.effective_to.is_some(), "closed when v2 shipped");

    let history = consents
        .get_policy_history("T1", ConsentType::DataProcessing)
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].version, "v2");
}

#[tokio::test]
async fn audit_chain_signs_and_detects_tampering() {
    use intent_core::store::entity::audit_records;
    use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, sea_query::Expr};

    let core = boot(|_| {}).await;
    let audit = core.ctx.audit();
    let intent_id = Uuid::new_v4();

    let first = audit
        .append(
            intent_id,
            "11111111-1111-1111-1111-111111111111",
            "approved",
            json!({"trust_level": 2}),
            json!({"next": "executing"}),
        )
        .await
        .expect("first");
    let second = audit
        .append(
            intent_id,
            "11111111-1111-1111-1111-111111111111",
            "completed",
            json!({"run": 1}),
            json!({"ok": true}),
        )
        .await
        .expect("second");

    assert_eq!(first.chain_position, 0);
    assert_eq!(second.chain_position, 1);
    assert_eq!(second.previous_hash, first.hash);
    assert_eq!(first.algorithm, "ed25519");

    assert!(audit.verify(first.id).await.expect("verify").valid);
    assert!(audit.verify(second.id).await.expect("verify").valid);
    assert!(audit.verify_chain().await.expect("chain").valid);

    audit_records::Entity::update_many()
        .col_expr(audit_records::Column::Decision, Expr::value("denied"))
        .filter(audit_records::Column::Id.eq(first.id))
        .exec(core.ctx.store().db())
        .await
        .expect("tamper");

    let verification = audit.verify_chain().await.expect("chain");
    assert!(!verification.valid);
    assert_eq!(verification.invalid_at, Some(0));
    assert!(
        verification
            .error
            .as_deref()
            .expect("error")
            .contains("Hash mismatch")
    );
}

#[tokio::test]
async fn circuit_breaker_error_is_distinct() {
    // A tripped breaker yields circuit_open, not a downstream error code.
    let err = CoreError::CircuitOpen("consent".to_string());
    assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    assert_eq!(err.kind().http_status(), 502);
    assert_ne!(
        ErrorKind::CircuitOpen.code(),
        ErrorKind::ExternalService.code()
    );
}
