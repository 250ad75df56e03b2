//! End-to-end lifecycle scenarios: submission gates, deduplication, status
//! transitions, chain integrity, soft delete and retention.

mod common;

use chrono::Duration;
use serde_json::json;
use uuid::Uuid;

use common::{boot, notify_payload, object, tenant_opts};
use intent_core::{
    errors::{CoreError, ErrorKind},
    queue::JobQueue,
    service::{OpContext, SubmitOptions, TransitionFlags},
    state::IntentStatus,
    store::intents::IntentFilter,
};

fn notify_gate(level: u8) -> impl FnOnce(&mut intent_core::config::CoreConfig) {
    move |config| {
        config.trust.gates.insert("notify".to_string(), level);
    }
}

#[tokio::test]
async fn happy_submit_creates_row_event_and_job() {
    let core = boot(notify_gate(2)).await;
    let intents = core.ctx.intents();

    let submission = intents
        .submit(notify_payload(), tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("submit");

    assert!(!submission.duplicate);
    let intent = &submission.intent;
    assert_eq!(intent.status, IntentStatus::Pending);
    assert_eq!(intent.tenant_id, "T1");
    assert_eq!(intent.goal, "Send email");
    assert_eq!(intent.context["to"], "a@b");

    let events = intents.list_events(intent.id).await.expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "intent.submitted");
    assert_eq!(events[0].previous_hash, "0".repeat(64));

    let verification = intents.verify_event_chain(intent.id).await.expect("verify");
    assert!(verification.valid, "chain must verify: {verification:?}");

    assert_eq!(core.queue.depth("default").await.expect("depth"), 1);
    let job = core
        .queue
        .dequeue("default")
        .await
        .expect("dequeue")
        .expect("job");
    assert_eq!(job.intent_id, intent.id);
    assert_eq!(job.tenant_id, "T1");

    let counts = intents.metrics();
    assert_eq!(counts.success, 1);
    assert_eq!(counts.duplicate, 0);
}

#[tokio::test]
async fn duplicate_submission_collapses_to_one_row() {
    let core = boot(notify_gate(2)).await;
    let intents = core.ctx.intents();

    let first = intents
        .submit(notify_payload(), tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("first");
    let second = intents
        .submit(notify_payload(), tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("second");

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.intent.id, second.intent.id);

    let events = intents.list_events(first.intent.id).await.expect("events");
    assert_eq!(events.len(), 1, "exactly one intent.submitted event");

    let page = intents
        .list_intents(IntentFilter {
            tenant_id: "T1".to_string(),
            ..IntentFilter::default()
        })
        .await
        .expect("list");
    assert_eq!(page.items.len(), 1);
    assert_eq!(intents.metrics().duplicate, 1);
}

#[tokio::test]
async fn trust_gate_rejects_below_required_level() {
    let core = boot(notify_gate(3)).await;
    let intents = core.ctx.intents();

    let err = intents
        .submit(notify_payload(), tenant_opts("T1", 1), &OpContext::background())
        .await
        .expect_err("gated");

    match err {
        CoreError::TrustInsufficient { required, actual } => {
            assert_eq!(required, 3);
            assert_eq!(actual, 1);
        }
        other => panic!("expected trust_insufficient, got {other}"),
    }

    let page = intents
        .list_intents(IntentFilter {
            tenant_id: "T1".to_string(),
            ..IntentFilter::default()
        })
        .await
        .expect("list");
    assert!(page.items.is_empty(), "no intent row written");
    assert_eq!(intents.metrics().rejected, 1);
}

#[tokio::test]
async fn consent_gate_blocks_until_granted() {
    let core = boot(notify_gate(2)).await;
    let intents = core.ctx.intents();

    let opts = SubmitOptions {
        user_id: Some("U1".to_string()),
        ..tenant_opts("T1", 2)
    };

    let err = intents
        .submit(notify_payload(), opts.clone(), &OpContext::background())
        .await
        .expect_err("no consent yet");
    assert_eq!(err.kind(), ErrorKind::ConsentRequired);
    assert_eq!(intents.metrics().consent_denied, 1);

    core.ctx
        .consents()
        .grant_consent(
            "U1",
            "T1",
            intent_core::store::consents::ConsentType::DataProcessing,
            "v1",
            Default::default(),
        )
        .await
        .expect("grant");

    let submission = intents
        .submit(notify_payload(), opts, &OpContext::background())
        .await
        .expect("submit after grant");
    assert_eq!(submission.intent.status, IntentStatus::Pending);
}

#[tokio::test]
async fn tenant_in_flight_cap_is_enforced() {
    let core = boot(|config| {
        config.trust.gates.insert("notify".to_string(), 2);
        config.limits.default_max_in_flight = 1;
    })
    .await;
    let intents = core.ctx.intents();

    intents
        .submit(notify_payload(), tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("first");

    let mut payload = notify_payload();
    payload.goal = "Send another email".to_string();
    let err = intents
        .submit(payload, tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect_err("capped");

    match err {
        CoreError::IntentRateLimit { active, limit, .. } => {
            assert_eq!(active, 1);
            assert_eq!(limit, 1);
        }
        other => panic!("expected intent_rate_limit, got {other}"),
    }
}

#[tokio::test]
async fn full_lifecycle_records_canonical_events() {
    let core = boot(notify_gate(2)).await;
    let intents = core.ctx.intents();

    let id = intents
        .submit(notify_payload(), tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("submit")
        .intent
        .id;

    for status in [
        IntentStatus::Evaluating,
        IntentStatus::Approved,
        IntentStatus::Executing,
        IntentStatus::Completed,
    ] {
        intents
            .update_status(id, "T1", status, TransitionFlags::default())
            .await
            .expect("transition");
    }

    let events = intents.list_events(id).await.expect("events");
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "intent.submitted",
            "intent.evaluation.started",
            "intent.approved",
            "intent.execution.started",
            "intent.completed",
        ]
    );
    assert!(intents.verify_event_chain(id).await.expect("verify").valid);

    // Completed is terminal.
    let err = intents
        .update_status(id, "T1", IntentStatus::Pending, TransitionFlags::default())
        .await
        .expect_err("terminal");
    assert_eq!(err.kind(), ErrorKind::TerminalState);
}

#[tokio::test]
async fn replay_from_denied_requires_permission() {
    let core = boot(notify_gate(2)).await;
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
    intents
        .update_status(id, "T1", IntentStatus::Denied, TransitionFlags::default())
        .await
        .expect("denied");

    let err = intents
        .update_status(id, "T1", IntentStatus::Pending, TransitionFlags::default())
        .await
        .expect_err("needs permission");
    assert_eq!(err.kind(), ErrorKind::RequiresPermission);

    let replayed = intents
        .update_status(
            id,
            "T1",
            IntentStatus::Pending,
            TransitionFlags {
                permission: true,
                actor: Some("operator".to_string()),
                ..TransitionFlags::default()
            },
        )
        .await
        .expect("replay");
    assert_eq!(replayed.status, IntentStatus::Pending);

    let events = intents.list_events(id).await.expect("events");
    assert_eq!(events.last().expect("last").event_type, "intent.replay");
}

#[tokio::test]
async fn cancel_during_escalation_leaves_escalation_open() {
    let core = boot(notify_gate(2)).await;
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

    let (intent, escalation) = intents
        .escalate(
            id,
            "T1",
            intent_core::service::EscalateRequest {
                reason: "needs a human".to_string(),
                reason_category: intent_core::store::escalations::ReasonCategory::ManualReview,
                escalated_to: "governance-team".to_string(),
                escalated_by: None,
                timeout: Some("PT1H".to_string()),
            },
        )
        .await
        .expect("escalate");
    assert_eq!(intent.status, IntentStatus::Escalated);

    // Cancellation needs a reason.
    let err = intents
        .update_status(id, "T1", IntentStatus::Cancelled, TransitionFlags::default())
        .await
        .expect_err("reason required");
    assert_eq!(err.kind(), ErrorKind::RequiresReason);

    let cancelled = intents
        .cancel(id, "T1", "changed mind", Some("U1"))
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, IntentStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("changed mind"));

    let events = intents.list_events(id).await.expect("events");
    assert_eq!(events.last().expect("last").event_type, "intent.cancelled");
    assert!(intents.verify_event_chain(id).await.expect("verify").valid);

    // The escalation is untouched until someone cancels it explicitly.
    let still_open = core
        .ctx
        .escalations()
        .get(escalation.id, "T1")
        .await
        .expect("get escalation");
    assert_eq!(
        still_open.status,
        intent_core::store::escalations::EscalationStatus::Pending
    );
}

#[tokio::test]
async fn tampered_event_breaks_the_chain() {
    use intent_core::store::entity::intent_events;
    use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, sea_query::Expr};

    let core = boot(notify_gate(2)).await;
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

    let events = intents.list_events(id).await.expect("events");
    intent_events::Entity::update_many()
        .col_expr(
            intent_events::Column::Payload,
            Expr::value(json!({"goal": "Send forged email"})),
        )
        .filter(intent_events::Column::Id.eq(events[0].id))
        .exec(core.ctx.store().db())
        .await
        .expect("tamper");

    let verification = intents.verify_event_chain(id).await.expect("verify");
    assert!(!verification.valid);
    assert_eq!(verification.invalid_at, Some(0));
    assert_eq!(
        verification.error.as_deref(),
        Some("Hash mismatch at event 0")
    );
}

#[tokio::test]
async fn soft_delete_hides_row_and_purge_respects_retention() {
    let core = boot(notify_gate(2)).await;
    let intents = core.ctx.intents();

    let kept = intents
        .submit(notify_payload(), tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("kept")
        .intent
        .id;

    let mut payload = notify_payload();
    payload.goal = "Send doomed email".to_string();
    let doomed = intents
        .submit(payload, tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("doomed")
        .intent
        .id;

    assert!(intents.soft_delete(doomed, "T1").await.expect("delete"));
    assert!(intents.get(doomed, "T1").await.expect("get").is_none());

    // Events survive the soft delete for internal audit paths.
    let events = intents.list_events(doomed).await.expect("events");
    assert!(events.iter().any(|e| e.event_type == "intent.submitted"));

    // Inside the retention window nothing is purged.
    assert_eq!(intents.purge_deleted(30).await.expect("purge"), 0);

    core.clock.advance(Duration::days(31));
    assert_eq!(intents.purge_deleted(30).await.expect("purge"), 1);

    // Live rows are never purged.
    assert!(intents.get(kept, "T1").await.expect("get").is_some());
}

#[tokio::test]
async fn cursor_pagination_walks_newest_first() {
    let core = boot(notify_gate(2)).await;
    let intents = core.ctx.intents();

    let mut ids = Vec::new();
    for i in 0..5 {
        let mut payload = notify_payload();
        payload.goal = format!("Send email {i}");
        ids.push(
            intents
                .submit(payload, tenant_opts("T1", 2), &OpContext::background())
                .await
                .expect("submit")
                .intent
                .id,
        );
        core.clock.advance(Duration::seconds(1));
    }

    let first = intents
        .list_intents(IntentFilter {
            tenant_id: "T1".to_string(),
            limit: 2,
            ..IntentFilter::default()
        })
        .await
        .expect("page 1");
    assert_eq!(first.items.len(), 2);
    assert!(first.has_more);
    assert_eq!(first.items[0].id, ids[4], "newest first");
    assert_eq!(first.items[1].id, ids[3]);

    let second = intents
        .list_intents(IntentFilter {
            tenant_id: "T1".to_string(),
            limit: 2,
            cursor: first.next_cursor.clone(),
            ..IntentFilter::default()
        })
        .await
        .expect("page 2");
    assert_eq!(second.items[0].id, ids[2]);
    assert_eq!(second.items[1].id, ids[1]);

    let third = intents
        .list_intents(IntentFilter {
            tenant_id: "T1".to_string(),
            limit: 2,
            cursor: second.next_cursor.clone(),
            ..IntentFilter::default()
        })
        .await
        .expect("page 3");
    assert_eq!(third.items.len(), 1);
    assert_eq!(third.items[0].id, ids[0]);
    assert!(!third.has_more);
    assert!(third.next_cursor.is_none());
}

#[tokio::test]
async fn redaction_masks_configured_paths() {
    let core = boot(|config| {
        config.trust.gates.insert("notify".to_string(), 2);
        config.redaction.paths = vec!["context.ssn".to_string()];
    })
    .await;
    let intents = core.ctx.intents();

    let mut payload = notify_payload();
    payload.context = object(json!({"to": "a@b", "ssn": "123-45-6789"}));

    let intent = intents
        .submit(payload, tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("submit")
        .intent;

    assert_eq!(intent.context["ssn"], "[REDACTED]");
    assert_eq!(intent.context["to"], "a@b");
}

#[tokio::test]
async fn encrypted_tenant_round_trips_through_envelope() {
    use intent_core::store::entity::intents as intent_rows;
    use sea_orm::EntityTrait;

    let core = boot(|config| {
        config.trust.gates.insert("notify".to_string(), 2);
        config.encryption.key_hex = Some("ab".repeat(32));
        config.encryption.tenants.insert("T1".to_string());
    })
    .await;
    let intents = core.ctx.intents();

    let intent = intents
        .submit(notify_payload(), tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("submit")
        .intent;

    // Reads decrypt transparently.
    assert_eq!(intent.context["to"], "a@b");
    let fetched = intents
        .get(intent.id, "T1")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(fetched.context["to"], "a@b");

    // At rest the column holds the sentinel envelope, not cleartext.
    let raw = intent_rows::Entity::find_by_id(intent.id)
        .one(core.ctx.store().db())
        .await
        .expect("raw")
        .expect("row");
    assert!(raw.context.get("__enc").is_some(), "context enveloped");
    assert!(raw.context.get("to").is_none());
}

#[tokio::test]
async fn cancelled_context_aborts_before_the_write() {
    let core = boot(notify_gate(2)).await;
    let intents = core.ctx.intents();

    let (handle, ctx) = OpContext::cancellable();
    handle.cancel();

    let err = intents
        .submit(notify_payload(), tenant_opts("T1", 2), &ctx)
        .await
        .expect_err("cancelled");
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let page = intents
        .list_intents(IntentFilter {
            tenant_id: "T1".to_string(),
            ..IntentFilter::default()
        })
        .await
        .expect("list");
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn get_scopes_by_tenant() {
    let core = boot(notify_gate(2)).await;
    let intents = core.ctx.intents();

    let id = intents
        .submit(notify_payload(), tenant_opts("T1", 2), &OpContext::background())
        .await
        .expect("submit")
        .intent
        .id;

    assert!(intents.get(id, "T1").await.expect("own tenant").is_some());
    assert!(intents.get(id, "T2").await.expect("other tenant").is_none());
    assert!(
        intents
            .get(Uuid::new_v4(), "T1")
            .await
            .expect("unknown id")
            .is_none()
    );
}
