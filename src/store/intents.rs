//! Intent repository: row mapping, encrypted-at-rest payloads, hash-chained
//! event append, paginated reads, soft delete and retention purge.
//!
//! # Event chain
//!
//! Every event row links to its predecessor:
//!
//! ```text
//!  hash[0] = H(canonical(event[0]) || ZERO)
//!  hash[i] = H(canonical(event[i]) || hash[i-1])
//! ```
//!
//! Appends for one intent serialize inside a transaction that re-reads the
//! latest hash (row lock on the parent intent under Postgres), so the chain
//! stays linear under concurrency. `occurred_at` is truncated to millisecond
//! precision before hashing and storing, keeping recomputed hashes stable
//! across store round-trips.

use std::{str::FromStr, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DbBackend, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, sea_query::Expr,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::{Store, entity};
use crate::{
    crypto::{ChainHash, PayloadCipher, canonical_json_bytes, is_envelope},
    errors::{CoreError, CoreResult},
    state::{IN_FLIGHT_STATUSES, IntentStatus},
    time::Clock,
};

/// Fully mapped intent, payloads decrypted.
#[derive(Debug, Clone, Serialize)]
pub struct Intent {
    pub id: Uuid,
    pub tenant_id: String,
    pub entity_id: String,
    pub goal: String,
    pub intent_type: Option<String>,
    pub priority: u8,
    pub status: IntentStatus,
    pub context: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub dedupe_hash: String,
    pub trust_snapshot: Option<Value>,
    pub trust_level: Option<u8>,
    pub trust_score: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

/// One event of an intent's audit chain.
#[derive(Debug, Clone, Serialize)]
pub struct IntentEvent {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
    pub hash: String,
    pub previous_hash: String,
}

/// Chain verification outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChainVerification {
    fn ok() -> Self {
        Self {
            valid: true,
            invalid_at: None,
            error: None,
        }
    }

    fn broken(index: usize, error: String) -> Self {
        Self {
            valid: false,
            invalid_at: Some(index),
            error: Some(error),
        }
    }
}

/// Tagged evaluation outcome, appended per evaluation step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EvaluationResult {
    TrustSnapshot {
        snapshot: Value,
    },
    TrustGate {
        required: u8,
        actual: u8,
        passed: bool,
    },
    Basis {
        policies: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Decision {
        outcome: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
    },
    Error {
        message: String,
    },
    Cancelled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// A persisted evaluation row.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub tenant_id: String,
    pub result: Value,
    pub created_at: DateTime<Utc>,
}

/// Input to `create_intent_with_event`; payloads arrive post-redaction and,
/// when enabled for the tenant, already enveloped.
#[derive(Debug, Clone)]
pub struct NewIntent {
    pub id: Uuid,
    pub tenant_id: String,
    pub entity_id: String,
    pub goal: String,
    pub intent_type: Option<String>,
    pub priority: u8,
    pub context: Value,
    pub metadata: Value,
    pub dedupe_hash: String,
    pub trust_snapshot: Option<Value>,
    pub trust_level: Option<u8>,
    pub trust_score: Option<u32>,
}

/// List filter and pagination inputs.
#[derive(Debug, Clone, Default)]
pub struct IntentFilter {
    pub tenant_id: String,
    pub status: Option<IntentStatus>,
    pub entity_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: u64,
    pub offset: Option<u64>,
    pub cursor: Option<String>,
}

/// One page of intents, newest first.
#[derive(Debug, Clone)]
pub struct IntentPage {
    pub items: Vec<Intent>,
    pub limit: u64,
    pub offset: Option<u64>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

const DEFAULT_PAGE_SIZE: u64 = 50;

/// Repository owning all `intents` / `intent_events` / `intent_evaluations`
/// writes.
#[derive(Clone)]
pub struct IntentRepository {
    store: Store,
    clock: Arc<dyn Clock>,
    cipher: Option<Arc<PayloadCipher>>,
}

impl IntentRepository {
    pub fn new(store: Store, clock: Arc<dyn Clock>, cipher: Option<Arc<PayloadCipher>>) -> Self {
        Self {
            store,
            clock,
            cipher,
        }
    }

    /// Clock time truncated to millisecond precision, the granularity the
    /// event chain hashes over.
    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
    }

    fn read_payload(&self, value: &Value) -> CoreResult<Map<String, Value>> {
        if is_envelope(value) {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                CoreError::Encryption("encrypted payload found but no key is configured".to_string())
            })?;
            return cipher.decrypt_value(value);
        }
        Ok(match value {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        })
    }

    fn map_intent(&self, model: entity::intents::Model) -> CoreResult<Intent> {
        Ok(Intent {
            id: model.id,
            tenant_id: model.tenant_id,
            entity_id: model.entity_id,
            goal: model.goal,
            intent_type: model.intent_type,
            priority: model.priority.clamp(0, 9) as u8,
            status: IntentStatus::parse(&model.status)?,
            context: self.read_payload(&model.context)?,
            metadata: self.read_payload(&model.metadata)?,
            dedupe_hash: model.dedupe_hash,
            trust_snapshot: model.trust_snapshot,
            trust_level: model.trust_level.map(|l| l.clamp(0, 4) as u8),
            trust_score: model.trust_score.map(|s| s.max(0) as u32),
            created_at: model.created_at,
            updated_at: model.updated_at,
            deleted_at: model.deleted_at,
            cancellation_reason: model.cancellation_reason,
        })
    }

    fn map_event(model: entity::intent_events::Model) -> IntentEvent {
        IntentEvent {
            id: model.id,
            intent_id: model.intent_id,
            event_type: model.event_type,
            payload: model.payload,
            occurred_at: model.occurred_at,
            hash: model.hash,
            previous_hash: model.previous_hash,
        }
    }

    /// Canonical bytes hashed for one event. `occurred_at` enters as epoch
    /// milliseconds so the digest is independent of timestamp formatting.
    fn event_preimage(
        intent_id: Uuid,
        event_type: &str,
        payload: &Value,
        occurred_at: DateTime<Utc>,
    ) -> CoreResult<Vec<u8>> {
        canonical_json_bytes(&json!({
            "intent_id": intent_id,
            "event_type": event_type,
            "payload": payload,
            "occurred_at": occurred_at.timestamp_millis(),
        }))
    }

    /// Create the intent row and its `intent.submitted` event in one
    /// transaction. A unique-index violation surfaces as [`CoreError::Conflict`]
    /// so the caller can fall back to duplicate lookup.
    pub async fn create_intent_with_event(&self, new: NewIntent) -> CoreResult<Intent> {
        let now = self.now();
        let txn = self.store.begin().await?;

        let row = entity::intents::ActiveModel {
            id: Set(new.id),
            tenant_id: Set(new.tenant_id.clone()),
            entity_id: Set(new.entity_id.clone()),
            goal: Set(new.goal.clone()),
            intent_type: Set(new.intent_type.clone()),
            priority: Set(i32::from(new.priority)),
            status: Set(IntentStatus::Pending.as_str().to_string()),
            context: Set(new.context.clone()),
            metadata: Set(new.metadata.clone()),
            dedupe_hash: Set(new.dedupe_hash.clone()),
            trust_snapshot: Set(new.trust_snapshot.clone()),
            trust_level: Set(new.trust_level.map(i16::from)),
            trust_score: Set(new.trust_score.map(|s| s as i32)),
            created_at: Set(now),
            updated_at: Set(now),
            deleted_at: Set(None),
            cancellation_reason: Set(None),
        };
        let inserted = match row.insert(&txn).await {
            Ok(model) => model,
            Err(err) => {
                if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) {
                    return Err(CoreError::Conflict(format!(
                        "intent with this fingerprint already exists for tenant `{}`",
                        new.tenant_id
                    )));
                }
                return Err(err.into());
            }
        };

        let payload = json!({
            "goal": new.goal,
            "intent_type": new.intent_type,
            "priority": new.priority,
            "trust_level": new.trust_level,
        });
        let previous = ChainHash::zero();
        let preimage = Self::event_preimage(new.id, "intent.submitted", &payload, now)?;
        let hash = ChainHash::chained(&preimage, &previous);

        entity::intent_events::ActiveModel {
            id: Set(Uuid::new_v4()),
            intent_id: Set(new.id),
            event_type: Set("intent.submitted".to_string()),
            payload: Set(payload),
            occurred_at: Set(now),
            hash: Set(hash.into()),
            previous_hash: Set(previous.into()),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        self.map_intent(inserted)
    }

    /// Append an event, chaining it to the intent's latest hash.
    pub async fn record_event(
        &self,
        intent_id: Uuid,
        event_type: &str,
        payload: Value,
    ) -> CoreResult<IntentEvent> {
        let now = self.now();
        let txn = self.store.begin().await?;

        // Serialize concurrent appends on the parent row; SQLite already
        // serializes writers.
        if self.store.db().get_database_backend() == DbBackend::Postgres {
            entity::intents::Entity::find_by_id(intent_id)
                .lock_exclusive()
                .one(&txn)
                .await?;
        }

        let previous = entity::intent_events::Entity::find()
            .filter(entity::intent_events::Column::IntentId.eq(intent_id))
            .order_by_desc(entity::intent_events::Column::OccurredAt)
            .order_by_desc(entity::intent_events::Column::Id)
            .one(&txn)
            .await?
            .map(|event| ChainHash::from_str(&event.hash))
            .transpose()?
            .unwrap_or_else(ChainHash::zero);

        let preimage = Self::event_preimage(intent_id, event_type, &payload, now)?;
        let hash = ChainHash::chained(&preimage, &previous);

        let inserted = entity::intent_events::ActiveModel {
            id: Set(Uuid::new_v4()),
            intent_id: Set(intent_id),
            event_type: Set(event_type.to_string()),
            payload: Set(payload),
            occurred_at: Set(now),
            hash: Set(hash.into()),
            previous_hash: Set(previous.into()),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok(Self::map_event(inserted))
    }

    /// All events for an intent in chain order.
    pub async fn list_events(&self, intent_id: Uuid) -> CoreResult<Vec<IntentEvent>> {
        let rows = entity::intent_events::Entity::find()
            .filter(entity::intent_events::Column::IntentId.eq(intent_id))
            .order_by_asc(entity::intent_events::Column::OccurredAt)
            .order_by_asc(entity::intent_events::Column::Id)
            .all(self.store.db())
            .await?;
        Ok(rows.into_iter().map(Self::map_event).collect())
    }

    /// Replay the chain and report the first break, if any.
    pub async fn verify_event_chain(&self, intent_id: Uuid) -> CoreResult<ChainVerification> {
        let events = self.list_events(intent_id).await?;
        let mut previous = ChainHash::zero();

        for (index, event) in events.iter().enumerate() {
            if event.previous_hash != previous.as_str() {
                return Ok(ChainVerification::broken(
                    index,
                    format!("Broken linkage at event {index}"),
                ));
            }
            let preimage = Self::event_preimage(
                event.intent_id,
                &event.event_type,
                &event.payload,
                event.occurred_at,
            )?;
            let expected = ChainHash::chained(&preimage, &previous);
            if event.hash != expected.as_str() {
                return Ok(ChainVerification::broken(
                    index,
                    format!("Hash mismatch at event {index}"),
                ));
            }
            previous = expected;
        }
        Ok(ChainVerification::ok())
    }

    /// Fetch a live (non-deleted) intent scoped to its tenant.
    pub async fn find_by_id(&self, id: Uuid, tenant_id: &str) -> CoreResult<Option<Intent>> {
        let row = entity::intents::Entity::find()
            .filter(entity::intents::Column::Id.eq(id))
            .filter(entity::intents::Column::TenantId.eq(tenant_id))
            .filter(entity::intents::Column::DeletedAt.is_null())
            .one(self.store.db())
            .await?;
        row.map(|model| self.map_intent(model)).transpose()
    }

    /// Fetch a live intent by its dedupe fingerprint.
    pub async fn find_by_dedupe(
        &self,
        tenant_id: &str,
        dedupe_hash: &str,
    ) -> CoreResult<Option<Intent>> {
        let row = entity::intents::Entity::find()
            .filter(entity::intents::Column::TenantId.eq(tenant_id))
            .filter(entity::intents::Column::DedupeHash.eq(dedupe_hash))
            .filter(entity::intents::Column::DeletedAt.is_null())
            .one(self.store.db())
            .await?;
        row.map(|model| self.map_intent(model)).transpose()
    }

    /// Cursor- or offset-paginated listing, newest first.
    pub async fn list_intents(&self, filter: IntentFilter) -> CoreResult<IntentPage> {
        let max_page = self.store.config().max_page_size;
        let limit = match filter.limit {
            0 => DEFAULT_PAGE_SIZE.min(max_page),
            n => n.min(max_page),
        };

        let mut query = entity::intents::Entity::find()
            .filter(entity::intents::Column::TenantId.eq(&filter.tenant_id))
            .filter(entity::intents::Column::DeletedAt.is_null());
        if let Some(status) = filter.status {
            query = query.filter(entity::intents::Column::Status.eq(status.as_str()));
        }
        if let Some(entity_id) = &filter.entity_id {
            query = query.filter(entity::intents::Column::EntityId.eq(entity_id));
        }
        if let Some(after) = filter.created_after {
            query = query.filter(entity::intents::Column::CreatedAt.gt(after));
        }
        if let Some(before) = filter.created_before {
            query = query.filter(entity::intents::Column::CreatedAt.lt(before));
        }
        if let Some(cursor) = &filter.cursor {
            let (created_at, id) = decode_cursor(cursor)?;
            query = query.filter(
                Condition::any()
                    .add(entity::intents::Column::CreatedAt.lt(created_at))
                    .add(
                        Condition::all()
                            .add(entity::intents::Column::CreatedAt.eq(created_at))
                            .add(entity::intents::Column::Id.lt(id)),
                    ),
            );
        }

        query = query
            .order_by_desc(entity::intents::Column::CreatedAt)
            .order_by_desc(entity::intents::Column::Id)
            .limit(limit + 1);
        if filter.cursor.is_none() {
            if let Some(offset) = filter.offset {
                query = query.offset(offset);
            }
        }

        let mut rows = query.all(self.store.db()).await?;
        let has_more = rows.len() as u64 > limit;
        rows.truncate(limit as usize);

        let next_cursor = if has_more {
            rows.last()
                .map(|row| encode_cursor(row.created_at, row.id))
        } else {
            None
        };
        let items = rows
            .into_iter()
            .map(|model| self.map_intent(model))
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(IntentPage {
            items,
            limit,
            offset: filter.offset,
            next_cursor,
            has_more,
        })
    }

    /// Soft delete: hides the row and empties its payloads. Events and
    /// evaluations stay untouched for audit.
    pub async fn soft_delete(&self, id: Uuid, tenant_id: &str) -> CoreResult<bool> {
        let now = self.now();
        let result = entity::intents::Entity::update_many()
            .col_expr(entity::intents::Column::DeletedAt, Expr::value(Some(now)))
            .col_expr(entity::intents::Column::UpdatedAt, Expr::value(now))
            .col_expr(entity::intents::Column::Context, Expr::value(json!({})))
            .col_expr(entity::intents::Column::Metadata, Expr::value(json!({})))
            .filter(entity::intents::Column::Id.eq(id))
            .filter(entity::intents::Column::TenantId.eq(tenant_id))
            .filter(entity::intents::Column::DeletedAt.is_null())
            .exec(self.store.db())
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Purge soft-deleted rows past retention. The `deleted_at IS NOT NULL`
    /// predicate is mandatory; live rows are never touched here.
    pub async fn purge_deleted(&self, retention_days: i64) -> CoreResult<u64> {
        let cutoff = self.now() - Duration::days(retention_days);
        let result = entity::intents::Entity::delete_many()
            .filter(entity::intents::Column::DeletedAt.is_not_null())
            .filter(entity::intents::Column::DeletedAt.lt(cutoff))
            .exec(self.store.db())
            .await?;
        Ok(result.rows_affected)
    }

    /// Optimistic cancellation: succeeds only from a cancellable status.
    /// Returns `None` when the row is missing or not cancellable.
    pub async fn cancel_intent(
        &self,
        id: Uuid,
        tenant_id: &str,
        reason: &str,
    ) -> CoreResult<Option<Intent>> {
        let now = self.now();
        let cancellable: Vec<&str> = IN_FLIGHT_STATUSES
            .iter()
            .filter(|status| status.is_cancellable())
            .map(IntentStatus::as_str)
            .collect();

        let result = entity::intents::Entity::update_many()
            .col_expr(
                entity::intents::Column::Status,
                Expr::value(IntentStatus::Cancelled.as_str()),
            )
            .col_expr(
                entity::intents::Column::CancellationReason,
                Expr::value(Some(reason.to_string())),
            )
            .col_expr(entity::intents::Column::UpdatedAt, Expr::value(now))
            .filter(entity::intents::Column::Id.eq(id))
            .filter(entity::intents::Column::TenantId.eq(tenant_id))
            .filter(entity::intents::Column::DeletedAt.is_null())
            .filter(entity::intents::Column::Status.is_in(cancellable))
            .exec(self.store.db())
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.find_by_id(id, tenant_id).await
    }

    /// Linearized status transition keyed on the expected current status.
    /// Returns false when another writer got there first.
    pub async fn update_status(
        &self,
        id: Uuid,
        tenant_id: &str,
        expected_from: IntentStatus,
        to: IntentStatus,
    ) -> CoreResult<bool> {
        let now = self.now();
        let result = entity::intents::Entity::update_many()
            .col_expr(
                entity::intents::Column::Status,
                Expr::value(to.as_str()),
            )
            .col_expr(entity::intents::Column::UpdatedAt, Expr::value(now))
            .filter(entity::intents::Column::Id.eq(id))
            .filter(entity::intents::Column::TenantId.eq(tenant_id))
            .filter(entity::intents::Column::DeletedAt.is_null())
            .filter(entity::intents::Column::Status.eq(expected_from.as_str()))
            .exec(self.store.db())
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Persist a refreshed trust snapshot/level/score.
    pub async fn update_trust(
        &self,
        id: Uuid,
        tenant_id: &str,
        snapshot: Option<Value>,
        level: Option<u8>,
        score: Option<u32>,
    ) -> CoreResult<Option<Intent>> {
        let now = self.now();
        let result = entity::intents::Entity::update_many()
            .col_expr(
                entity::intents::Column::TrustSnapshot,
                Expr::value(snapshot),
            )
            .col_expr(
                entity::intents::Column::TrustLevel,
                Expr::value(level.map(i16::from)),
            )
            .col_expr(
                entity::intents::Column::TrustScore,
                Expr::value(score.map(|s| s as i32)),
            )
            .col_expr(entity::intents::Column::UpdatedAt, Expr::value(now))
            .filter(entity::intents::Column::Id.eq(id))
            .filter(entity::intents::Column::TenantId.eq(tenant_id))
            .filter(entity::intents::Column::DeletedAt.is_null())
            .exec(self.store.db())
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.find_by_id(id, tenant_id).await
    }

    /// Intents counted against the tenant's in-flight cap.
    pub async fn count_active(&self, tenant_id: &str) -> CoreResult<u64> {
        let statuses: Vec<&str> = IN_FLIGHT_STATUSES.iter().map(IntentStatus::as_str).collect();
        Ok(entity::intents::Entity::find()
            .filter(entity::intents::Column::TenantId.eq(tenant_id))
            .filter(entity::intents::Column::DeletedAt.is_null())
            .filter(entity::intents::Column::Status.is_in(statuses))
            .count(self.store.db())
            .await?)
    }

    /// Append an evaluation outcome row.
    pub async fn record_evaluation(
        &self,
        intent_id: Uuid,
        tenant_id: &str,
        result: &EvaluationResult,
    ) -> CoreResult<Evaluation> {
        let now = self.now();
        let inserted = entity::intent_evaluations::ActiveModel {
            id: Set(Uuid::new_v4()),
            intent_id: Set(intent_id),
            tenant_id: Set(tenant_id.to_string()),
            result: Set(serde_json::to_value(result)?),
            created_at: Set(now),
        }
        .insert(self.store.db())
        .await?;

        Ok(Evaluation {
            id: inserted.id,
            intent_id: inserted.intent_id,
            tenant_id: inserted.tenant_id,
            result: inserted.result,
            created_at: inserted.created_at,
        })
    }

    /// Evaluations for an intent, oldest first.
    pub async fn list_evaluations(&self, intent_id: Uuid) -> CoreResult<Vec<Evaluation>> {
        let rows = entity::intent_evaluations::Entity::find()
            .filter(entity::intent_evaluations::Column::IntentId.eq(intent_id))
            .order_by_asc(entity::intent_evaluations::Column::CreatedAt)
            .all(self.store.db())
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Evaluation {
                id: row.id,
                intent_id: row.intent_id,
                tenant_id: row.tenant_id,
                result: row.result,
                created_at: row.created_at,
            })
            .collect())
    }

}

fn encode_cursor(created_at: DateTime<Utc>, id: Uuid) -> String {
    format!("{}:{}", created_at.timestamp_millis(), id)
}

fn decode_cursor(cursor: &str) -> CoreResult<(DateTime<Utc>, Uuid)> {
    let invalid = || CoreError::Validation(format!("invalid cursor: `{cursor}`"));
    let (millis, id) = cursor.split_once(':').ok_or_else(invalid)?;
    let millis: i64 = millis.parse().map_err(|_| invalid())?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(invalid)?;
    let id = Uuid::parse_str(id).map_err(|_| invalid())?;
    Ok((created_at, id))
}
