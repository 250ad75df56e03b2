//! Escalation repository: conditional lifecycle updates over escalation
//! rows. The KV indices over these rows live in the escalation service;
//! everything here must stay reconstructible from this table alone.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, sea_query::Expr,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{Store, entity};
use crate::{
    errors::{CoreError, CoreResult},
    time::Clock,
};

/// Escalation workflow status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Acknowledged,
    Approved,
    Rejected,
    Timeout,
    Cancelled,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Acknowledged => "acknowledged",
            EscalationStatus::Approved => "approved",
            EscalationStatus::Rejected => "rejected",
            EscalationStatus::Timeout => "timeout",
            EscalationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "pending" => Ok(EscalationStatus::Pending),
            "acknowledged" => Ok(EscalationStatus::Acknowledged),
            "approved" => Ok(EscalationStatus::Approved),
            "rejected" => Ok(EscalationStatus::Rejected),
            "timeout" => Ok(EscalationStatus::Timeout),
            "cancelled" => Ok(EscalationStatus::Cancelled),
            other => Err(CoreError::Internal(format!(
                "unknown escalation status `{other}` in store"
            ))),
        }
    }

    /// Open escalations still await a human decision.
    pub fn is_open(&self) -> bool {
        matches!(self, EscalationStatus::Pending | EscalationStatus::Acknowledged)
    }
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const OPEN_STATUSES: [&str; 2] = ["pending", "acknowledged"];

/// Why the intent was escalated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCategory {
    TrustInsufficient,
    HighRisk,
    PolicyViolation,
    ManualReview,
    ConstraintEscalate,
}

impl ReasonCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCategory::TrustInsufficient => "trust_insufficient",
            ReasonCategory::HighRisk => "high_risk",
            ReasonCategory::PolicyViolation => "policy_violation",
            ReasonCategory::ManualReview => "manual_review",
            ReasonCategory::ConstraintEscalate => "constraint_escalate",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "trust_insufficient" => Ok(ReasonCategory::TrustInsufficient),
            "high_risk" => Ok(ReasonCategory::HighRisk),
            "policy_violation" => Ok(ReasonCategory::PolicyViolation),
            "manual_review" => Ok(ReasonCategory::ManualReview),
            "constraint_escalate" => Ok(ReasonCategory::ConstraintEscalate),
            other => Err(CoreError::Validation(format!(
                "unknown reason category `{other}`"
            ))),
        }
    }
}

/// A mapped escalation. Serializable for the KV read cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub tenant_id: String,
    pub reason: String,
    pub reason_category: ReasonCategory,
    pub escalated_to: String,
    pub escalated_by: Option<String>,
    pub status: EscalationStatus,
    pub timeout: String,
    pub timeout_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub sla_breached: bool,
    pub context: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to `insert`.
#[derive(Debug, Clone)]
pub struct NewEscalation {
    pub intent_id: Uuid,
    pub tenant_id: String,
    pub reason: String,
    pub reason_category: ReasonCategory,
    pub escalated_to: String,
    pub escalated_by: Option<String>,
    pub context: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

/// Repository owning all `escalations` writes.
#[derive(Clone)]
pub struct EscalationRepository {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl EscalationRepository {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
    }

    fn map(model: entity::escalations::Model) -> CoreResult<Escalation> {
        let as_map = |value: Value| match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Escalation {
            id: model.id,
            intent_id: model.intent_id,
            tenant_id: model.tenant_id,
            reason: model.reason,
            reason_category: ReasonCategory::parse(&model.reason_category)?,
            escalated_to: model.escalated_to,
            escalated_by: model.escalated_by,
            status: EscalationStatus::parse(&model.status)?,
            timeout: model.timeout,
            timeout_at: model.timeout_at,
            acknowledged_at: model.acknowledged_at,
            resolved_by: model.resolved_by,
            resolved_at: model.resolved_at,
            resolution_notes: model.resolution_notes,
            sla_breached: model.sla_breached,
            context: as_map(model.context),
            metadata: as_map(model.metadata),
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }

    /// Insert a pending escalation with a resolved absolute deadline.
    pub async fn insert(
        &self,
        new: NewEscalation,
        timeout_text: &str,
        timeout_at: DateTime<Utc>,
    ) -> CoreResult<Escalation> {
        let now = self.now();
        let inserted = entity::escalations::ActiveModel {
            id: Set(Uuid::new_v4()),
            intent_id: Set(new.intent_id),
            tenant_id: Set(new.tenant_id),
            reason: Set(new.reason),
            reason_category: Set(new.reason_category.as_str().to_string()),
            escalated_to: Set(new.escalated_to),
            escalated_by: Set(new.escalated_by),
            status: Set(EscalationStatus::Pending.as_str().to_string()),
            timeout: Set(timeout_text.to_string()),
            timeout_at: Set(timeout_at),
            acknowledged_at: Set(None),
            resolved_by: Set(None),
            resolved_at: Set(None),
            resolution_notes: Set(None),
            sla_breached: Set(false),
            context: Set(Value::Object(new.context)),
            metadata: Set(Value::Object(new.metadata)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.store.db())
        .await?;
        Self::map(inserted)
    }

    pub async fn find_by_id(&self, id: Uuid) -> CoreResult<Option<Escalation>> {
        let row = entity::escalations::Entity::find_by_id(id)
            .one(self.store.db())
            .await?;
        row.map(Self::map).transpose()
    }

    /// The open escalation for an intent, if one exists. The state machine
    /// keeps this at most one by gating re-escalation on intent status.
    pub async fn find_open_by_intent(&self, intent_id: Uuid) -> CoreResult<Option<Escalation>> {
        let row = entity::escalations::Entity::find()
            .filter(entity::escalations::Column::IntentId.eq(intent_id))
            .filter(entity::escalations::Column::Status.is_in(OPEN_STATUSES))
            .order_by_desc(entity::escalations::Column::CreatedAt)
            .one(self.store.db())
            .await?;
        row.map(Self::map).transpose()
    }

    /// Full escalation history for an intent, oldest first.
    pub async fn list_by_intent(&self, intent_id: Uuid) -> CoreResult<Vec<Escalation>> {
        let rows = entity::escalations::Entity::find()
            .filter(entity::escalations::Column::IntentId.eq(intent_id))
            .order_by_asc(entity::escalations::Column::CreatedAt)
            .all(self.store.db())
            .await?;
        rows.into_iter().map(Self::map).collect()
    }

    /// Conditional `pending -> acknowledged`. Returns the updated row, or
    /// `None` when the escalation was not pending anymore.
    pub async fn acknowledge(
        &self,
        id: Uuid,
        acknowledged_by: &str,
    ) -> CoreResult<Option<Escalation>> {
        let Some(current) = self.find_by_id(id).await? else {
            return Ok(None);
        };
        let now = self.now();
        let mut metadata = current.metadata.clone();
        metadata.insert(
            "acknowledged_by".to_string(),
            Value::String(acknowledged_by.to_string()),
        );

        let result = entity::escalations::Entity::update_many()
            .col_expr(
                entity::escalations::Column::Status,
                Expr::value(EscalationStatus::Acknowledged.as_str()),
            )
            .col_expr(
                entity::escalations::Column::AcknowledgedAt,
                Expr::value(Some(now)),
            )
            .col_expr(
                entity::escalations::Column::Metadata,
                Expr::value(Value::Object(metadata)),
            )
            .col_expr(entity::escalations::Column::UpdatedAt, Expr::value(now))
            .filter(entity::escalations::Column::Id.eq(id))
            .filter(
                entity::escalations::Column::Status.eq(EscalationStatus::Pending.as_str()),
            )
            .exec(self.store.db())
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    /// Conditional resolution from an open status to a terminal one.
    pub async fn resolve(
        &self,
        id: Uuid,
        to: EscalationStatus,
        resolved_by: &str,
        resolution_notes: Option<&str>,
        sla_breached: bool,
    ) -> CoreResult<Option<Escalation>> {
        let now = self.now();
        let result = entity::escalations::Entity::update_many()
            .col_expr(
                entity::escalations::Column::Status,
                Expr::value(to.as_str()),
            )
            .col_expr(
                entity::escalations::Column::ResolvedBy,
                Expr::value(Some(resolved_by.to_string())),
            )
            .col_expr(
                entity::escalations::Column::ResolvedAt,
                Expr::value(Some(now)),
            )
            .col_expr(
                entity::escalations::Column::ResolutionNotes,
                Expr::value(resolution_notes.map(str::to_string)),
            )
            .col_expr(
                entity::escalations::Column::SlaBreached,
                Expr::value(sla_breached),
            )
            .col_expr(entity::escalations::Column::UpdatedAt, Expr::value(now))
            .filter(entity::escalations::Column::Id.eq(id))
            .filter(entity::escalations::Column::Status.is_in(OPEN_STATUSES))
            .exec(self.store.db())
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    /// Conditional `open -> timeout` with `sla_breached = true`.
    pub async fn mark_timeout(&self, id: Uuid) -> CoreResult<bool> {
        let now = self.now();
        let result = entity::escalations::Entity::update_many()
            .col_expr(
                entity::escalations::Column::Status,
                Expr::value(EscalationStatus::Timeout.as_str()),
            )
            .col_expr(entity::escalations::Column::SlaBreached, Expr::value(true))
            .col_expr(
                entity::escalations::Column::ResolvedAt,
                Expr::value(Some(now)),
            )
            .col_expr(entity::escalations::Column::UpdatedAt, Expr::value(now))
            .filter(entity::escalations::Column::Id.eq(id))
            .filter(entity::escalations::Column::Status.is_in(OPEN_STATUSES))
            .exec(self.store.db())
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Open escalations whose deadline has passed (sweeper scan).
    pub async fn list_overdue(
        &self,
        as_of: DateTime<Utc>,
        limit: u64,
    ) -> CoreResult<Vec<Escalation>> {
        let rows = entity::escalations::Entity::find()
            .filter(entity::escalations::Column::Status.is_in(OPEN_STATUSES))
            .filter(entity::escalations::Column::TimeoutAt.lte(as_of))
            .order_by_asc(entity::escalations::Column::TimeoutAt)
            .limit(limit)
            .all(self.store.db())
            .await?;
        rows.into_iter().map(Self::map).collect()
    }

    /// All open escalations, optionally scoped to a tenant (index rebuild).
    pub async fn list_open(&self, tenant_id: Option<&str>) -> CoreResult<Vec<Escalation>> {
        let mut query = entity::escalations::Entity::find()
            .filter(entity::escalations::Column::Status.is_in(OPEN_STATUSES));
        if let Some(tenant_id) = tenant_id {
            query = query.filter(entity::escalations::Column::TenantId.eq(tenant_id));
        }
        let rows = query
            .order_by_asc(entity::escalations::Column::TimeoutAt)
            .all(self.store.db())
            .await?;
        rows.into_iter().map(Self::map).collect()
    }

    /// Pending escalations for a tenant (store fallback for the index).
    pub async fn list_pending(&self, tenant_id: &str) -> CoreResult<Vec<Escalation>> {
        let rows = entity::escalations::Entity::find()
            .filter(entity::escalations::Column::TenantId.eq(tenant_id))
            .filter(
                entity::escalations::Column::Status.eq(EscalationStatus::Pending.as_str()),
            )
            .order_by_asc(entity::escalations::Column::CreatedAt)
            .all(self.store.db())
            .await?;
        rows.into_iter().map(Self::map).collect()
    }

    /// Count escalations for a tenant in a given status.
    pub async fn count_status(
        &self,
        tenant_id: &str,
        status: EscalationStatus,
    ) -> CoreResult<u64> {
        Ok(entity::escalations::Entity::find()
            .filter(entity::escalations::Column::TenantId.eq(tenant_id))
            .filter(entity::escalations::Column::Status.eq(status.as_str()))
            .count(self.store.db())
            .await?)
    }

    /// Count SLA-breached escalations for a tenant.
    pub async fn count_breached(&self, tenant_id: &str) -> CoreResult<u64> {
        Ok(entity::escalations::Entity::find()
            .filter(entity::escalations::Column::TenantId.eq(tenant_id))
            .filter(entity::escalations::Column::SlaBreached.eq(true))
            .count(self.store.db())
            .await?)
    }
}
