//! The `escalations` table: human-in-the-loop decision requests.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "escalations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub intent_id: Uuid,
    pub tenant_id: String,
    pub reason: String,
    pub reason_category: String,
    /// Principal or role tag the decision is routed to.
    pub escalated_to: String,
    pub escalated_by: Option<String>,
    pub status: String,
    /// Original ISO-8601 duration text, e.g. `PT1H`.
    pub timeout: String,
    /// Absolute SLA deadline resolved at creation.
    pub timeout_at: DateTimeUtc,
    pub acknowledged_at: Option<DateTimeUtc>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTimeUtc>,
    pub resolution_notes: Option<String>,
    pub sla_breached: bool,
    pub context: Json,
    pub metadata: Json,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
