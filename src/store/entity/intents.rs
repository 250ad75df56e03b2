//! The `intents` table: one row per governed intent.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "intents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: String,
    pub entity_id: String,
    pub goal: String,
    pub intent_type: Option<String>,
    pub priority: i32,
    pub status: String,
    /// Clear JSON object or a sentinel-tagged encrypted envelope.
    pub context: Json,
    /// Clear JSON object or a sentinel-tagged encrypted envelope.
    pub metadata: Json,
    pub dedupe_hash: String,
    pub trust_snapshot: Option<Json>,
    pub trust_level: Option<i16>,
    pub trust_score: Option<i32>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub deleted_at: Option<DateTimeUtc>,
    pub cancellation_reason: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
