//! The `intent_events` table: append-only, hash-chained per intent.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "intent_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub intent_id: Uuid,
    /// Dotted namespace, e.g. `intent.submitted`.
    pub event_type: String,
    pub payload: Json,
    pub occurred_at: DateTimeUtc,
    /// SHA-256 over the canonical event joined with `previous_hash`.
    pub hash: String,
    /// Predecessor's hash; 64 zeros for the first event of a chain.
    pub previous_hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
