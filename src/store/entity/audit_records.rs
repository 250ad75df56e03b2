//! The `audit_records` table: signed governance-decision chain.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "audit_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub intent_id: Uuid,
    pub entity_id: String,
    pub decision: String,
    pub inputs: Json,
    pub outputs: Json,
    pub created_at: DateTimeUtc,
    /// Zero-based position in the global chain.
    pub chain_position: i64,
    pub previous_hash: String,
    pub hash: String,
    pub signature: String,
    pub public_key: String,
    pub algorithm: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
