//! The `consent_policies` table: versioned policy texts per tenant.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "consent_policies")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: String,
    pub consent_type: String,
    pub version: String,
    #[sea_orm(column_type = "Text")]
    pub content: String,
    pub effective_from: DateTimeUtc,
    /// Null marks the single current policy per `(tenant, consent_type)`.
    pub effective_to: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
