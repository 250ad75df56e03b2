//! The `user_consents` table: grant/revoke rows, never rewritten.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "user_consents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: String,
    pub tenant_id: String,
    pub consent_type: String,
    pub granted: bool,
    pub granted_at: DateTimeUtc,
    /// Set exactly once; a revoked row is otherwise immutable.
    pub revoked_at: Option<DateTimeUtc>,
    pub version: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
