//! Consent repository: grant/revoke rows and versioned policies.
//!
//! Consent rows are immutable once revoked except for the single
//! `revoked_at` stamp; a version upgrade is a revoke-of-old plus
//! insert-of-new pair inside one transaction. For each
//! `(tenant, consent_type)` at most one policy row has `effective_to IS
//! NULL` — the current policy — enforced by a partial unique index.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, sea_query::Expr,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Store, entity};
use crate::{
    errors::{CoreError, CoreResult},
    time::Clock,
};

/// Consent categories the registry accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConsentType {
    DataProcessing,
    Analytics,
    Marketing,
}

impl ConsentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentType::DataProcessing => "data_processing",
            ConsentType::Analytics => "analytics",
            ConsentType::Marketing => "marketing",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "data_processing" => Ok(ConsentType::DataProcessing),
            "analytics" => Ok(ConsentType::Analytics),
            "marketing" => Ok(ConsentType::Marketing),
            other => Err(CoreError::Validation(format!(
                "unknown consent type `{other}`"
            ))),
        }
    }
}

impl fmt::Display for ConsentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A mapped consent row.
#[derive(Debug, Clone, Serialize)]
pub struct Consent {
    pub id: Uuid,
    pub user_id: String,
    pub tenant_id: String,
    pub consent_type: ConsentType,
    pub granted: bool,
    pub granted_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub version: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// A mapped policy row.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentPolicy {
    pub id: Uuid,
    pub tenant_id: String,
    pub consent_type: ConsentType,
    pub version: String,
    pub content: String,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
}

/// Request-context attribution captured on grant.
#[derive(Debug, Clone, Default)]
pub struct GrantAttribution {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Outcome of an upsert-style grant.
#[derive(Debug, Clone)]
pub enum GrantOutcome {
    /// Same version already active; nothing written.
    Unchanged(Consent),
    /// Old version revoked, new version inserted.
    Upgraded { revoked: Consent, granted: Consent },
    /// No prior active consent; fresh insert.
    Created(Consent),
}

impl GrantOutcome {
    /// The consent row that is active after the operation.
    pub fn active(&self) -> &Consent {
        match self {
            GrantOutcome::Unchanged(consent) => consent,
            GrantOutcome::Upgraded { granted, .. } => granted,
            GrantOutcome::Created(consent) => consent,
        }
    }
}

/// Repository owning all consent and policy writes.
#[derive(Clone)]
pub struct ConsentRepository {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl ConsentRepository {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
    }

    fn map_consent(model: entity::user_consents::Model) -> CoreResult<Consent> {
        Ok(Consent {
            id: model.id,
            user_id: model.user_id,
            tenant_id: model.tenant_id,
            consent_type: ConsentType::parse(&model.consent_type)?,
            granted: model.granted,
            granted_at: model.granted_at,
            revoked_at: model.revoked_at,
            version: model.version,
            ip_address: model.ip_address,
            user_agent: model.user_agent,
        })
    }

    fn map_policy(model: entity::consent_policies::Model) -> CoreResult<ConsentPolicy> {
        Ok(ConsentPolicy {
            id: model.id,
            tenant_id: model.tenant_id,
            consent_type: ConsentType::parse(&model.consent_type)?,
            version: model.version,
            content: model.content,
            effective_from: model.effective_from,
            effective_to: model.effective_to,
        })
    }

    /// The single active (granted, unrevoked) consent row, if any.
    pub async fn find_active(
        &self,
        user_id: &str,
        tenant_id: &str,
        consent_type: ConsentType,
    ) -> CoreResult<Option<Consent>> {
        let row = entity::user_consents::Entity::find()
            .filter(entity::user_consents::Column::UserId.eq(user_id))
            .filter(entity::user_consents::Column::TenantId.eq(tenant_id))
            .filter(entity::user_consents::Column::ConsentType.eq(consent_type.as_str()))
            .filter(entity::user_consents::Column::Granted.eq(true))
            .filter(entity::user_consents::Column::RevokedAt.is_null())
            .order_by_desc(entity::user_consents::Column::GrantedAt)
            .one(self.store.db())
            .await?;
        row.map(Self::map_consent).transpose()
    }

    /// Grant with upsert semantics: same active version is a no-op; a
    /// different active version is revoked and replaced in one transaction.
    pub async fn upsert_grant(
        &self,
        user_id: &str,
        tenant_id: &str,
        consent_type: ConsentType,
        version: &str,
        attribution: GrantAttribution,
    ) -> CoreResult<GrantOutcome> {
        let now = self.now();
        let existing = self.find_active(user_id, tenant_id, consent_type).await?;

        if let Some(active) = &existing {
            if active.version == version {
                return Ok(GrantOutcome::Unchanged(active.clone()));
            }
        }

        let txn = self.store.begin().await?;
        let revoked = if let Some(active) = existing {
            entity::user_consents::Entity::update_many()
                .col_expr(entity::user_consents::Column::Granted, Expr::value(false))
                .col_expr(
                    entity::user_consents::Column::RevokedAt,
                    Expr::value(Some(now)),
                )
                .filter(entity::user_consents::Column::Id.eq(active.id))
                .filter(entity::user_consents::Column::RevokedAt.is_null())
                .exec(&txn)
                .await?;
            Some(Consent {
                granted: false,
                revoked_at: Some(now),
                ..active
            })
        } else {
            None
        };

        let inserted = entity::user_consents::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id.to_string()),
            tenant_id: Set(tenant_id.to_string()),
            consent_type: Set(consent_type.as_str().to_string()),
            granted: Set(true),
            granted_at: Set(now),
            revoked_at: Set(None),
            version: Set(version.to_string()),
            ip_address: Set(attribution.ip_address),
            user_agent: Set(attribution.user_agent),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        let granted = Self::map_consent(inserted)?;
        Ok(match revoked {
            Some(revoked) => GrantOutcome::Upgraded { revoked, granted },
            None => GrantOutcome::Created(granted),
        })
    }

    /// Idempotent revoke. Returns `None` when no active consent exists.
    pub async fn revoke(
        &self,
        user_id: &str,
        tenant_id: &str,
        consent_type: ConsentType,
    ) -> CoreResult<Option<Consent>> {
        let Some(active) = self.find_active(user_id, tenant_id, consent_type).await? else {
            return Ok(None);
        };
        let now = self.now();
        let result = entity::user_consents::Entity::update_many()
            .col_expr(entity::user_consents::Column::Granted, Expr::value(false))
            .col_expr(
                entity::user_consents::Column::RevokedAt,
                Expr::value(Some(now)),
            )
            .filter(entity::user_consents::Column::Id.eq(active.id))
            .filter(entity::user_consents::Column::Granted.eq(true))
            .filter(entity::user_consents::Column::RevokedAt.is_null())
            .exec(self.store.db())
            .await?;

        if result.rows_affected == 0 {
            // Lost the race to another revoker; already revoked either way.
            return Ok(None);
        }
        Ok(Some(Consent {
            granted: false,
            revoked_at: Some(now),
            ..active
        }))
    }

    /// Every consent row for the pair, newest grant first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        tenant_id: &str,
    ) -> CoreResult<Vec<Consent>> {
        let rows = entity::user_consents::Entity::find()
            .filter(entity::user_consents::Column::UserId.eq(user_id))
            .filter(entity::user_consents::Column::TenantId.eq(tenant_id))
            .order_by_desc(entity::user_consents::Column::GrantedAt)
            .all(self.store.db())
            .await?;
        rows.into_iter().map(Self::map_consent).collect()
    }

    /// Publish a new policy version: closes the current row and inserts the
    /// next inside one transaction.
    pub async fn create_policy(
        &self,
        tenant_id: &str,
        consent_type: ConsentType,
        version: &str,
        content: &str,
    ) -> CoreResult<ConsentPolicy> {
        let now = self.now();
        let txn = self.store.begin().await?;

        entity::consent_policies::Entity::update_many()
            .col_expr(
                entity::consent_policies::Column::EffectiveTo,
                Expr::value(Some(now)),
            )
            .filter(entity::consent_policies::Column::TenantId.eq(tenant_id))
            .filter(entity::consent_policies::Column::ConsentType.eq(consent_type.as_str()))
            .filter(entity::consent_policies::Column::EffectiveTo.is_null())
            .exec(&txn)
            .await?;

        let inserted = entity::consent_policies::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id.to_string()),
            consent_type: Set(consent_type.as_str().to_string()),
            version: Set(version.to_string()),
            content: Set(content.to_string()),
            effective_from: Set(now),
            effective_to: Set(None),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        Self::map_policy(inserted)
    }

    /// The policy currently in effect.
    pub async fn current_policy(
        &self,
        tenant_id: &str,
        consent_type: ConsentType,
    ) -> CoreResult<Option<ConsentPolicy>> {
        let row = entity::consent_policies::Entity::find()
            .filter(entity::consent_policies::Column::TenantId.eq(tenant_id))
            .filter(entity::consent_policies::Column::ConsentType.eq(consent_type.as_str()))
            .filter(entity::consent_policies::Column::EffectiveTo.is_null())
            .one(self.store.db())
            .await?;
        row.map(Self::map_policy).transpose()
    }

    /// A specific historical version.
    pub async fn policy_by_version(
        &self,
        tenant_id: &str,
        consent_type: ConsentType,
        version: &str,
    ) -> CoreResult<Option<ConsentPolicy>> {
        let row = entity::consent_policies::Entity::find()
            .filter(entity::consent_policies::Column::TenantId.eq(tenant_id))
            .filter(entity::consent_policies::Column::ConsentType.eq(consent_type.as_str()))
            .filter(entity::consent_policies::Column::Version.eq(version))
            .one(self.store.db())
            .await?;
        row.map(Self::map_policy).transpose()
    }

    /// All versions, newest effective_from first.
    pub async fn policy_history(
        &self,
        tenant_id: &str,
        consent_type: ConsentType,
    ) -> CoreResult<Vec<ConsentPolicy>> {
        let rows = entity::consent_policies::Entity::find()
            .filter(entity::consent_policies::Column::TenantId.eq(tenant_id))
            .filter(entity::consent_policies::Column::ConsentType.eq(consent_type.as_str()))
            .order_by_desc(entity::consent_policies::Column::EffectiveFrom)
            .all(self.store.db())
            .await?;
        rows.into_iter().map(Self::map_policy).collect()
    }
}
