//! Consent service: grant/revoke/validate/history over consent rows plus
//! policy versioning. Write and validate paths run behind the `consent`
//! circuit breaker so a struggling store degrades into fast
//! `circuit_open` failures instead of piling up timeouts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    breaker::{BreakerRegistry, CircuitBreaker},
    errors::{CoreError, CoreResult},
    store::{
        ConsentRepository,
        consents::{Consent, ConsentPolicy, ConsentType, GrantAttribution, GrantOutcome},
    },
};

const BREAKER_NAME: &str = "consent";

/// Result of `validate_consent`.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentValidation {
    pub valid: bool,
    pub consent_type: ConsentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One entry of a user's consent history. Grant and revoke of the same row
/// surface as separate entries.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentHistoryEntry {
    pub action: &'static str,
    pub consent_type: ConsentType,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Versioned per-tenant consent registry.
pub struct ConsentService {
    repo: ConsentRepository,
    breaker: Arc<CircuitBreaker>,
}

impl ConsentService {
    pub fn new(repo: ConsentRepository, breakers: &BreakerRegistry) -> Self {
        Self {
            repo,
            breaker: breakers.get(BREAKER_NAME),
        }
    }

    /// Grant consent, upgrading the version when one is already active.
    pub async fn grant_consent(
        &self,
        user_id: &str,
        tenant_id: &str,
        consent_type: ConsentType,
        version: &str,
        attribution: GrantAttribution,
    ) -> CoreResult<GrantOutcome> {
        let outcome = self
            .breaker
            .call(|| {
                self.repo
                    .upsert_grant(user_id, tenant_id, consent_type, version, attribution)
            })
            .await?;
        match &outcome {
            GrantOutcome::Unchanged(_) => {
                tracing::debug!(user = user_id, tenant = tenant_id, %consent_type, "consent grant no-op");
            }
            GrantOutcome::Upgraded { revoked, .. } => {
                tracing::info!(
                    user = user_id,
                    tenant = tenant_id,
                    %consent_type,
                    old_version = %revoked.version,
                    new_version = version,
                    "consent version upgraded"
                );
            }
            GrantOutcome::Created(_) => {
                tracing::info!(user = user_id, tenant = tenant_id, %consent_type, version, "consent granted");
            }
        }
        Ok(outcome)
    }

    /// Revoke active consent. Idempotent; `None` when nothing was active.
    pub async fn revoke_consent(
        &self,
        user_id: &str,
        tenant_id: &str,
        consent_type: ConsentType,
    ) -> CoreResult<Option<Consent>> {
        self.breaker
            .call(|| self.repo.revoke(user_id, tenant_id, consent_type))
            .await
    }

    /// Point query: does an active granted row exist?
    pub async fn has_valid_consent(
        &self,
        user_id: &str,
        tenant_id: &str,
        consent_type: ConsentType,
    ) -> CoreResult<bool> {
        Ok(self
            .repo
            .find_active(user_id, tenant_id, consent_type)
            .await?
            .is_some())
    }

    /// Same predicate as `has_valid_consent`, with a structured verdict.
    pub async fn validate_consent(
        &self,
        user_id: &str,
        tenant_id: &str,
        consent_type: ConsentType,
    ) -> CoreResult<ConsentValidation> {
        let active = self
            .breaker
            .call(|| self.repo.find_active(user_id, tenant_id, consent_type))
            .await?;
        Ok(match active {
            Some(consent) => ConsentValidation {
                valid: true,
                consent_type,
                granted_at: Some(consent.granted_at),
                version: Some(consent.version),
                reason: None,
            },
            None => ConsentValidation {
                valid: false,
                consent_type,
                granted_at: None,
                version: None,
                reason: Some(format!(
                    "no active {consent_type} consent for user `{user_id}`"
                )),
            },
        })
    }

    /// Gate helper: error with `consent_required` unless consent is active.
    pub async fn require_consent(
        &self,
        user_id: &str,
        tenant_id: &str,
        consent_type: ConsentType,
    ) -> CoreResult<()> {
        if self
            .has_valid_consent(user_id, tenant_id, consent_type)
            .await?
        {
            Ok(())
        } else {
            Err(CoreError::ConsentRequired {
                user_id: user_id.to_string(),
                consent_type: consent_type.as_str().to_string(),
            })
        }
    }

    /// Full audit trail, newest action first. A revoked row contributes two
    /// entries: its grant and its revoke.
    pub async fn get_consent_history(
        &self,
        user_id: &str,
        tenant_id: &str,
    ) -> CoreResult<Vec<ConsentHistoryEntry>> {
        let rows = self.repo.list_for_user(user_id, tenant_id).await?;
        let mut entries = Vec::with_capacity(rows.len() * 2);
        for row in rows {
            entries.push(ConsentHistoryEntry {
                action: "grant",
                consent_type: row.consent_type,
                version: row.version.clone(),
                timestamp: row.granted_at,
            });
            if let Some(revoked_at) = row.revoked_at {
                entries.push(ConsentHistoryEntry {
                    action: "revoke",
                    consent_type: row.consent_type,
                    version: row.version,
                    timestamp: revoked_at,
                });
            }
        }
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    /// Publish a new policy version, closing the current one.
    pub async fn create_policy(
        &self,
        tenant_id: &str,
        consent_type: ConsentType,
        version: &str,
        content: &str,
    ) -> CoreResult<ConsentPolicy> {
        self.repo
            .create_policy(tenant_id, consent_type, version, content)
            .await
    }

    /// The policy with `effective_to IS NULL`.
    pub async fn get_current_policy(
        &self,
        tenant_id: &str,
        consent_type: ConsentType,
    ) -> CoreResult<Option<ConsentPolicy>> {
        self.repo.current_policy(tenant_id, consent_type).await
    }

    /// A specific policy version for audit.
    pub async fn get_policy(
        &self,
        tenant_id: &str,
        consent_type: ConsentType,
        version: &str,
    ) -> CoreResult<Option<ConsentPolicy>> {
        self.repo
            .policy_by_version(tenant_id, consent_type, version)
            .await
    }

    /// All policy versions, newest first.
    pub async fn get_policy_history(
        &self,
        tenant_id: &str,
        consent_type: ConsentType,
    ) -> CoreResult<Vec<ConsentPolicy>> {
        self.repo.policy_history(tenant_id, consent_type).await
    }
}
