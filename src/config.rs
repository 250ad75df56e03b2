//! Configuration for the intent-core runtime.
//!
//! Plain serde-deserializable structs with `Default` implementations. The
//! host deserializes one [`CoreConfig`] from whatever source it prefers
//! (file, environment, secrets manager) and hands it to
//! [`CoreContext::init`](crate::service::CoreContext::init).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    breaker::BreakerConfig,
    errors::{CoreError, CoreResult},
};

/// Top-level configuration aggregate.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CoreConfig {
    /// Enables production behavior: message sanitization, mandatory dedupe
    /// secret, generic client errors.
    pub production: bool,
    /// Record an `intent.read` event on every fetch. Off by default; the
    /// write is fire-and-forget either way.
    pub audit_reads: bool,
    pub dedupe: DedupeConfig,
    pub trust: TrustConfig,
    pub limits: LimitsConfig,
    pub redaction: RedactionConfig,
    pub encryption: EncryptionConfig,
    pub queue: QueueConfig,
    pub lock: LockConfig,
    pub escalation: EscalationConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub breaker: BreakerConfig,
}

impl CoreConfig {
    /// Rejects configurations that are unusable in the declared environment.
    ///
    /// A missing dedupe secret is tolerated in development (plain SHA-256
    /// fallback with a one-time warning) but is a hard error in production.
    pub fn validate(&self) -> CoreResult<()> {
        if self.production && self.dedupe.secret.is_none() {
            return Err(CoreError::Validation(
                "dedupe.secret is required in production".to_string(),
            ));
        }
        if self.limits.default_max_in_flight == 0 {
            return Err(CoreError::Validation(
                "limits.default_max_in_flight must be nonzero".to_string(),
            ));
        }
        if let Some(key) = &self.encryption.key_hex {
            if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(CoreError::Validation(
                    "encryption.key_hex must be 64 hex characters (32 bytes)".to_string(),
                ));
            }
        } else if !self.encryption.tenants.is_empty() {
            return Err(CoreError::Validation(
                "encryption.tenants set but encryption.key_hex is absent".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deduplication fingerprint settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DedupeConfig {
    /// HMAC key for submission fingerprints. Absent = development fallback
    /// to plain SHA-256 over the same pre-image.
    pub secret: Option<String>,
    /// Width of the replay window bucket folded into the fingerprint.
    pub window_secs: u64,
    /// TTL of the informational fast-path marker in the KV.
    pub marker_ttl_secs: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            secret: None,
            window_secs: 300,
            marker_ttl_secs: 3600,
        }
    }
}

/// Trust gate settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrustConfig {
    /// Minimum trust level required when no per-type gate matches.
    pub default_min_trust_level: u8,
    /// Per-intent-type minimum trust levels.
    pub gates: HashMap<String, u8>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            default_min_trust_level: 1,
            gates: HashMap::new(),
        }
    }
}

/// Tenant concurrency caps.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LimitsConfig {
    /// In-flight cap applied when no per-tenant override exists.
    pub default_max_in_flight: u64,
    /// Per-tenant overrides.
    pub per_tenant: HashMap<String, u64>,
}

impl LimitsConfig {
    /// Effective in-flight cap for a tenant.
    pub fn max_in_flight(&self, tenant_id: &str) -> u64 {
        self.per_tenant
            .get(tenant_id)
            .copied()
            .unwrap_or(self.default_max_in_flight)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_max_in_flight: 100,
            per_tenant: HashMap::new(),
        }
    }
}

/// Payload redaction settings.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RedactionConfig {
    /// Dotted paths relative to the submission payload, e.g. `context.ssn`.
    pub paths: Vec<String>,
}

/// Encryption-at-rest settings for intent context/metadata.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EncryptionConfig {
    /// AES-256 key, 64 hex characters. Absent disables encryption entirely.
    pub key_hex: Option<String>,
    /// Tenants whose payloads are written encrypted.
    pub tenants: HashSet<String>,
}

impl EncryptionConfig {
    pub fn enabled_for(&self, tenant_id: &str) -> bool {
        self.key_hex.is_some() && self.tenants.contains(tenant_id)
    }
}

/// Durable queue routing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueueConfig {
    /// Namespace used when no routing entry matches the intent type.
    pub default_namespace: String,
    /// intent_type -> namespace routing table.
    pub routing: HashMap<String, String>,
    /// Application-level ceiling on a single enqueue call.
    pub enqueue_timeout_ms: u64,
}

impl QueueConfig {
    /// Resolves the queue namespace for an intent type.
    pub fn namespace_for(&self, intent_type: Option<&str>) -> &str {
        intent_type
            .and_then(|t| self.routing.get(t))
            .map(String::as_str)
            .unwrap_or(&self.default_namespace)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_namespace: "default".to_string(),
            routing: HashMap::new(),
            enqueue_timeout_ms: 3_000,
        }
    }
}

/// Distributed lock tuning for the submission dedupe critical section.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LockConfig {
    pub lease_secs: u64,
    pub acquire_wait_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_cap_ms: u64,
    /// Jitter applied to each backoff step, in percent of the step.
    pub jitter_pct: u8,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_secs: 30,
            acquire_wait_ms: 5_000,
            backoff_initial_ms: 50,
            backoff_cap_ms: 500,
            jitter_pct: 25,
        }
    }
}

/// Escalation workflow settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EscalationConfig {
    /// ISO-8601 duration applied when an escalation carries no timeout.
    pub default_timeout: String,
    /// TTL of the per-escalation read cache.
    pub cache_ttl_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            default_timeout: "PT4H".to_string(),
            cache_ttl_secs: 300,
        }
    }
}

/// Periodic task settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    /// Cron expression (seconds field included) for the retention cleanup.
    pub cleanup_cron: String,
    /// Cron expression for the escalation timeout sweep.
    pub sweep_cron: String,
    /// Soft-deleted intents older than this are purged by cleanup.
    pub retention_days: i64,
    /// Leader lease time-to-live.
    pub leader_ttl_secs: u64,
    /// Leader heartbeat / follower takeover probe interval.
    pub heartbeat_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cleanup_cron: "0 0 3 * * *".to_string(),
            sweep_cron: "0 */5 * * * *".to_string(),
            retention_days: 30,
            leader_ttl_secs: 15,
            heartbeat_secs: 5,
        }
    }
}

/// Relational store tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreConfig {
    /// Per-transaction statement timeout (Postgres `SET LOCAL`).
    pub statement_timeout_ms: u64,
    /// Hard cap on any page size requested through list operations.
    pub max_page_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            statement_timeout_ms: 5_000,
            max_page_size: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_requires_dedupe_secret() {
        let mut config = CoreConfig::default();
        assert!(config.validate().is_ok());

        config.production = true;
        assert!(config.validate().is_err());

        config.dedupe.secret = Some("k".repeat(32));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_namespace_routing_falls_back_to_default() {
        let mut config = QueueConfig::default();
        config
            .routing
            .insert("notify".to_string(), "notifications".to_string());

        assert_eq!(config.namespace_for(Some("notify")), "notifications");
        assert_eq!(config.namespace_for(Some("other")), "default");
        assert_eq!(config.namespace_for(None), "default");
    }

    #[test]
    fn test_encryption_config_validation() {
        let mut config = CoreConfig::default();
        config.encryption.tenants.insert("T1".to_string());
        assert!(config.validate().is_err());

        config.encryption.key_hex = Some("ab".repeat(32));
        assert!(config.validate().is_ok());

        config.encryption.key_hex = Some("zz".repeat(32));
        assert!(config.validate().is_err());
    }
}
