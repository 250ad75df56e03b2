//! Error types for the intent-core crate.
//!
//! This module defines a unified error enumeration used across the submission
//! pipeline, state machine, repositories, escalation workflow, consent
//! registry and scheduler. It integrates with `thiserror` to provide rich
//! `Display` implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - [`CoreError::kind`] maps every variant onto a stable machine-readable
//!   code, which boundary layers translate to HTTP statuses.
//! - User-visible messages are sanitized in production via
//!   [`CoreError::client_message`].

use thiserror::Error;

/// Unified error enumeration for the intent-core library.
///
/// - Used across submission, state transitions, stores, KV, queue and audit.
/// - Implements `std::error::Error` via `thiserror`.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Input failed field-level validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The consent gate rejected the submission.
    #[error("user `{user_id}` has no active `{consent_type}` consent")]
    ConsentRequired {
        user_id: String,
        consent_type: String,
    },

    /// The trust gate rejected the submission.
    #[error("trust level {actual} is below the required level {required}")]
    TrustInsufficient { required: u8, actual: u8 },

    /// The tenant's in-flight intent cap was reached.
    #[error("tenant `{tenant_id}` has {active} intents in flight (limit {limit})")]
    IntentRateLimit {
        tenant_id: String,
        active: u64,
        limit: u64,
    },

    /// Dedupe lock contention exhausted the acquire-wait ceiling.
    #[error("could not acquire submission lock: {0}")]
    IntentLocked(String),

    /// The requested status transition is not an edge of the lifecycle graph.
    #[error("invalid status transition from `{from}` to `{to}`")]
    InvalidStateTransition { from: String, to: String },

    /// The source status admits no outgoing transitions.
    #[error("`{0}` is a terminal status")]
    TerminalState(String),

    /// The transition is legal but a reason must be supplied.
    #[error("transition from `{from}` to `{to}` requires a reason")]
    RequiresReason { from: String, to: String },

    /// The transition is legal but requires elevated permission.
    #[error("transition from `{from}` to `{to}` requires elevated permission")]
    RequiresPermission { from: String, to: String },

    /// A referenced row does not exist (or is soft-deleted).
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Concurrent modification detected by an optimistic predicate.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A circuit breaker is open; the protected dependency was not called.
    #[error("circuit `{0}` is open")]
    CircuitOpen(String),

    /// Relational store failure.
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Key-value store failure.
    #[error("key-value store error: {0}")]
    KeyValue(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A downstream dependency failed.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// Payload encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// The caller's context was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal failure for miscellaneous invariant breaks.
    #[error("{0}")]
    Internal(String),
}

/// Stable machine-readable classification of a [`CoreError`].
///
/// Codes are part of the external contract: boundary layers serialize them
/// into error envelopes and map them onto HTTP statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    ConsentRequired,
    TrustInsufficient,
    IntentRateLimit,
    IntentLocked,
    InvalidStateTransition,
    TerminalState,
    RequiresReason,
    RequiresPermission,
    NotFound,
    Conflict,
    CircuitOpen,
    Database,
    Timeout,
    ExternalService,
    Encryption,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Returns the stable snake_case code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ConsentRequired => "consent_required",
            ErrorKind::TrustInsufficient => "trust_insufficient",
            ErrorKind::IntentRateLimit => "intent_rate_limit",
            ErrorKind::IntentLocked => "intent_locked",
            ErrorKind::InvalidStateTransition => "invalid_state_transition",
            ErrorKind::TerminalState => "terminal_state",
            ErrorKind::RequiresReason => "requires_reason",
            ErrorKind::RequiresPermission => "requires_permission",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Database => "database",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExternalService => "external_service",
            ErrorKind::Encryption => "encryption",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Maps this kind onto the HTTP status a boundary layer should emit.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::ConsentRequired => 403,
            ErrorKind::TrustInsufficient => 403,
            ErrorKind::RequiresPermission => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict
            | ErrorKind::IntentLocked
            | ErrorKind::InvalidStateTransition
            | ErrorKind::TerminalState
            | ErrorKind::RequiresReason => 409,
            ErrorKind::IntentRateLimit => 429,
            ErrorKind::Timeout => 504,
            ErrorKind::CircuitOpen | ErrorKind::ExternalService => 502,
            ErrorKind::Database
            | ErrorKind::Encryption
            | ErrorKind::Cancelled
            | ErrorKind::Internal => 500,
        }
    }
}

/// Substrings that must never leak into user-visible messages.
const SENSITIVE_MARKERS: [&str; 6] = ["password", "secret", "token", "key", "credential", "sql"];

const GENERIC_MESSAGE: &str = "An internal error occurred. Contact support with the trace id.";

impl CoreError {
    /// Classifies this error into its stable [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::ConsentRequired { .. } => ErrorKind::ConsentRequired,
            CoreError::TrustInsufficient { .. } => ErrorKind::TrustInsufficient,
            CoreError::IntentRateLimit { .. } => ErrorKind::IntentRateLimit,
            CoreError::IntentLocked(_) => ErrorKind::IntentLocked,
            CoreError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            CoreError::TerminalState(_) => ErrorKind::TerminalState,
            CoreError::RequiresReason { .. } => ErrorKind::RequiresReason,
            CoreError::RequiresPermission { .. } => ErrorKind::RequiresPermission,
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            CoreError::Database(_) => ErrorKind::Database,
            CoreError::KeyValue(_) => ErrorKind::ExternalService,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::ExternalService(_) => ErrorKind::ExternalService,
            CoreError::Encryption(_) => ErrorKind::Encryption,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::Serialization(_) => ErrorKind::Internal,
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Structured details suitable for an error envelope, when the variant
    /// carries machine-usable fields.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            CoreError::ConsentRequired {
                user_id,
                consent_type,
            } => Some(serde_json::json!({
                "user_id": user_id,
                "consent_type": consent_type,
            })),
            CoreError::TrustInsufficient { required, actual } => Some(serde_json::json!({
                "required": required,
                "actual": actual,
            })),
            CoreError::IntentRateLimit {
                tenant_id,
                active,
                limit,
            } => Some(serde_json::json!({
                "tenant_id": tenant_id,
                "active": active,
                "limit": limit,
            })),
            CoreError::InvalidStateTransition { from, to }
            | CoreError::RequiresReason { from, to }
            | CoreError::RequiresPermission { from, to } => Some(serde_json::json!({
                "from": from,
                "to": to,
            })),
            CoreError::NotFound { entity, id } => Some(serde_json::json!({
                "entity": entity,
                "id": id,
            })),
            _ => None,
        }
    }

    /// Returns the message to surface to an end user.
    ///
    /// In production mode, any message containing a sensitive marker
    /// (`password`, `secret`, `token`, `key`, `credential`, `sql`) is
    /// replaced wholesale with a generic string. Non-production callers get
    /// the full message for debuggability.
    pub fn client_message(&self, production: bool) -> String {
        let message = self.to_string();
        if !production {
            return message;
        }
        let lowered = message.to_lowercase();
        if SENSITIVE_MARKERS.iter().any(|m| lowered.contains(m)) {
            GENERIC_MESSAGE.to_string()
        } else {
            message
        }
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::KeyValue(err.to_string())
    }
}

/// Convenience alias used across the crate.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        let err = CoreError::TrustInsufficient {
            required: 3,
            actual: 1,
        };
        assert_eq!(err.kind().code(), "trust_insufficient");
        assert_eq!(err.kind().http_status(), 403);

        let err = CoreError::IntentRateLimit {
            tenant_id: "T1".to_string(),
            active: 10,
            limit: 10,
        };
        assert_eq!(err.kind().code(), "intent_rate_limit");
        assert_eq!(err.kind().http_status(), 429);
    }

    #[test]
    fn test_details_carry_gate_fields() {
        let err = CoreError::TrustInsufficient {
            required: 3,
            actual: 1,
        };
        let details = err.details().expect("details");
        assert_eq!(details["required"], 3);
        assert_eq!(details["actual"], 1);
    }

    #[test]
    fn test_client_message_sanitizes_in_production() {
        let err = CoreError::Internal("bad sql near SELECT".to_string());
        assert_eq!(err.client_message(true), GENERIC_MESSAGE);
        assert!(err.client_message(false).contains("SELECT"));

        let err = CoreError::Validation("goal must not be empty".to_string());
        assert!(err.client_message(true).contains("goal"));
    }
}
