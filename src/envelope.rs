//! Standard response envelope for the external boundary.
//!
//! The core never speaks HTTP itself, but every outcome it produces is
//! convertible into this envelope so hosts expose a uniform contract:
//! `{success, data?, error?, meta}` with camelCase field names and stable
//! error codes from [`ErrorKind`](crate::errors::ErrorKind).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreError;

/// Pagination block attached to list responses.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Per-response metadata.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PageMeta>,
}

/// Error block of a failed response.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Uniform success/error envelope.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub meta: ResponseMeta,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: ResponseMeta {
                request_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                pagination: None,
            },
        }
    }

    pub fn ok_paged(data: T, pagination: PageMeta) -> Self {
        let mut response = Self::ok(data);
        response.meta.pagination = Some(pagination);
        response
    }

    /// Build a failure envelope from a core error.
    ///
    /// `production` controls message sanitization; the trace id is attached
    /// both for correlation and so the generic production message stays
    /// actionable.
    pub fn from_error(err: &CoreError, production: bool, trace_id: Option<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: err.kind().code().to_string(),
                message: err.client_message(production),
                details: err.details(),
                trace_id,
            }),
            meta: ResponseMeta {
                request_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                pagination: None,
            },
        }
    }

    /// HTTP status the host should use for this envelope.
    pub fn http_status(&self) -> u16 {
        let Some(body) = &self.error else {
            return 200;
        };
        match body.code.as_str() {
            "validation" => 400,
            "consent_required" | "trust_insufficient" | "requires_permission" => 403,
            "not_found" => 404,
            "conflict" | "intent_locked" | "invalid_state_transition" | "terminal_state"
            | "requires_reason" => 409,
            "intent_rate_limit" => 429,
            "timeout" => 504,
            "circuit_open" | "external_service" => 502,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let response = ApiResponse::ok(serde_json::json!({"id": "abc"}));
        let json = serde_json::to_value(&response).expect("serialize");

        assert_eq!(json["success"], true);
        assert!(json["meta"]["requestId"].is_string());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_envelope_carries_code_and_details() {
        let err = CoreError::TrustInsufficient {
            required: 3,
            actual: 1,
        };
        let response: ApiResponse<()> =
            ApiResponse::from_error(&err, false, Some("trace-1".to_string()));

        assert!(!response.success);
        let body = response.error.as_ref().expect("error body");
        assert_eq!(body.code, "trust_insufficient");
        assert_eq!(body.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(response.http_status(), 403);
    }

    #[test]
    fn test_paged_envelope_serializes_cursor() {
        let response = ApiResponse::ok_paged(
            vec![1, 2, 3],
            PageMeta {
                limit: 3,
                offset: None,
                next_cursor: Some("2026-01-01T00:00:00Z/abc".to_string()),
                has_more: true,
            },
        );
        let json = serde_json::to_value(&response).expect("serialize");
        assert_eq!(json["meta"]["pagination"]["nextCursor"],
            "2026-01-01T00:00:00Z/abc");
        assert_eq!(json["meta"]["pagination"]["hasMore"], true);
    }
}
