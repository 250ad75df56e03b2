//! Intent lifecycle state machine.
//!
//! # Status Transitions
//!
//! ```text
//!  pending ──▶ evaluating ──▶ approved ──▶ executing ──▶ completed
//!     │            │  │           │            │
//!     │            │  ├──▶ denied ┼──▶ pending (replay, permission)
//!     │            │  ├──▶ escalated ──▶ approved / denied (permission)
//!     │            │  └──▶ failed ──▶ pending (retry, permission)
//!     │            │           │
//!     └────────────┴───────────┴──▶ cancelled (reason required)
//! ```
//!
//! The graph is a static table; every legal edge carries its canonical
//! event type plus two flags (reason required, permission required). The
//! validator returns a typed error for each way a transition can be
//! rejected, so callers surface precise failure codes instead of a generic
//! conflict.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, CoreResult};

/// Lifecycle status of an intent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Accepted and persisted, not yet picked up for evaluation.
    Pending,
    /// An evaluation worker holds the intent.
    Evaluating,
    /// Evaluation (or a human resolution) allowed the intent.
    Approved,
    /// Evaluation (or a human resolution) rejected the intent.
    Denied,
    /// A human decision is pending; an escalation row exists.
    Escalated,
    /// An execution worker is acting on the approved intent.
    Executing,
    /// Terminal: execution finished successfully.
    Completed,
    /// Execution or evaluation failed; may be retried with permission.
    Failed,
    /// Terminal: withdrawn with a reason.
    Cancelled,
}

impl IntentStatus {
    /// Returns the snake_case string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Evaluating => "evaluating",
            IntentStatus::Approved => "approved",
            IntentStatus::Denied => "denied",
            IntentStatus::Escalated => "escalated",
            IntentStatus::Executing => "executing",
            IntentStatus::Completed => "completed",
            IntentStatus::Failed => "failed",
            IntentStatus::Cancelled => "cancelled",
        }
    }

    /// Parse from the persisted snake_case form.
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "evaluating" => Ok(IntentStatus::Evaluating),
            "approved" => Ok(IntentStatus::Approved),
            "denied" => Ok(IntentStatus::Denied),
            "escalated" => Ok(IntentStatus::Escalated),
            "executing" => Ok(IntentStatus::Executing),
            "completed" => Ok(IntentStatus::Completed),
            "failed" => Ok(IntentStatus::Failed),
            "cancelled" => Ok(IntentStatus::Cancelled),
            other => Err(CoreError::Internal(format!(
                "unknown intent status `{other}` in store"
            ))),
        }
    }

    /// Terminal statuses admit no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentStatus::Completed | IntentStatus::Cancelled)
    }

    /// Statuses counted against the tenant in-flight cap.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            IntentStatus::Pending
                | IntentStatus::Evaluating
                | IntentStatus::Escalated
                | IntentStatus::Executing
        )
    }

    /// Statuses from which cancellation is possible.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            IntentStatus::Pending | IntentStatus::Evaluating | IntentStatus::Escalated
        )
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Statuses counted by `countActiveIntents`.
pub const IN_FLIGHT_STATUSES: [IntentStatus; 4] = [
    IntentStatus::Pending,
    IntentStatus::Evaluating,
    IntentStatus::Escalated,
    IntentStatus::Executing,
];

/// One legal edge of the lifecycle graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: IntentStatus,
    pub to: IntentStatus,
    /// A human-supplied reason must accompany the transition.
    pub requires_reason: bool,
    /// The caller must hold elevated permission.
    pub requires_permission: bool,
    /// Canonical event type recorded on every successful transition.
    pub event_type: &'static str,
}

const fn edge(
    from: IntentStatus,
    to: IntentStatus,
    requires_reason: bool,
    requires_permission: bool,
    event_type: &'static str,
) -> TransitionRule {
    TransitionRule {
        from,
        to,
        requires_reason,
        requires_permission,
        event_type,
    }
}

/// The full transition table. Order is not significant.
pub const TRANSITIONS: [TransitionRule; 16] = [
    edge(
        IntentStatus::Pending,
        IntentStatus::Evaluating,
        false,
        false,
        "intent.evaluation.started",
    ),
    edge(
        IntentStatus::Pending,
        IntentStatus::Cancelled,
        true,
        false,
        "intent.cancelled",
    ),
    edge(
        IntentStatus::Evaluating,
        IntentStatus::Approved,
        false,
        false,
        "intent.approved",
    ),
    edge(
        IntentStatus::Evaluating,
        IntentStatus::Denied,
        false,
        false,
        "intent.denied",
    ),
    edge(
        IntentStatus::Evaluating,
        IntentStatus::Escalated,
        false,
        false,
        "intent.escalated",
    ),
    edge(
        IntentStatus::Evaluating,
        IntentStatus::Failed,
        false,
        false,
        "intent.failed",
    ),
    edge(
        IntentStatus::Evaluating,
        IntentStatus::Cancelled,
        true,
        false,
        "intent.cancelled",
    ),
    edge(
        IntentStatus::Escalated,
        IntentStatus::Approved,
        false,
        true,
        "intent.approved",
    ),
    edge(
        IntentStatus::Escalated,
        IntentStatus::Denied,
        false,
        true,
        "intent.denied",
    ),
    edge(
        IntentStatus::Escalated,
        IntentStatus::Cancelled,
        true,
        false,
        "intent.cancelled",
    ),
    edge(
        IntentStatus::Approved,
        IntentStatus::Executing,
        false,
        false,
        "intent.execution.started",
    ),
    edge(
        IntentStatus::Approved,
        IntentStatus::Cancelled,
        true,
        false,
        "intent.cancelled",
    ),
    edge(
        IntentStatus::Executing,
        IntentStatus::Completed,
        false,
        false,
        "intent.completed",
    ),
    edge(
        IntentStatus::Executing,
        IntentStatus::Failed,
        false,
        false,
        "intent.failed",
    ),
    edge(
        IntentStatus::Denied,
        IntentStatus::Pending,
        false,
        true,
        "intent.replay",
    ),
    edge(
        IntentStatus::Failed,
        IntentStatus::Pending,
        false,
        true,
        "intent.retry",
    ),
];

/// Validate a requested transition.
///
/// Checks run in a fixed order so callers always get the most specific
/// error: terminal source, unknown edge, missing reason, missing
/// permission. On success the matched rule is returned so the caller can
/// record its canonical event type.
pub fn validate_transition(
    from: IntentStatus,
    to: IntentStatus,
    has_reason: bool,
    has_permission: bool,
) -> CoreResult<&'static TransitionRule> {
    if from.is_terminal() {
        return Err(CoreError::TerminalState(from.as_str().to_string()));
    }
    let rule = TRANSITIONS
        .iter()
        .find(|rule| rule.from == from && rule.to == to)
        .ok_or_else(|| CoreError::InvalidStateTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })?;
    if rule.requires_reason && !has_reason {
        return Err(CoreError::RequiresReason {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    if rule.requires_permission && !has_permission {
        return Err(CoreError::RequiresPermission {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    Ok(rule)
}
