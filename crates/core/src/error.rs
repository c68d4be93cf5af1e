//! Error types for the Steward domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`EscalationReason`] is the
//! caller-facing projection of the errors that end a task in `ESCALATED`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::StepErrorKind;

/// The top-level error type for all Steward operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Planning errors ---
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    // --- Context budget ---
    #[error("Budget error: {0}")]
    Budget(#[from] BudgetError),

    // --- Compaction ---
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    // --- Human approval ---
    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    // --- Knowledge store ---
    #[error("Knowledge error: {0}")]
    Knowledge(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters for {tool_id}: {reason}")]
    InvalidParameters { tool_id: String, reason: String },

    #[error("Principal '{principal}' is not authorized to run {tool_id}")]
    Unauthorized { tool_id: String, principal: String },

    #[error("Consent not granted for {tool_id}")]
    ConsentDenied { tool_id: String },

    #[error("{tool_id} is risk tier {risk_tier}, above the cleared tier {cleared}")]
    AboveClearedTier {
        tool_id: String,
        risk_tier: u8,
        cleared: u8,
    },

    #[error("Tool timed out: {tool_id} after {timeout_ms}ms")]
    Timeout { tool_id: String, timeout_ms: u64 },

    #[error("Tool execution failed: {tool_id} — {reason}")]
    ExecutionFailed { tool_id: String, reason: String },

    #[error("Output of {tool_id} rejected: {reason}")]
    OutputRejected { tool_id: String, reason: String },

    #[error("Tool call cancelled: {tool_id}")]
    Cancelled { tool_id: String },

    #[error("Tool panicked: {tool_id} — {message}")]
    Panicked { tool_id: String, message: String },
}

impl ToolError {
    /// Classify this error into the step-level taxonomy.
    pub fn kind(&self) -> StepErrorKind {
        match self {
            Self::NotFound(_) => StepErrorKind::ToolNotFound,
            Self::InvalidParameters { .. } => StepErrorKind::InvalidParameters,
            Self::Unauthorized { .. } | Self::AboveClearedTier { .. } => {
                StepErrorKind::Unauthorized
            }
            Self::ConsentDenied { .. } => StepErrorKind::ConsentDenied,
            Self::Timeout { .. } => StepErrorKind::ToolTimeout,
            Self::ExecutionFailed { .. } | Self::Panicked { .. } => StepErrorKind::ToolExecution,
            Self::OutputRejected { .. } => StepErrorKind::OutputRejected,
            Self::Cancelled { .. } => StepErrorKind::Cancelled,
        }
    }

    /// Refused before any side effect. Retrying within the same plan is pointless.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. } | Self::ConsentDenied { .. } | Self::AboveClearedTier { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("No registered tool can address task '{task_id}'")]
    NoCandidateTools { task_id: String },

    #[error("No viable alternative for failed step(s): {}", failed_steps.join(", "))]
    NoViableAlternative { failed_steps: Vec<String> },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error(
        "Writing {requested} tokens to {category} would exceed the budget ({used}/{ceiling} used)"
    )]
    OverAllocation {
        category: String,
        requested: usize,
        used: usize,
        ceiling: usize,
    },

    #[error("Allocations ({allocated} tokens) exceed the ceiling ({ceiling} tokens)")]
    InvalidAllocation { allocated: usize, ceiling: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompactionError {
    #[error(
        "Critical items alone need {critical_tokens} tokens, above the compaction target of {target_tokens}"
    )]
    TargetUnreachable {
        critical_tokens: usize,
        target_tokens: usize,
    },

    #[error("Compaction lost critical item(s): {}", missing.join(", "))]
    CriticalDataLost { missing: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("Approval channel unavailable: {0}")]
    Unavailable(String),

    #[error("No approval decision within {after_secs}s")]
    TimedOut { after_secs: u64 },
}

/// Why a task ended in `ESCALATED`.
///
/// Every variant renders a human-readable reason; verification escalations
/// always name the checks that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    VerificationCriticalFailure {
        checks: Vec<String>,
        messages: Vec<String>,
    },
    ApprovalDenied {
        reason: String,
    },
    ApprovalTimedOut {
        after_secs: u64,
    },
    ApprovalUnavailable {
        reason: String,
    },
    PlanningFailed {
        reason: String,
    },
    CompactionFailed {
        reason: String,
    },
    BudgetExhausted {
        reason: String,
    },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VerificationCriticalFailure { checks, messages } => write!(
                f,
                "Critical verification failure in [{}]: {}",
                checks.join(", "),
                messages.join("; ")
            ),
            Self::ApprovalDenied { reason } => write!(f, "Reviewer denied the action: {reason}"),
            Self::ApprovalTimedOut { after_secs } => write!(
                f,
                "No approval decision within {after_secs}s; action blocked"
            ),
            Self::ApprovalUnavailable { reason } => {
                write!(f, "Approval channel unavailable: {reason}")
            }
            Self::PlanningFailed { reason } => write!(f, "Planner could not continue: {reason}"),
            Self::CompactionFailed { reason } => {
                write!(f, "Context compaction failed: {reason}")
            }
            Self::BudgetExhausted { reason } => write!(f, "Context budget exhausted: {reason}"),
        }
    }
}

impl From<&PlanningError> for EscalationReason {
    fn from(err: &PlanningError) -> Self {
        Self::PlanningFailed {
            reason: err.to_string(),
        }
    }
}

impl From<&CompactionError> for EscalationReason {
    fn from(err: &CompactionError) -> Self {
        Self::CompactionFailed {
            reason: err.to_string(),
        }
    }
}

impl From<&ApprovalError> for EscalationReason {
    fn from(err: &ApprovalError) -> Self {
        match err {
            ApprovalError::TimedOut { after_secs } => Self::ApprovalTimedOut {
                after_secs: *after_secs,
            },
            ApprovalError::Unavailable(reason) => Self::ApprovalUnavailable {
                reason: reason.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_displays_correctly() {
        let err = Error::Tool(ToolError::Unauthorized {
            tool_id: "ticket_update".into(),
            principal: "steward".into(),
        });
        assert!(err.to_string().contains("ticket_update"));
        assert!(err.to_string().contains("steward"));
    }

    #[test]
    fn uncleared_tier_is_a_refusal() {
        let err = ToolError::AboveClearedTier {
            tool_id: "record_publish".into(),
            risk_tier: 3,
            cleared: 2,
        };
        assert!(err.is_refusal());
        assert_eq!(err.kind(), StepErrorKind::Unauthorized);
        assert!(err.to_string().contains("above the cleared tier 2"));
    }

    #[test]
    fn timeout_maps_to_timeout_kind() {
        let err = ToolError::Timeout {
            tool_id: "vendor_research".into(),
            timeout_ms: 500,
        };
        assert_eq!(err.kind(), StepErrorKind::ToolTimeout);
        assert!(!err.is_refusal());
    }

    #[test]
    fn refusals_are_flagged() {
        assert!(ToolError::ConsentDenied { tool_id: "x".into() }.is_refusal());
        assert!(
            ToolError::Unauthorized {
                tool_id: "x".into(),
                principal: "p".into()
            }
            .is_refusal()
        );
    }

    #[test]
    fn escalation_reason_names_failed_checks() {
        let reason = EscalationReason::VerificationCriticalFailure {
            checks: vec!["safety".into()],
            messages: vec!["output matched a blocked pattern".into()],
        };
        let text = reason.to_string();
        assert!(text.contains("safety"));
        assert!(text.contains("blocked pattern"));
    }

    #[test]
    fn planning_error_converts_to_escalation() {
        let err = PlanningError::NoViableAlternative {
            failed_steps: vec!["record_lookup".into()],
        };
        let reason = EscalationReason::from(&err);
        assert!(matches!(reason, EscalationReason::PlanningFailed { .. }));
        assert!(reason.to_string().contains("record_lookup"));
    }
}
