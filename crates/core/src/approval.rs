//! Approval interface — the human reviewer behind tier 3/4 actions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApprovalError;
use crate::hitl::{HitlTier, ProposedAction};

/// What the reviewer is shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub task_id: String,
    pub iteration: u32,
    pub tier: HitlTier,
    pub action: ProposedAction,
    pub rationale: String,
    pub confidence: f32,
}

/// The reviewer's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: String },
    /// Re-plan with these changes folded into the task requirements.
    Modified { changes: Vec<String> },
}

/// A human-interaction collaborator.
///
/// Implementations may take arbitrarily long; the orchestrator bounds the
/// wait with its approval timeout.
#[async_trait]
pub trait ApprovalGateway: Send + Sync {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalDecision, ApprovalError>;
}

/// A gateway that answers every request with the same decision.
#[derive(Debug, Clone)]
pub struct FixedApproval(pub ApprovalDecision);

#[async_trait]
impl ApprovalGateway for FixedApproval {
    async fn request(&self, _request: ApprovalRequest) -> Result<ApprovalDecision, ApprovalError> {
        Ok(self.0.clone())
    }
}

/// A gateway with nobody behind it: every request is unavailable.
#[derive(Debug, Clone, Default)]
pub struct NoReviewer;

#[async_trait]
impl ApprovalGateway for NoReviewer {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalDecision, ApprovalError> {
        Err(ApprovalError::Unavailable(format!(
            "no reviewer configured for {} on task {}",
            request.tier, request.task_id
        )))
    }
}
