//! Execution context handed to tools.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hitl::HitlTier;

/// Who is acting, for which task, at which iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub session_id: String,
    pub task_id: String,
    pub iteration: u32,
    /// Identity checked by authorization and consent.
    pub principal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Highest descriptor risk tier this call may run; `None` is unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tier: Option<HitlTier>,
}

impl ExecutionContext {
    pub fn new(
        session_id: impl Into<String>,
        task_id: impl Into<String>,
        principal: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: task_id.into(),
            iteration: 0,
            principal: principal.into(),
            deadline: None,
            max_tier: None,
        }
    }

    pub fn with_max_tier(mut self, tier: HitlTier) -> Self {
        self.max_tier = Some(tier);
        self
    }

    /// Whether a tool at `risk_tier` is cleared to run under this context.
    pub fn clears(&self, risk_tier: HitlTier) -> bool {
        self.max_tier.is_none_or(|max| risk_tier <= max)
    }

    pub fn at_iteration(&self, iteration: u32) -> Self {
        Self {
            iteration,
            ..self.clone()
        }
    }
}
