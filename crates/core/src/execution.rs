//! Execution results — what one Act phase produced.
//!
//! An [`ExecutionResult`] is created once per Act phase, consumed by the
//! verifier, and then discarded. Only its [`ExecutionSummary`] (statuses,
//! errors, timings; no payloads) persists in the trace.

use serde::{Deserialize, Serialize};

use crate::error::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Success,
    Failed,
}

/// Step-level failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepErrorKind {
    ToolExecution,
    ToolTimeout,
    Unauthorized,
    ConsentDenied,
    InvalidParameters,
    OutputRejected,
    ToolNotFound,
    Cancelled,
}

impl StepErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolExecution => "ToolExecutionError",
            Self::ToolTimeout => "ToolTimeoutError",
            Self::Unauthorized => "UnauthorizedError",
            Self::ConsentDenied => "ConsentDeniedError",
            Self::InvalidParameters => "InvalidParametersError",
            Self::OutputRejected => "OutputRejectedError",
            Self::ToolNotFound => "ToolNotFoundError",
            Self::Cancelled => "CancelledError",
        }
    }

    /// Refused before execution (authorization or consent).
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::ConsentDenied)
    }
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Position of the step in its plan.
    pub index: usize,
    pub tool_id: String,
    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<StepErrorKind>,

    pub duration_ms: u64,

    /// Served from the session's tool cache.
    #[serde(default)]
    pub from_cache: bool,
}

impl StepResult {
    pub fn success(
        index: usize,
        tool_id: impl Into<String>,
        output: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            index,
            tool_id: tool_id.into(),
            status: StepStatus::Success,
            output: Some(output),
            error: None,
            error_kind: None,
            duration_ms,
            from_cache: false,
        }
    }

    pub fn failure(index: usize, tool_id: impl Into<String>, err: &ToolError, duration_ms: u64) -> Self {
        let kind = err.kind();
        Self {
            index,
            tool_id: tool_id.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(format!("{}: {err}", kind.as_str())),
            error_kind: Some(kind),
            duration_ms,
            from_cache: false,
        }
    }

    pub fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// Aggregate of one Act phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: String,

    /// Results for every step that started, ordered by step index.
    pub steps: Vec<StepResult>,

    /// Indices of steps that never started because a critical step failed.
    #[serde(default)]
    pub skipped: Vec<usize>,

    /// Index of the critical step whose failure aborted the plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_by: Option<usize>,

    pub status: ExecutionStatus,

    /// Successful outputs in step order: `[{"step", "tool_id", "output"}]`.
    pub output: serde_json::Value,
}

impl ExecutionResult {
    /// Assemble the aggregate from per-step results.
    pub fn from_steps(
        plan_id: impl Into<String>,
        mut steps: Vec<StepResult>,
        mut skipped: Vec<usize>,
        aborted_by: Option<usize>,
    ) -> Self {
        steps.sort_by_key(|s| s.index);
        skipped.sort_unstable();
        skipped.dedup();

        let status = if aborted_by.is_none()
            && skipped.is_empty()
            && steps.iter().all(StepResult::is_success)
        {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };

        let output = serde_json::Value::Array(
            steps
                .iter()
                .filter_map(|s| {
                    s.output.as_ref().map(|o| {
                        serde_json::json!({
                            "step": s.index,
                            "tool_id": s.tool_id,
                            "output": o,
                        })
                    })
                })
                .collect(),
        );

        Self {
            plan_id: plan_id.into(),
            steps,
            skipped,
            aborted_by,
            status,
            output,
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| !s.is_success())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| s.is_success())
    }

    /// Plan steps that still need to run: failed plus skipped.
    pub fn pending_steps(&self) -> usize {
        self.failed().count() + self.skipped.len()
    }

    pub fn step(&self, index: usize) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.index == index)
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            plan_id: self.plan_id.clone(),
            status: self.status,
            steps: self
                .steps
                .iter()
                .map(|s| StepSummary {
                    index: s.index,
                    tool_id: s.tool_id.clone(),
                    status: s.status,
                    error: s.error.clone(),
                    duration_ms: s.duration_ms,
                    from_cache: s.from_cache,
                })
                .collect(),
            skipped: self.skipped.clone(),
            aborted_by: self.aborted_by,
        }
    }
}

/// Payload-free record of an execution for the audit trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub steps: Vec<StepSummary>,
    pub skipped: Vec<usize>,
    pub aborted_by: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub index: usize,
    pub tool_id: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub from_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn all_success_is_success() {
        let result = ExecutionResult::from_steps(
            "p",
            vec![
                StepResult::success(1, "b", json!(2), 5),
                StepResult::success(0, "a", json!(1), 5),
            ],
            vec![],
            None,
        );
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.pending_steps(), 0);
        assert_eq!(result.steps[0].index, 0);
        assert_eq!(result.output[0]["tool_id"], "a");
        assert_eq!(result.output[1]["output"], 2);
    }

    #[test]
    fn timeout_failure_records_kind_name() {
        let err = ToolError::Timeout {
            tool_id: "slow".into(),
            timeout_ms: 100,
        };
        let step = StepResult::failure(0, "slow", &err, 100);
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error_kind, Some(StepErrorKind::ToolTimeout));
        assert!(step.error.as_deref().unwrap().starts_with("ToolTimeoutError"));
    }

    #[test]
    fn abort_counts_skipped_as_pending() {
        let err = ToolError::ExecutionFailed {
            tool_id: "b".into(),
            reason: "boom".into(),
        };
        let result = ExecutionResult::from_steps(
            "p",
            vec![
                StepResult::success(0, "a", json!({}), 1),
                StepResult::failure(1, "b", &err, 1),
            ],
            vec![2, 3],
            Some(1),
        );
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.pending_steps(), 3);
        assert_eq!(result.failed().count(), 1);

        let summary = result.summary();
        assert_eq!(summary.aborted_by, Some(1));
        assert_eq!(summary.steps.len(), 2);
    }
}
