//! Verification results produced by the self-verification battery.

use serde::{Deserialize, Serialize};

/// The six checks, in the order they always run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    PolicyCompliance,
    Completeness,
    Consistency,
    Quality,
    Confidence,
    Safety,
}

impl CheckKind {
    pub const ORDER: [CheckKind; 6] = [
        CheckKind::PolicyCompliance,
        CheckKind::Completeness,
        CheckKind::Consistency,
        CheckKind::Quality,
        CheckKind::Confidence,
        CheckKind::Safety,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyCompliance => "policy_compliance",
            Self::Completeness => "completeness",
            Self::Consistency => "consistency",
            Self::Quality => "quality",
            Self::Confidence => "confidence",
            Self::Safety => "safety",
        }
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one named check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub kind: CheckKind,
    pub passed: bool,
    /// A failure of a critical check forces escalation.
    pub critical: bool,
    pub message: String,
}

impl Check {
    pub fn pass(kind: CheckKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            passed: true,
            critical: false,
            message: message.into(),
        }
    }

    pub fn fail(kind: CheckKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            passed: false,
            critical: false,
            message: message.into(),
        }
    }

    pub fn fail_critical(kind: CheckKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            passed: false,
            critical: true,
            message: message.into(),
        }
    }

    pub fn is_critical_failure(&self) -> bool {
        !self.passed && self.critical
    }
}

/// One verdict per iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub checks: Vec<Check>,
    /// In [0, 1]; the number surfaced to tier classification and reviewers.
    pub confidence: f32,
    /// Passed and nothing left to run.
    pub complete: bool,
    pub should_escalate: bool,
}

impl VerificationResult {
    /// Apply the aggregate rule to a list of checks.
    pub fn aggregate(checks: Vec<Check>, confidence: f32, remaining_steps: usize) -> Self {
        let passed = checks.iter().all(|c| c.passed);
        let should_escalate = checks.iter().any(Check::is_critical_failure);
        Self {
            passed,
            complete: passed && remaining_steps == 0,
            should_escalate,
            confidence: confidence.clamp(0.0, 1.0),
            checks,
        }
    }

    pub fn check(&self, kind: CheckKind) -> Option<&Check> {
        self.checks.iter().find(|c| c.kind == kind)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }

    pub fn critical_failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| c.is_critical_failure())
    }

    /// `"<check>: <message>"` for each failed check, in check order.
    pub fn failure_reasons(&self) -> Vec<String> {
        self.failed_checks()
            .map(|c| format!("{}: {}", c.kind, c.message))
            .collect()
    }
}
