//! Self-verification: the check battery run before anyone sees an outcome.
//!
//! Six checks, always in this order:
//!
//! | # | Check | Fails when | Critical |
//! |---|-------|-----------|----------|
//! | 1 | policy_compliance | a step was refused, or the plan uses a denied tool | yes |
//! | 2 | completeness | a step failed or was skipped, or a MUST requirement is unaddressed | no |
//! | 3 | consistency | results do not line up with the plan | on mismatch |
//! | 4 | quality | useful output ratio blended with plan quality is below threshold | no |
//! | 5 | confidence | overall confidence is below threshold | no |
//! | 6 | safety | output matches a blocked pattern or carries a safety flag | yes |
//!
//! Verification is a pure function of its inputs: the same execution
//! result, plan and context always give the same verdict.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

use steward_config::VerifierConfig;
use steward_core::task::is_mandatory;
use steward_core::{
    Check, CheckKind, ExecutionResult, Plan, StepResult, Task, VerificationResult, canonical_json,
};
use steward_security::AccessPolicy;

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("Invalid blocked pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// What the verifier checks a result against, besides the plan.
#[derive(Debug, Clone, Copy)]
pub struct VerificationContext<'a> {
    pub task: &'a Task,
    pub policy: &'a AccessPolicy,
}

#[derive(Debug, Clone)]
pub struct SelfVerifier {
    confidence_threshold: f32,
    quality_threshold: f32,
    blocked: Vec<regex_lite::Regex>,
}

impl SelfVerifier {
    pub fn new(
        confidence_threshold: f32,
        quality_threshold: f32,
        blocked_patterns: &[String],
    ) -> Result<Self, VerifierError> {
        let blocked = blocked_patterns
            .iter()
            .map(|p| {
                regex_lite::Regex::new(p).map_err(|e| VerifierError::InvalidPattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            confidence_threshold,
            quality_threshold,
            blocked,
        })
    }

    pub fn from_config(config: &VerifierConfig) -> Result<Self, VerifierError> {
        Self::new(
            config.confidence_threshold,
            config.quality_threshold,
            &config.blocked_patterns,
        )
    }

    /// Run all six checks and aggregate the verdict.
    pub fn verify(
        &self,
        result: &ExecutionResult,
        plan: &Plan,
        ctx: &VerificationContext<'_>,
    ) -> VerificationResult {
        let success_ratio = success_ratio(result, plan);

        let mut checks = vec![
            self.policy_compliance(result, plan, ctx),
            self.completeness(result, plan, ctx),
            self.consistency(result, plan),
            self.quality(result, plan),
        ];

        let earlier_passed = checks.iter().filter(|c| c.passed).count() as f32;
        let confidence =
            0.5 * success_ratio + 0.3 * plan.quality.clamp(0.0, 1.0) + 0.2 * (earlier_passed / 4.0);
        checks.push(self.confidence(confidence));
        checks.push(self.safety(result));

        let verdict = VerificationResult::aggregate(checks, confidence, result.pending_steps());
        debug!(
            plan = %plan.id,
            passed = verdict.passed,
            complete = verdict.complete,
            should_escalate = verdict.should_escalate,
            confidence = verdict.confidence,
            "Verification finished"
        );
        verdict
    }

    fn policy_compliance(
        &self,
        result: &ExecutionResult,
        plan: &Plan,
        ctx: &VerificationContext<'_>,
    ) -> Check {
        let mut problems = Vec::new();
        for step in &result.steps {
            if step.error_kind.is_some_and(|k| k.is_refusal()) {
                problems.push(format!(
                    "step {} ({}) was refused: {}",
                    step.index,
                    step.tool_id,
                    step.error.as_deref().unwrap_or("refused")
                ));
            }
        }
        let denied: BTreeSet<&str> = plan
            .steps
            .iter()
            .map(|s| s.tool_id.as_str())
            .filter(|id| ctx.policy.is_denied(id))
            .collect();
        for id in denied {
            problems.push(format!("plan uses denied tool '{id}'"));
        }

        if problems.is_empty() {
            Check::pass(CheckKind::PolicyCompliance, "no policy violations")
        } else {
            Check::fail_critical(CheckKind::PolicyCompliance, problems.join("; "))
        }
    }

    fn completeness(
        &self,
        result: &ExecutionResult,
        plan: &Plan,
        ctx: &VerificationContext<'_>,
    ) -> Check {
        if plan.is_empty() {
            return Check::fail(CheckKind::Completeness, "plan has no steps");
        }

        let mut gaps = Vec::new();
        for step in result.failed() {
            gaps.push(format!("step {} ({}) failed", step.index, step.tool_id));
        }
        for index in &result.skipped {
            gaps.push(format!("step {index} was skipped"));
        }
        for index in 0..plan.steps.len() {
            if result.step(index).is_none() && !result.skipped.contains(&index) {
                gaps.push(format!("step {index} produced no result"));
            }
        }

        let satisfied: BTreeSet<&str> = plan
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| result.step(*i).is_some_and(StepResult::is_success))
            .filter_map(|(_, s)| s.requirement.as_deref())
            .collect();
        for requirement in ctx.task.actionable_requirements() {
            if is_mandatory(requirement) && !satisfied.contains(requirement) {
                gaps.push(format!("requirement not met: {requirement}"));
            }
        }

        if gaps.is_empty() {
            Check::pass(
                CheckKind::Completeness,
                format!("all {} steps succeeded", plan.steps.len()),
            )
        } else {
            Check::fail(CheckKind::Completeness, gaps.join("; "))
        }
    }

    fn consistency(&self, result: &ExecutionResult, plan: &Plan) -> Check {
        let mut mismatches = Vec::new();
        let mut seen = BTreeSet::new();
        for step in &result.steps {
            if !seen.insert(step.index) {
                mismatches.push(format!("duplicate result for step {}", step.index));
            }
            match plan.steps.get(step.index) {
                None => mismatches.push(format!(
                    "result for step {} but plan has {} steps",
                    step.index,
                    plan.steps.len()
                )),
                Some(planned) if planned.tool_id != step.tool_id => mismatches.push(format!(
                    "step {} ran {} but plan named {}",
                    step.index, step.tool_id, planned.tool_id
                )),
                Some(_) => {}
            }
        }
        if !mismatches.is_empty() {
            return Check::fail_critical(CheckKind::Consistency, mismatches.join("; "));
        }

        // Identical calls should agree with each other.
        let mut by_signature: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for step in result.succeeded() {
            if let (Some(planned), Some(output)) = (plan.steps.get(step.index), &step.output) {
                by_signature
                    .entry(planned.signature())
                    .or_default()
                    .insert(canonical_json(output));
            }
        }
        let conflicting: Vec<&str> = by_signature
            .iter()
            .filter(|(_, outputs)| outputs.len() > 1)
            .map(|(sig, _)| sig.split(':').next().unwrap_or(sig))
            .collect();
        if conflicting.is_empty() {
            Check::pass(CheckKind::Consistency, "results match the plan")
        } else {
            Check::fail(
                CheckKind::Consistency,
                format!(
                    "identical calls returned different outputs: {}",
                    conflicting.join(", ")
                ),
            )
        }
    }

    fn quality(&self, result: &ExecutionResult, plan: &Plan) -> Check {
        let useful = if plan.is_empty() {
            0.0
        } else {
            let n = result
                .succeeded()
                .filter(|s| s.output.as_ref().is_some_and(has_content))
                .count();
            n as f32 / plan.steps.len() as f32
        };
        let score = 0.7 * useful + 0.3 * plan.quality.clamp(0.0, 1.0);
        let message = format!(
            "quality {score:.2} (threshold {:.2})",
            self.quality_threshold
        );
        if meets(score, self.quality_threshold) {
            Check::pass(CheckKind::Quality, message)
        } else {
            Check::fail(CheckKind::Quality, message)
        }
    }

    fn confidence(&self, confidence: f32) -> Check {
        let message = format!(
            "confidence {confidence:.2} (threshold {:.2})",
            self.confidence_threshold
        );
        if meets(confidence, self.confidence_threshold) {
            Check::pass(CheckKind::Confidence, message)
        } else {
            Check::fail(CheckKind::Confidence, message)
        }
    }

    fn safety(&self, result: &ExecutionResult) -> Check {
        let rendered = canonical_json(&result.output);
        let mut hits: Vec<String> = self
            .blocked
            .iter()
            .filter(|re| re.is_match(&rendered))
            .map(|re| format!("output matched blocked pattern `{}`", re.as_str()))
            .collect();

        for step in result.succeeded() {
            let flagged = step
                .output
                .as_ref()
                .and_then(|o| o.get("safety_flag"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if flagged {
                hits.push(format!("step {} ({}) raised a safety flag", step.index, step.tool_id));
            }
        }

        if hits.is_empty() {
            Check::pass(CheckKind::Safety, "no unsafe content")
        } else {
            Check::fail_critical(CheckKind::Safety, hits.join("; "))
        }
    }
}

fn success_ratio(result: &ExecutionResult, plan: &Plan) -> f32 {
    if plan.is_empty() {
        return 0.0;
    }
    result.succeeded().count() as f32 / plan.steps.len() as f32
}

fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// Threshold comparison tolerant of f32 rounding in the weighted sums.
fn meets(score: f32, threshold: f32) -> bool {
    score + 1e-6 >= threshold
}
