//! Plans — ordered tool invocations produced by the planner.
//!
//! Plans are immutable. Adaptation creates a new plan whose `parent` is the
//! index of the plan it revises inside the session's [`PlanLog`]; there are
//! no back-pointers between plans.

use serde::{Deserialize, Serialize};

use crate::cache::canonical_json;

/// One unit of tool invocation within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool_id: String,

    #[serde(default)]
    pub parameters: serde_json::Value,

    /// A failure of this step aborts the rest of the plan.
    #[serde(default)]
    pub critical: bool,

    /// May run concurrently with adjacent parallel-safe steps.
    #[serde(default)]
    pub parallel_safe: bool,

    /// The task requirement this step addresses, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,

    #[serde(default)]
    pub description: String,
}

impl PlanStep {
    pub fn new(tool_id: impl Into<String>, parameters: serde_json::Value) -> Self {
        let tool_id = tool_id.into();
        Self {
            description: format!("Run {tool_id}"),
            tool_id,
            parameters,
            critical: false,
            parallel_safe: false,
            requirement: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn parallel_safe(mut self) -> Self {
        self.parallel_safe = true;
        self
    }

    pub fn for_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirement = Some(requirement.into());
        self
    }

    /// Identity of this step's configuration: tool id plus canonical parameters.
    ///
    /// Used to keep adaptation from repeating a configuration that already failed.
    pub fn signature(&self) -> String {
        format!("{}:{}", self.tool_id, canonical_json(&self.parameters))
    }
}

/// The planner's cost estimate for a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanEstimate {
    pub tool_calls: usize,
    /// Sequential steps summed, parallel groups counted at their slowest member.
    pub duration_ms: u64,
    pub tokens: usize,
}

/// An ordered list of steps plus the reasoning that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub task_id: String,
    pub iteration: u32,
    pub steps: Vec<PlanStep>,
    pub rationale: String,

    /// Index in the [`PlanLog`] of the plan this one adapts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<usize>,

    /// Names of the guidance documents that informed the plan.
    #[serde(default)]
    pub guidance: Vec<String>,

    #[serde(default)]
    pub estimate: PlanEstimate,

    /// Planner self-score in [0, 1].
    #[serde(default)]
    pub quality: f32,

    /// Requirements no registered tool could address.
    #[serde(default)]
    pub unaddressed: Vec<String>,
}

impl Plan {
    pub fn new(task_id: impl Into<String>, iteration: u32, steps: Vec<PlanStep>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            iteration,
            steps,
            rationale: String::new(),
            parent: None,
            guidance: Vec::new(),
            estimate: PlanEstimate::default(),
            quality: 0.0,
            unaddressed: Vec::new(),
        }
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn with_parent(mut self, parent: usize) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Requirements declared by the plan's steps, in step order, deduplicated.
    pub fn addressed_requirements(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for step in &self.steps {
            if let Some(r) = step.requirement.as_deref() {
                if !seen.contains(&r) {
                    seen.push(r);
                }
            }
        }
        seen
    }

    /// Render for the reasoning scratch space.
    pub fn render(&self) -> String {
        let mut out = format!(
            "## Plan (iteration {})\n{}\n",
            self.iteration, self.rationale
        );
        for (i, step) in self.steps.iter().enumerate() {
            let mut flags = Vec::new();
            if step.critical {
                flags.push("critical");
            }
            if step.parallel_safe {
                flags.push("parallel");
            }
            out.push_str(&format!(
                "{}. {} [{}] {}\n",
                i + 1,
                step.tool_id,
                flags.join(","),
                step.description
            ));
        }
        out
    }
}

/// Append-only list of the plans produced in one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanLog {
    plans: Vec<Plan>,
}

impl PlanLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plan and return its index.
    pub fn push(&mut self, plan: Plan) -> usize {
        self.plans.push(plan);
        self.plans.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&Plan> {
        self.plans.get(index)
    }

    pub fn latest(&self) -> Option<(usize, &Plan)> {
        self.plans.iter().enumerate().last()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Walk from `index` back to the first plan through `parent` indices.
    pub fn lineage(&self, index: usize) -> Vec<&Plan> {
        let mut chain = Vec::new();
        let mut cursor = Some(index);
        while let Some(i) = cursor {
            let Some(plan) = self.plans.get(i) else { break };
            chain.push(plan);
            // Parents always precede children; guard against malformed input.
            cursor = plan.parent.filter(|p| *p < i);
        }
        chain
    }

    pub fn iter(&self) -> impl Iterator<Item = &Plan> {
        self.plans.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signature_ignores_key_order() {
        let a = PlanStep::new("lookup", json!({"a": 1, "b": {"y": 2, "x": 1}}));
        let b = PlanStep::new("lookup", json!({"b": {"x": 1, "y": 2}, "a": 1}));
        assert_eq!(a.signature(), b.signature());

        let c = PlanStep::new("lookup", json!({"a": 2}));
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn log_lineage_follows_parent_indices() {
        let mut log = PlanLog::new();
        let first = log.push(Plan::new("T", 0, vec![]));
        let second = log.push(Plan::new("T", 1, vec![]).with_parent(first));
        let third = log.push(Plan::new("T", 2, vec![]).with_parent(second));

        let chain = log.lineage(third);
        let iterations: Vec<u32> = chain.iter().map(|p| p.iteration).collect();
        assert_eq!(iterations, vec![2, 1, 0]);
        assert_eq!(log.latest().map(|(i, _)| i), Some(third));
    }

    #[test]
    fn addressed_requirements_deduplicates() {
        let plan = Plan::new(
            "T",
            0,
            vec![
                PlanStep::new("a", json!({})).for_requirement("r1"),
                PlanStep::new("b", json!({})).for_requirement("r1"),
                PlanStep::new("c", json!({})).for_requirement("r2"),
                PlanStep::new("d", json!({})),
            ],
        );
        assert_eq!(plan.addressed_requirements(), vec!["r1", "r2"]);
    }

    #[test]
    fn render_marks_flags() {
        let plan = Plan::new(
            "T",
            0,
            vec![PlanStep::new("search", json!({})).critical().parallel_safe()],
        )
        .with_rationale("because");
        let text = plan.render();
        assert!(text.contains("critical,parallel"));
        assert!(text.contains("because"));
    }
}
