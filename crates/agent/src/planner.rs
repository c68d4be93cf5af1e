//! Planning: turning a task into ordered tool invocations.
//!
//! The [`Planner`] trait has two entry points: `create_plan` for the first
//! iteration and `adapt_plan` for every later one. [`RulePlanner`] is the
//! built-in implementation:
//!
//! - every actionable requirement (or the description, when there are none)
//!   becomes one step, using the registered tool whose id, description and
//!   capabilities share the most terms with it
//! - a tool is only a candidate if its required parameters can be filled
//!   from the task's auxiliary context, task state, or the requirement text
//! - MUST requirements and tier 3+ tools give critical steps; read-only
//!   tools give parallel-safe steps
//! - adaptation keeps what worked and never re-issues a step configuration
//!   that already failed

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, info};

use steward_core::task::is_mandatory;
use steward_core::text::{overlap, terms};
use steward_core::{
    ExecutionResult, GuidanceKind, HitlTier, KnowledgeCollection, Plan, PlanEstimate, PlanStep,
    PlanningError, StepErrorKind, Task, ToolDescriptor, ToolRegistry, VerificationResult, schema,
};

use crate::context::WorkingMemory;
use crate::context::token::estimate_tokens;

/// Read-only view handed to the planner.
pub struct PlanningContext<'a> {
    pub task: &'a Task,
    pub knowledge: &'a KnowledgeCollection,
    pub registry: &'a ToolRegistry,
    pub memory: &'a WorkingMemory,
    pub iteration: u32,
}

/// What the previous iteration produced.
pub struct Adaptation<'a> {
    pub previous: &'a Plan,
    /// Index of `previous` in the session's plan log.
    pub previous_index: usize,
    /// Empty when the previous plan was held at the approval gate.
    pub execution: &'a ExecutionResult,
    /// `None` when the previous plan never ran.
    pub verification: Option<&'a VerificationResult>,
    /// Signatures of every step that has failed in this session.
    pub failed_signatures: &'a BTreeSet<String>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn create_plan(&self, ctx: &PlanningContext<'_>) -> Result<Plan, PlanningError>;

    async fn adapt_plan(
        &self,
        ctx: &PlanningContext<'_>,
        adaptation: &Adaptation<'_>,
    ) -> Result<Plan, PlanningError>;
}

/// Parameters that take the requirement text when nothing else fills them.
const FREE_TEXT_PARAMS: &[&str] = &["query", "input", "text", "topic", "requirement"];

const MIN_MATCH: f32 = 0.1;

/// One thing the plan has to address.
struct WorkItem {
    text: String,
    /// `None` when the item is the task description itself.
    requirement: Option<String>,
}

fn work_items(task: &Task) -> Vec<WorkItem> {
    let items: Vec<WorkItem> = task
        .actionable_requirements()
        .map(|r| WorkItem {
            text: r.to_string(),
            requirement: Some(r.to_string()),
        })
        .collect();
    if items.is_empty() {
        vec![WorkItem {
            text: task.base_description().to_string(),
            requirement: None,
        }]
    } else {
        items
    }
}

struct Candidate<'r> {
    descriptor: &'r ToolDescriptor,
    score: f32,
    parameters: Value,
}

#[derive(Debug, Clone)]
pub struct RulePlanner {
    min_match: f32,
    max_tier: Option<HitlTier>,
}

impl Default for RulePlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl RulePlanner {
    pub fn new() -> Self {
        Self {
            min_match: MIN_MATCH,
            max_tier: None,
        }
    }

    /// Minimum term overlap for a tool to be considered.
    pub fn with_min_match(mut self, min_match: f32) -> Self {
        self.min_match = min_match;
        self
    }

    /// Never propose tools whose risk tier is above `tier`.
    pub fn with_max_tier(mut self, tier: HitlTier) -> Self {
        self.max_tier = Some(tier);
        self
    }

    /// Viable tools for `text`, best first; ties go to the lower id.
    fn candidates<'r>(&self, text: &str, ctx: &PlanningContext<'r>) -> Vec<Candidate<'r>> {
        let wanted = terms(text);
        let mut found: Vec<Candidate<'r>> = ctx
            .registry
            .search(None, self.max_tier)
            .into_iter()
            .filter_map(|d| {
                let score = overlap(&wanted, &terms(&d.search_text()));
                if score < self.min_match {
                    return None;
                }
                let parameters = fill_parameters(d, text, ctx.task, ctx.memory)?;
                Some(Candidate {
                    descriptor: d,
                    score,
                    parameters,
                })
            })
            .collect();
        // Stable sort keeps id order among equal scores.
        found.sort_by(|a, b| b.score.total_cmp(&a.score));
        found
    }

    fn build_step(candidate: &Candidate<'_>, item: &WorkItem) -> PlanStep {
        let d = candidate.descriptor;
        let mut step = PlanStep::new(&d.id, candidate.parameters.clone());
        step.description = format!("Use {} for \"{}\"", d.id, item.text);
        if let Some(r) = &item.requirement {
            step = step.for_requirement(r);
        }
        if is_mandatory(&item.text) || d.risk_tier >= HitlTier::Tier3 {
            step = step.critical();
        }
        if d.read_only {
            step = step.parallel_safe();
        }
        step
    }

    /// 0.6 × requirement coverage + 0.4 × mean match strength.
    fn assess(task: &Task, steps: &[PlanStep], registry: &ToolRegistry) -> f32 {
        let items = work_items(task);
        let addressed = items
            .iter()
            .filter(|it| {
                steps
                    .iter()
                    .any(|s| s.requirement.as_deref() == it.requirement.as_deref())
            })
            .count();
        let coverage = addressed as f32 / items.len() as f32;

        let mean = if steps.is_empty() {
            0.0
        } else {
            let total: f32 = steps
                .iter()
                .map(|s| {
                    let text = s.requirement.as_deref().unwrap_or(task.base_description());
                    registry
                        .descriptor(&s.tool_id)
                        .map(|d| overlap(&terms(text), &terms(&d.search_text())))
                        .unwrap_or(0.0)
                })
                .sum();
            total / steps.len() as f32
        };
        0.6 * coverage + 0.4 * mean
    }

    fn finish(
        task: &Task,
        iteration: u32,
        steps: Vec<PlanStep>,
        rationale: String,
        ctx: &PlanningContext<'_>,
        unaddressed: Vec<String>,
    ) -> Plan {
        let quality = Self::assess(task, &steps, ctx.registry);
        let mut plan = Plan::new(&task.id, iteration, steps).with_rationale(rationale);
        plan.guidance = select_guidance(ctx.knowledge, task);
        plan.unaddressed = unaddressed;
        plan.quality = quality;
        plan.estimate = PlanEstimate {
            tool_calls: plan.steps.len(),
            duration_ms: estimate_duration(&plan.steps, ctx.registry),
            tokens: 0,
        };
        plan.estimate.tokens = estimate_tokens(&plan.render());
        plan
    }
}

#[async_trait]
impl Planner for RulePlanner {
    async fn create_plan(&self, ctx: &PlanningContext<'_>) -> Result<Plan, PlanningError> {
        let items = work_items(ctx.task);
        let mut steps = Vec::new();
        let mut unaddressed = Vec::new();

        for item in &items {
            match self.candidates(&item.text, ctx).first() {
                Some(best) => steps.push(Self::build_step(best, item)),
                None => {
                    debug!(item = %item.text, "No viable tool for item");
                    unaddressed.push(item.text.clone());
                }
            }
        }

        if steps.is_empty() {
            return Err(PlanningError::NoCandidateTools {
                task_id: ctx.task.id.clone(),
            });
        }

        let mut rationale = format!(
            "Addresses {}/{} item(s) with {} step(s).",
            items.len() - unaddressed.len(),
            items.len(),
            steps.len()
        );
        if !unaddressed.is_empty() {
            rationale.push_str(&format!(" No tool for: {}.", unaddressed.join("; ")));
        }

        let plan = Self::finish(ctx.task, ctx.iteration, steps, rationale, ctx, unaddressed);
        info!(
            task_id = %ctx.task.id,
            iteration = ctx.iteration,
            steps = plan.steps.len(),
            quality = plan.quality,
            "Plan created"
        );
        Ok(plan)
    }

    async fn adapt_plan(
        &self,
        ctx: &PlanningContext<'_>,
        adaptation: &Adaptation<'_>,
    ) -> Result<Plan, PlanningError> {
        let previous = adaptation.previous;
        let failed = adaptation.failed_signatures;
        let mut steps: Vec<PlanStep> = Vec::new();
        let mut kept = 0;
        let mut replaced = Vec::new();
        let mut stuck = Vec::new();

        for (index, step) in previous.steps.iter().enumerate() {
            let signature = step.signature();
            let keep = match adaptation.execution.step(index) {
                Some(r) if r.is_success() => true,
                Some(r) if r.error_kind == Some(StepErrorKind::Cancelled) => {
                    !failed.contains(&signature)
                }
                Some(_) => false,
                // Skipped or never started
                None => !failed.contains(&signature),
            };
            if keep {
                steps.push(step.clone());
                kept += 1;
                continue;
            }

            let item = WorkItem {
                text: step
                    .requirement
                    .clone()
                    .unwrap_or_else(|| ctx.task.base_description().to_string()),
                requirement: step.requirement.clone(),
            };
            let taken: BTreeSet<String> = steps.iter().map(PlanStep::signature).collect();
            let alternative = self
                .candidates(&item.text, ctx)
                .iter()
                .map(|c| Self::build_step(c, &item))
                .find(|s| {
                    let sig = s.signature();
                    sig != signature && !failed.contains(&sig) && !taken.contains(&sig)
                });
            match alternative {
                Some(next) => {
                    replaced.push(format!("{} -> {}", step.tool_id, next.tool_id));
                    steps.push(next);
                }
                None => stuck.push(format!("step {index} ({})", step.tool_id)),
            }
        }

        if !stuck.is_empty() {
            info!(
                task_id = %ctx.task.id,
                failed_steps = ?stuck,
                "No viable alternative for failed steps"
            );
            return Err(PlanningError::NoViableAlternative {
                failed_steps: stuck,
            });
        }

        // Requirements added since the previous plan, e.g. reviewer changes.
        let known: BTreeSet<&str> = previous
            .addressed_requirements()
            .into_iter()
            .chain(previous.unaddressed.iter().map(String::as_str))
            .collect();
        let mut unaddressed = previous.unaddressed.clone();
        let mut added = 0;
        for requirement in ctx.task.actionable_requirements() {
            if known.contains(requirement) {
                continue;
            }
            let item = WorkItem {
                text: requirement.to_string(),
                requirement: Some(requirement.to_string()),
            };
            let next = self
                .candidates(&item.text, ctx)
                .iter()
                .map(|c| Self::build_step(c, &item))
                .find(|s| !failed.contains(&s.signature()));
            match next {
                Some(step) => {
                    steps.push(step);
                    added += 1;
                }
                None => unaddressed.push(requirement.to_string()),
            }
        }

        if steps.is_empty() {
            return Err(PlanningError::NoCandidateTools {
                task_id: ctx.task.id.clone(),
            });
        }

        let mut rationale = format!(
            "Adapts plan {} (iteration {}): kept {kept}, replaced {}, added {added}.",
            previous.id,
            previous.iteration,
            replaced.len()
        );
        if !replaced.is_empty() {
            rationale.push_str(&format!(" Replacements: {}.", replaced.join(", ")));
        }
        let reasons = adaptation
            .verification
            .map(VerificationResult::failure_reasons)
            .unwrap_or_default();
        if !reasons.is_empty() {
            rationale.push_str(&format!(" Addressing: {}.", reasons.join("; ")));
        }

        let plan = Self::finish(ctx.task, ctx.iteration, steps, rationale, ctx, unaddressed)
            .with_parent(adaptation.previous_index);
        info!(
            task_id = %ctx.task.id,
            iteration = ctx.iteration,
            parent = adaptation.previous_index,
            steps = plan.steps.len(),
            replaced = replaced.len(),
            "Plan adapted"
        );
        Ok(plan)
    }
}

/// Fill declared parameters; `None` when a required one has no source.
fn fill_parameters(
    descriptor: &ToolDescriptor,
    text: &str,
    task: &Task,
    memory: &WorkingMemory,
) -> Option<Value> {
    let schema_doc = &descriptor.parameter_schema;
    let mut params = Map::new();

    for name in schema::property_names(schema_doc) {
        let declared = schema::property_type(schema_doc, &name);
        let value = if let Some(v) = task.aux_context.get(&name) {
            Some(v.clone())
        } else if let Some(v) = memory.state(&name) {
            Some(v.clone())
        } else if name == "domain" {
            task.domain.clone().map(Value::String)
        } else if FREE_TEXT_PARAMS.contains(&name.as_str())
            && declared.is_none_or(|t| t == "string")
        {
            Some(Value::String(text.to_string()))
        } else {
            None
        };
        if let Some(v) = value {
            params.insert(name, v);
        }
    }

    schema::required_fields(schema_doc)
        .iter()
        .all(|r| params.contains_key(r))
        .then_some(Value::Object(params))
}

/// Policies always apply; guidelines and procedures when they share terms with the task.
fn select_guidance(knowledge: &KnowledgeCollection, task: &Task) -> Vec<String> {
    let mut task_text = task.base_description().to_string();
    for r in task.actionable_requirements() {
        task_text.push(' ');
        task_text.push_str(r);
    }
    let task_terms = terms(&task_text);

    knowledge
        .documents
        .iter()
        .filter(|doc| {
            doc.kind == GuidanceKind::Policy
                || !terms(&format!("{} {}", doc.name.replace(['-', '_'], " "), doc.text))
                    .is_disjoint(&task_terms)
        })
        .map(|doc| doc.name.clone())
        .collect()
}

/// Worst case from declared timeouts: sequential steps add up, a run of
/// parallel-safe steps costs its slowest member.
fn estimate_duration(steps: &[PlanStep], registry: &ToolRegistry) -> u64 {
    let timeout = |s: &PlanStep| registry.descriptor(&s.tool_id).map(|d| d.timeout_ms).unwrap_or(0);
    let mut total = 0;
    let mut group_max: Option<u64> = None;
    for step in steps {
        if step.parallel_safe {
            group_max = Some(group_max.unwrap_or(0).max(timeout(step)));
        } else {
            total += group_max.take().unwrap_or(0);
            total += timeout(step);
        }
    }
    total + group_max.unwrap_or(0)
}
