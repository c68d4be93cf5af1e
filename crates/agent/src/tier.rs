//! Tier classification: how much human oversight an outcome needs.
//!
//! [`classify`] is a pure function of three attributes, evaluated against a
//! fixed decision table (first match wins):
//!
//! | impact | reversibility | sensitivity | tier |
//! |--------|---------------|-------------|------|
//! | LOW | FULL | any | 1 |
//! | MEDIUM | FULL or PARTIAL | not RESTRICTED | 2 |
//! | HIGH | any | any | 3 |
//! | any | NONE | RESTRICTED | 4 |
//!
//! Anything the table does not match is tier 3. Because rows are evaluated
//! top-down, HIGH/NONE/RESTRICTED lands on tier 3.
//!
//! [`derive_action`] makes the attributes explicit: they come from the
//! descriptors of the tools a plan is about to run, never from free text.
//! It only reads the plan and the registry, so a plan is classified before
//! any of its steps execute.

use std::collections::BTreeSet;

use steward_core::{
    DataSensitivity, HitlTier, Impact, Plan, ProposedAction, Reversibility, Task, ToolRegistry,
};

/// Map risk attributes to a tier.
pub fn classify_attributes(
    impact: Impact,
    reversibility: Reversibility,
    sensitivity: DataSensitivity,
) -> HitlTier {
    use DataSensitivity as S;
    use Impact as I;
    use Reversibility as R;

    match (impact, reversibility, sensitivity) {
        (I::Low, R::Full, _) => HitlTier::Tier1,
        (I::Medium, R::Full | R::Partial, s) if s != S::Restricted => HitlTier::Tier2,
        (I::High, _, _) => HitlTier::Tier3,
        (_, R::None, S::Restricted) => HitlTier::Tier4,
        _ => HitlTier::Tier3,
    }
}

pub fn classify(action: &ProposedAction) -> HitlTier {
    classify_attributes(action.impact, action.reversibility, action.sensitivity)
}

fn impact_of(tier: HitlTier) -> Impact {
    match tier {
        HitlTier::Tier1 => Impact::Low,
        HitlTier::Tier2 => Impact::Medium,
        HitlTier::Tier3 | HitlTier::Tier4 => Impact::High,
    }
}

/// Derive the action a plan proposes, before it runs.
///
/// - impact: the highest descriptor risk tier (1 → LOW, 2 → MEDIUM, 3+ → HIGH);
///   a critical step that writes raises it to at least MEDIUM
/// - reversibility and sensitivity: the worst over all descriptors
/// - a `sensitivity` entry in the task's auxiliary context raises sensitivity
/// - steps naming unregistered tools count as HIGH impact
/// - confidence is the plan's quality estimate
pub fn derive_action(task: &Task, plan: &Plan, registry: &ToolRegistry) -> ProposedAction {
    let mut impact = Impact::Low;
    let mut reversibility = Reversibility::Full;
    let mut sensitivity = DataSensitivity::Public;
    let mut tool_ids = BTreeSet::new();

    for step in &plan.steps {
        tool_ids.insert(step.tool_id.clone());
        match registry.descriptor(&step.tool_id) {
            Some(d) => {
                impact = impact.max(impact_of(d.risk_tier));
                if step.critical && !d.read_only {
                    impact = impact.max(Impact::Medium);
                }
                reversibility = reversibility.max(d.reversibility);
                sensitivity = sensitivity.max(d.sensitivity);
            }
            None => impact = Impact::High,
        }
    }

    if let Some(declared) = task
        .aux_context
        .get("sensitivity")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<DataSensitivity>().ok())
    {
        sensitivity = sensitivity.max(declared);
    }

    let mut action = ProposedAction::new(
        format!(
            "Run plan {} for task {}",
            plan.id, task.id
        ),
        impact,
        reversibility,
        sensitivity,
    );
    action.tool_ids = tool_ids.into_iter().collect();
    action.rationale = plan.rationale.clone();
    action.confidence = plan.quality;
    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedTool;
    use serde_json::json;
    use steward_core::{PlanStep, ToolDescriptor};

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(ScriptedTool::ok(
            ToolDescriptor::new("lookup", "Look up records")
                .with_risk_tier(HitlTier::Tier1)
                .read_only(),
            json!({}),
        )));
        registry.register(Box::new(ScriptedTool::ok(
            ToolDescriptor::new("ticket_update", "Update a ticket")
                .with_risk_tier(HitlTier::Tier2)
                .with_reversibility(Reversibility::Partial),
            json!({}),
        )));
        registry.register(Box::new(ScriptedTool::ok(
            ToolDescriptor::new("publish", "Publish externally")
                .with_risk_tier(HitlTier::Tier3)
                .with_reversibility(Reversibility::None)
                .with_sensitivity(DataSensitivity::Restricted),
            json!({}),
        )));
        registry
    }

    #[test]
    fn decision_table_rows() {
        use DataSensitivity as S;
        use Impact as I;
        use Reversibility as R;

        assert_eq!(classify_attributes(I::Low, R::Full, S::Restricted), HitlTier::Tier1);
        assert_eq!(classify_attributes(I::Medium, R::Partial, S::Confidential), HitlTier::Tier2);
        assert_eq!(classify_attributes(I::Medium, R::Full, S::Restricted), HitlTier::Tier3);
        assert_eq!(classify_attributes(I::High, R::Full, S::Public), HitlTier::Tier3);
        assert_eq!(classify_attributes(I::High, R::None, S::Restricted), HitlTier::Tier3);
        assert_eq!(classify_attributes(I::Low, R::None, S::Restricted), HitlTier::Tier4);
        assert_eq!(classify_attributes(I::Medium, R::None, S::Restricted), HitlTier::Tier4);
        // Unmatched rows fall back to tier 3
        assert_eq!(classify_attributes(I::Low, R::Partial, S::Public), HitlTier::Tier3);
        assert_eq!(classify_attributes(I::Medium, R::None, S::Public), HitlTier::Tier3);
    }

    #[test]
    fn sensitivity_never_lowers_tier() {
        for impact in [Impact::Low, Impact::Medium, Impact::High] {
            for reversibility in [Reversibility::Full, Reversibility::Partial, Reversibility::None] {
                let tiers: Vec<HitlTier> = DataSensitivity::ALL
                    .iter()
                    .map(|s| classify_attributes(impact, reversibility, *s))
                    .collect();
                assert!(
                    tiers.windows(2).all(|w| w[0] <= w[1]),
                    "{impact:?}/{reversibility:?}: {tiers:?}"
                );
            }
        }
    }

    #[test]
    fn read_only_low_tier_plan_is_tier_one() {
        let mut plan =
            Plan::new("T", 0, vec![PlanStep::new("lookup", json!({})).parallel_safe()]);
        plan.quality = 0.9;
        let action = derive_action(&Task::new("T", "d"), &plan, &registry());
        assert_eq!(action.impact, Impact::Low);
        assert_eq!(classify(&action), HitlTier::Tier1);
        assert_eq!(action.confidence, 0.9);
    }

    #[test]
    fn worst_descriptor_wins() {
        let plan = Plan::new(
            "T",
            0,
            vec![
                PlanStep::new("lookup", json!({})),
                PlanStep::new("ticket_update", json!({})),
            ],
        );
        let action = derive_action(&Task::new("T", "d"), &plan, &registry());
        assert_eq!(action.impact, Impact::Medium);
        assert_eq!(action.reversibility, Reversibility::Partial);
        assert_eq!(classify(&action), HitlTier::Tier2);
        assert_eq!(action.tool_ids, vec!["lookup".to_string(), "ticket_update".to_string()]);
    }

    #[test]
    fn high_risk_tool_needs_approval() {
        let plan = Plan::new("T", 0, vec![PlanStep::new("publish", json!({}))]);
        let action = derive_action(&Task::new("T", "d"), &plan, &registry());
        assert_eq!(action.impact, Impact::High);
        assert!(classify(&action).requires_approval());
    }

    #[test]
    fn declared_sensitivity_raises_tier() {
        let plan = Plan::new("T", 0, vec![PlanStep::new("ticket_update", json!({}))]);
        let task = Task::new("T", "d").with_context("sensitivity", json!("restricted"));
        let action = derive_action(&task, &plan, &registry());
        assert_eq!(action.sensitivity, DataSensitivity::Restricted);
        assert_eq!(classify(&action), HitlTier::Tier3);
    }

    #[test]
    fn critical_write_is_at_least_medium() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(ScriptedTool::ok(
            ToolDescriptor::new("draft", "Write a draft").with_risk_tier(HitlTier::Tier1),
            json!({}),
        )));
        let plan = Plan::new("T", 0, vec![PlanStep::new("draft", json!({})).critical()]);
        let action = derive_action(&Task::new("T", "d"), &plan, &registry);
        assert_eq!(action.impact, Impact::Medium);
    }

    #[test]
    fn unknown_tool_is_high_impact() {
        let plan = Plan::new("T", 0, vec![PlanStep::new("ghost", json!({}))]);
        let action = derive_action(&Task::new("T", "d"), &plan, &registry());
        assert_eq!(action.impact, Impact::High);
    }
}
