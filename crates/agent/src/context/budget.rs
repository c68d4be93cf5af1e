//! Context budget manager: a hard token ceiling split into categories.
//!
//! Each category has an allocation; a category may overflow its allocation
//! only by drawing on the shared dynamic pool. The output reservation is
//! counted as used from the start so that no combination of writes can eat
//! into the room kept for the final answer.
//!
//! | Status | When |
//! |--------|------|
//! | `APPROVED` | fits its category, stays under the warning threshold |
//! | `WARNING` | fits, but crosses the threshold or draws on the pool |
//! | `OVER_ALLOCATION` | would cross the ceiling or exhaust the pool |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use steward_config::BudgetConfig;
use steward_core::BudgetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCategory {
    FixedContext,
    WorkingMemory,
    ToolCache,
    Reasoning,
    OutputReserve,
    DynamicPool,
}

impl BudgetCategory {
    pub const ALL: [BudgetCategory; 6] = [
        BudgetCategory::FixedContext,
        BudgetCategory::WorkingMemory,
        BudgetCategory::ToolCache,
        BudgetCategory::Reasoning,
        BudgetCategory::OutputReserve,
        BudgetCategory::DynamicPool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedContext => "fixed_context",
            Self::WorkingMemory => "working_memory",
            Self::ToolCache => "tool_cache",
            Self::Reasoning => "reasoning",
            Self::OutputReserve => "output_reserve",
            Self::DynamicPool => "dynamic_pool",
        }
    }
}

impl std::fmt::Display for BudgetCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetStatus {
    Approved,
    Warning,
    OverAllocation,
}

/// Per-category usage at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryUsage {
    pub category: BudgetCategory,
    pub allocated: usize,
    pub used: usize,
}

/// Serializable view of the budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub ceiling: usize,
    pub used: usize,
    pub pool_used: usize,
    pub utilization: f32,
    pub compaction_threshold: f32,
    pub categories: Vec<CategoryUsage>,
}

#[derive(Debug, Clone)]
pub struct ContextBudgetManager {
    ceiling: usize,
    allocations: BTreeMap<BudgetCategory, usize>,
    used: BTreeMap<BudgetCategory, usize>,
    compaction_threshold: f32,
    compaction_target: f32,
}

impl ContextBudgetManager {
    /// Create a manager. Categories missing from `allocations` get zero.
    pub fn new(
        ceiling: usize,
        allocations: impl IntoIterator<Item = (BudgetCategory, usize)>,
    ) -> Result<Self, BudgetError> {
        let mut table: BTreeMap<BudgetCategory, usize> =
            BudgetCategory::ALL.iter().map(|c| (*c, 0)).collect();
        table.extend(allocations);

        let allocated: usize = table.values().sum();
        if allocated > ceiling {
            return Err(BudgetError::InvalidAllocation { allocated, ceiling });
        }

        let mut used: BTreeMap<BudgetCategory, usize> =
            BudgetCategory::ALL.iter().map(|c| (*c, 0)).collect();
        used.insert(
            BudgetCategory::OutputReserve,
            table[&BudgetCategory::OutputReserve],
        );

        Ok(Self {
            ceiling,
            allocations: table,
            used,
            compaction_threshold: 0.8,
            compaction_target: 0.5,
        })
    }

    pub fn from_config(config: &BudgetConfig) -> Result<Self, BudgetError> {
        Ok(Self::new(
            config.total_tokens,
            [
                (BudgetCategory::FixedContext, config.fixed_context),
                (BudgetCategory::WorkingMemory, config.working_memory),
                (BudgetCategory::ToolCache, config.tool_cache),
                (BudgetCategory::Reasoning, config.reasoning),
                (BudgetCategory::OutputReserve, config.output_reserve),
                (BudgetCategory::DynamicPool, config.dynamic_pool),
            ],
        )?
        .with_thresholds(config.compaction_threshold, config.compaction_target))
    }

    pub fn with_thresholds(mut self, compaction_threshold: f32, compaction_target: f32) -> Self {
        self.compaction_threshold = compaction_threshold;
        self.compaction_target = compaction_target;
        self
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn allocated(&self, category: BudgetCategory) -> usize {
        self.allocations.get(&category).copied().unwrap_or(0)
    }

    pub fn used(&self, category: BudgetCategory) -> usize {
        self.used.get(&category).copied().unwrap_or(0)
    }

    pub fn total_used(&self) -> usize {
        self.used.values().sum()
    }

    pub fn utilization(&self) -> f32 {
        if self.ceiling == 0 {
            return 1.0;
        }
        self.total_used() as f32 / self.ceiling as f32
    }

    /// Pool tokens in use: direct pool writes plus every category's overflow.
    pub fn pool_used(&self) -> usize {
        BudgetCategory::ALL
            .iter()
            .map(|c| {
                if *c == BudgetCategory::DynamicPool {
                    self.used(*c)
                } else {
                    self.used(*c).saturating_sub(self.allocated(*c))
                }
            })
            .sum()
    }

    fn pool_remaining(&self) -> usize {
        self.allocated(BudgetCategory::DynamicPool)
            .saturating_sub(self.pool_used())
    }

    /// How many extra pool tokens writing `tokens` to `category` would take.
    fn pool_draw(&self, category: BudgetCategory, tokens: usize) -> usize {
        if category == BudgetCategory::DynamicPool {
            return tokens;
        }
        let used = self.used(category);
        let allocated = self.allocated(category);
        let before = used.saturating_sub(allocated);
        let after = (used + tokens).saturating_sub(allocated);
        after - before
    }

    fn over_threshold(&self, total: usize) -> bool {
        total as f64 > self.compaction_threshold as f64 * self.ceiling as f64
    }

    /// Classify a prospective write without recording it.
    pub fn check_budget(&self, category: BudgetCategory, tokens: usize) -> BudgetStatus {
        let projected = self.total_used() + tokens;
        if projected > self.ceiling {
            return BudgetStatus::OverAllocation;
        }
        let draw = self.pool_draw(category, tokens);
        if draw > self.pool_remaining() {
            return BudgetStatus::OverAllocation;
        }
        if draw > 0 || self.over_threshold(projected) {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Approved
        }
    }

    /// Check and record a write in one step. Nothing is recorded on rejection.
    pub fn reserve(
        &mut self,
        category: BudgetCategory,
        tokens: usize,
    ) -> Result<BudgetStatus, BudgetError> {
        let status = self.check_budget(category, tokens);
        match status {
            BudgetStatus::OverAllocation => {
                warn!(
                    category = %category,
                    requested = tokens,
                    used = self.total_used(),
                    ceiling = self.ceiling,
                    "Budget write rejected"
                );
                Err(BudgetError::OverAllocation {
                    category: category.to_string(),
                    requested: tokens,
                    used: self.total_used(),
                    ceiling: self.ceiling,
                })
            }
            BudgetStatus::Warning => {
                *self.used.entry(category).or_insert(0) += tokens;
                debug!(
                    category = %category,
                    tokens,
                    utilization = self.utilization(),
                    "Budget write above threshold or drawing on pool"
                );
                Ok(status)
            }
            BudgetStatus::Approved => {
                *self.used.entry(category).or_insert(0) += tokens;
                Ok(status)
            }
        }
    }

    /// Give tokens back to a category.
    pub fn release(&mut self, category: BudgetCategory, tokens: usize) {
        let slot = self.used.entry(category).or_insert(0);
        *slot = slot.saturating_sub(tokens);
    }

    /// Set a category's usage. Lowering always succeeds; raising is a reservation.
    pub fn reset_to(
        &mut self,
        category: BudgetCategory,
        tokens: usize,
    ) -> Result<BudgetStatus, BudgetError> {
        let current = self.used(category);
        if tokens <= current {
            self.used.insert(category, tokens);
            return Ok(self.check_budget(category, 0));
        }
        self.reserve(category, tokens - current)
    }

    /// Usage is above the compaction threshold.
    pub fn needs_compaction(&self) -> bool {
        self.over_threshold(self.total_used())
    }

    /// Memory plus cache size that brings total usage to the compaction target.
    pub fn compaction_target_tokens(&self) -> usize {
        let target_total = (self.ceiling as f64 * self.compaction_target as f64) as usize;
        let memory =
            self.used(BudgetCategory::WorkingMemory) + self.used(BudgetCategory::ToolCache);
        let other = self.total_used().saturating_sub(memory);
        target_total.saturating_sub(other)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            ceiling: self.ceiling,
            used: self.total_used(),
            pool_used: self.pool_used(),
            utilization: self.utilization(),
            compaction_threshold: self.compaction_threshold,
            categories: BudgetCategory::ALL
                .iter()
                .map(|c| CategoryUsage {
                    category: *c,
                    allocated: self.allocated(*c),
                    used: self.used(*c),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ContextBudgetManager {
        ContextBudgetManager::from_config(&BudgetConfig::default()).unwrap()
    }

    /// 1000-token ceiling: 100 fixed, 400 memory, 200 cache, 100 reasoning,
    /// 100 output, 100 pool.
    fn small() -> ContextBudgetManager {
        ContextBudgetManager::new(
            1_000,
            [
                (BudgetCategory::FixedContext, 100),
                (BudgetCategory::WorkingMemory, 400),
                (BudgetCategory::ToolCache, 200),
                (BudgetCategory::Reasoning, 100),
                (BudgetCategory::OutputReserve, 100),
                (BudgetCategory::DynamicPool, 100),
            ],
        )
        .unwrap()
    }

    #[test]
    fn default_allocation_fills_ceiling() {
        let m = manager();
        assert_eq!(m.ceiling(), 32_000);
        let allocated: usize = BudgetCategory::ALL.iter().map(|c| m.allocated(*c)).sum();
        assert_eq!(allocated, 32_000);
    }

    #[test]
    fn output_reserve_counts_from_start() {
        let m = small();
        assert_eq!(m.total_used(), 100);
        assert_eq!(m.used(BudgetCategory::OutputReserve), 100);
    }

    #[test]
    fn allocations_above_ceiling_rejected() {
        let err = ContextBudgetManager::new(100, [(BudgetCategory::WorkingMemory, 101)])
            .unwrap_err();
        assert_eq!(
            err,
            BudgetError::InvalidAllocation {
                allocated: 101,
                ceiling: 100
            }
        );
    }

    #[test]
    fn within_allocation_is_approved() {
        let mut m = small();
        assert_eq!(
            m.reserve(BudgetCategory::WorkingMemory, 300).unwrap(),
            BudgetStatus::Approved
        );
        assert_eq!(m.used(BudgetCategory::WorkingMemory), 300);
    }

    #[test]
    fn overflow_draws_on_pool_with_warning() {
        let mut m = small();
        m.reserve(BudgetCategory::WorkingMemory, 400).unwrap();
        assert_eq!(
            m.reserve(BudgetCategory::WorkingMemory, 60).unwrap(),
            BudgetStatus::Warning
        );
        assert_eq!(m.pool_used(), 60);

        // Only 40 pool tokens left
        assert_eq!(
            m.check_budget(BudgetCategory::ToolCache, 241),
            BudgetStatus::OverAllocation
        );
        assert_eq!(
            m.check_budget(BudgetCategory::ToolCache, 240),
            BudgetStatus::Warning
        );
    }

    #[test]
    fn crossing_threshold_warns() {
        let mut m = small();
        m.reserve(BudgetCategory::WorkingMemory, 400).unwrap();
        m.reserve(BudgetCategory::ToolCache, 200).unwrap();
        // 800 is exactly 80%, still approved
        assert_eq!(
            m.check_budget(BudgetCategory::FixedContext, 100),
            BudgetStatus::Approved
        );
        m.reserve(BudgetCategory::FixedContext, 100).unwrap();
        assert_eq!(
            m.check_budget(BudgetCategory::Reasoning, 1),
            BudgetStatus::Warning
        );
    }

    #[test]
    fn rejected_write_records_nothing() {
        let mut m = small();
        let before = m.total_used();
        let err = m.reserve(BudgetCategory::WorkingMemory, 2_000).unwrap_err();
        assert!(matches!(err, BudgetError::OverAllocation { requested: 2_000, .. }));
        assert_eq!(m.total_used(), before);
    }

    #[test]
    fn usage_never_exceeds_ceiling() {
        let mut m = small();
        for _ in 0..100 {
            for c in BudgetCategory::ALL {
                let _ = m.reserve(c, 37);
                assert!(m.total_used() <= m.ceiling());
            }
        }
    }

    #[test]
    fn reset_to_lowers_and_raises() {
        let mut m = small();
        m.reserve(BudgetCategory::Reasoning, 80).unwrap();
        m.reset_to(BudgetCategory::Reasoning, 20).unwrap();
        assert_eq!(m.used(BudgetCategory::Reasoning), 20);
        m.reset_to(BudgetCategory::Reasoning, 90).unwrap();
        assert_eq!(m.used(BudgetCategory::Reasoning), 90);
        assert!(m.reset_to(BudgetCategory::Reasoning, 5_000).is_err());
        assert_eq!(m.used(BudgetCategory::Reasoning), 90);
    }

    #[test]
    fn release_saturates() {
        let mut m = small();
        m.reserve(BudgetCategory::ToolCache, 10).unwrap();
        m.release(BudgetCategory::ToolCache, 50);
        assert_eq!(m.used(BudgetCategory::ToolCache), 0);
    }

    #[test]
    fn compaction_needed_above_threshold() {
        let mut m = small();
        m.reserve(BudgetCategory::WorkingMemory, 400).unwrap();
        m.reserve(BudgetCategory::ToolCache, 200).unwrap();
        m.reserve(BudgetCategory::FixedContext, 100).unwrap();
        assert!(!m.needs_compaction()); // 800 is not above 80%
        m.reserve(BudgetCategory::Reasoning, 50).unwrap();
        assert!(m.needs_compaction());
    }

    #[test]
    fn compaction_target_excludes_other_categories() {
        let mut m = small();
        m.reserve(BudgetCategory::FixedContext, 100).unwrap();
        m.reserve(BudgetCategory::WorkingMemory, 400).unwrap();
        // target total 500; fixed 100 + output 100 stay → memory may keep 300
        assert_eq!(m.compaction_target_tokens(), 300);
    }

    #[test]
    fn snapshot_lists_every_category() {
        let m = small();
        let snap = m.snapshot();
        assert_eq!(snap.categories.len(), 6);
        assert_eq!(snap.used, 100);
        assert!((snap.utilization - 0.1).abs() < 1e-6);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["categories"][0]["category"], "fixed_context");
    }
}
