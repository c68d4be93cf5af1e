//! Session context: working memory, its token budget, and compaction.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`WorkingMemory`] | turns, task state, tool cache, critical items |
//! | [`ContextBudgetManager`] | hard ceiling split into six categories |
//! | [`CompactionService`] | shrinks memory under a target, keeping critical items |

pub mod budget;
pub mod compaction;
pub mod token;
pub mod working_memory;

pub use budget::{BudgetCategory, BudgetSnapshot, BudgetStatus, CategoryUsage, ContextBudgetManager};
pub use compaction::{
    CompactMemory, CompactionService, CompactionStats, ExtractiveSummarizer, Summarizer,
    verify_critical,
};
pub use working_memory::{
    CriticalItem, CriticalKind, MemoryTokens, Turn, TurnRole, WorkingMemory, cache_entry_tokens,
    state_entry_tokens,
};
