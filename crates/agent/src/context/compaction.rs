//! Compaction: shrink working memory under a token target without losing
//! critical items.
//!
//! Passes, cheapest first, stopping as soon as the memory fits:
//!
//! 1. Evict expired cache entries
//! 2. Summarize turns older than the most recent `keep_recent_turns` into a
//!    single summary turn sized by the compression ratio
//! 3. Drop the oldest cache entries
//! 4. Summarize the whole history into whatever room is left
//!
//! Critical items are never touched; afterwards every one of them must still
//! be present verbatim or compaction fails.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use steward_config::BudgetConfig;
use steward_core::CompactionError;

use super::token::TURN_OVERHEAD;
use super::working_memory::{Turn, TurnRole, WorkingMemory};

/// Condenses a run of turns into at most `max_tokens` tokens of text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, turns: &[Turn], max_tokens: usize) -> String;
}

/// Keeps the first sentence of every turn, truncated to fit.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveSummarizer;

fn first_sentence(text: &str) -> &str {
    let end = text
        .find(". ")
        .map(|i| i + 1)
        .into_iter()
        .chain(text.find('\n'))
        .min()
        .unwrap_or(text.len());
    text[..end].trim()
}

fn truncate_chars(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, turns: &[Turn], max_tokens: usize) -> String {
        let mut out = format!("Summary of {} earlier turns:", turns.len());
        for turn in turns {
            out.push_str(&format!(
                " [{}#{}] {}",
                turn.role.as_str(),
                turn.iteration,
                first_sentence(&turn.content)
            ));
        }
        truncate_chars(&out, max_tokens.saturating_mul(4)).to_string()
    }
}

/// Compacted memory plus what it cost.
#[derive(Debug, Clone)]
pub struct CompactMemory {
    pub memory: WorkingMemory,
    pub original_tokens: usize,
    pub compacted_tokens: usize,
    /// `compacted / original`; 1.0 when nothing was there to compact.
    pub compression_ratio: f32,
    pub preserved_critical: usize,
    pub summarized_turns: usize,
    pub evicted_cache_entries: usize,
}

/// Serializable record of one compaction for the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionStats {
    pub target_tokens: usize,
    pub original_tokens: usize,
    pub compacted_tokens: usize,
    pub compression_ratio: f32,
    pub preserved_critical: usize,
    pub summarized_turns: usize,
    pub evicted_cache_entries: usize,
}

impl CompactMemory {
    pub fn stats(&self, target_tokens: usize) -> CompactionStats {
        CompactionStats {
            target_tokens,
            original_tokens: self.original_tokens,
            compacted_tokens: self.compacted_tokens,
            compression_ratio: self.compression_ratio,
            preserved_critical: self.preserved_critical,
            summarized_turns: self.summarized_turns,
            evicted_cache_entries: self.evicted_cache_entries,
        }
    }
}

pub struct CompactionService {
    summarizer: Arc<dyn Summarizer>,
    compression_ratio: f32,
    keep_recent_turns: usize,
}

impl std::fmt::Debug for CompactionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionService")
            .field("compression_ratio", &self.compression_ratio)
            .field("keep_recent_turns", &self.keep_recent_turns)
            .finish()
    }
}

impl CompactionService {
    pub fn new(compression_ratio: f32, keep_recent_turns: usize) -> Self {
        Self {
            summarizer: Arc::new(ExtractiveSummarizer),
            compression_ratio,
            keep_recent_turns,
        }
    }

    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(config.compression_ratio, config.keep_recent_turns)
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Summarize `turns` into one summary turn of at most `budget` tokens.
    async fn summary_turn(&self, turns: &[Turn], budget: usize) -> Option<Turn> {
        let content_budget = budget.checked_sub(TURN_OVERHEAD).filter(|b| *b > 0)?;
        let content = self.summarizer.summarize(turns, content_budget).await;
        // Guard against summarizers that ignore the bound.
        let content = truncate_chars(&content, content_budget * 4).to_string();
        let iteration = turns.last().map(|t| t.iteration).unwrap_or(0);
        Some(Turn::new(TurnRole::Summary, iteration, content))
    }

    /// Produce a compacted copy of `memory` using at most `target_tokens`.
    pub async fn compact(
        &self,
        memory: &WorkingMemory,
        target_tokens: usize,
    ) -> Result<CompactMemory, CompactionError> {
        let original_tokens = memory.total_tokens();
        let critical_tokens = memory.critical_tokens();
        if critical_tokens > target_tokens {
            return Err(CompactionError::TargetUnreachable {
                critical_tokens,
                target_tokens,
            });
        }

        let mut out = memory.clone();
        let mut evicted = out.cache_mut().evict_expired(Utc::now());
        let mut summarized = 0;

        // Summarize older history at the fixed ratio.
        let turns = out.turns().to_vec();
        if out.total_tokens() > target_tokens && turns.len() > self.keep_recent_turns {
            let split = turns.len() - self.keep_recent_turns;
            let (older, recent) = turns.split_at(split);
            let older_tokens: usize = older.iter().map(Turn::tokens).sum();
            let budget = ((older_tokens as f32 * self.compression_ratio) as usize)
                .max(TURN_OVERHEAD + 1);
            if let Some(summary) = self.summary_turn(older, budget).await {
                let mut rebuilt = Vec::with_capacity(recent.len() + 1);
                rebuilt.push(summary);
                rebuilt.extend_from_slice(recent);
                out.replace_turns(rebuilt);
                summarized += older.len();
            }
        }

        // Oldest cache entries next.
        for key in out.cache().keys_by_age() {
            if out.total_tokens() <= target_tokens {
                break;
            }
            out.cache_mut().remove(&key);
            evicted += 1;
        }

        // Last resort: the whole history into the remaining room.
        if out.total_tokens() > target_tokens && !out.turns().is_empty() {
            let turns = out.turns().to_vec();
            let turn_tokens: usize = turns.iter().map(Turn::tokens).sum();
            let room = target_tokens.saturating_sub(out.total_tokens() - turn_tokens);
            let rebuilt: Vec<Turn> = self.summary_turn(&turns, room).await.into_iter().collect();
            summarized += turns
                .iter()
                .filter(|t| t.role != TurnRole::Summary)
                .count();
            out.replace_turns(rebuilt);
        }

        let compacted_tokens = out.total_tokens();
        if compacted_tokens > target_tokens {
            return Err(CompactionError::TargetUnreachable {
                critical_tokens,
                target_tokens,
            });
        }

        verify_critical(memory, &out)?;

        let compression_ratio = if original_tokens == 0 {
            1.0
        } else {
            compacted_tokens as f32 / original_tokens as f32
        };

        info!(
            session_id = %memory.session_id,
            original_tokens,
            compacted_tokens,
            target_tokens,
            summarized_turns = summarized,
            evicted_cache_entries = evicted,
            "Working memory compacted"
        );

        Ok(CompactMemory {
            preserved_critical: out.critical_items().len(),
            memory: out,
            original_tokens,
            compacted_tokens,
            compression_ratio,
            summarized_turns: summarized,
            evicted_cache_entries: evicted,
        })
    }
}

/// Every critical item of `before` must appear unchanged in `after`.
pub fn verify_critical(
    before: &WorkingMemory,
    after: &WorkingMemory,
) -> Result<(), CompactionError> {
    let missing: Vec<String> = before
        .critical_items()
        .iter()
        .filter(|item| !after.critical_items().contains(item))
        .map(|item| item.id.clone())
        .collect();

    if missing.is_empty() {
        debug!(count = before.critical_items().len(), "Critical items verified");
        Ok(())
    } else {
        Err(CompactionError::CriticalDataLost { missing })
    }
}
