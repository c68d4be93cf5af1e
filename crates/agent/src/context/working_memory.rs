//! Working memory: session-scoped store the loop reads and writes.
//!
//! Holds the conversation turns of the session, a task-state map, the
//! tool-result cache and the *critical* items that compaction must carry
//! over verbatim. Working memory is:
//!
//! - **Session-scoped**: created when a task starts, never shared
//! - **Owned by the orchestrator**: planner and verifier get `&WorkingMemory`
//! - **Measurable**: every section reports its token cost for the budget

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use steward_core::{CacheEntry, ToolCache};

use super::token::{TURN_OVERHEAD, estimate_json_tokens, estimate_tokens, estimate_turn_tokens};

// ── Data Structures ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    System,
    Agent,
    Tool,
    Reviewer,
    /// Produced by compaction in place of older turns.
    Summary,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Reviewer => "reviewer",
            Self::Summary => "summary",
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub iteration: u32,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, iteration: u32, content: impl Into<String>) -> Self {
        Self {
            role,
            iteration,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(&self) -> usize {
        estimate_turn_tokens(&self.content)
    }
}

/// What makes an item critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalKind {
    SafetyFact,
    OpenDecision,
    PendingApproval,
}

/// An item compaction must preserve verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalItem {
    pub id: String,
    pub kind: CriticalKind,
    pub content: String,
}

impl CriticalItem {
    pub fn tokens(&self) -> usize {
        estimate_turn_tokens(&self.content)
    }
}

/// Token cost of each section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTokens {
    pub turns: usize,
    pub state: usize,
    pub critical: usize,
    pub cache: usize,
}

impl MemoryTokens {
    pub fn total(&self) -> usize {
        self.turns + self.state + self.critical + self.cache
    }
}

/// Token cost of storing one cached tool result.
pub fn cache_entry_tokens(entry: &CacheEntry) -> usize {
    TURN_OVERHEAD + estimate_json_tokens(&entry.output)
}

/// Token cost of one task-state entry.
pub fn state_entry_tokens(key: &str, value: &serde_json::Value) -> usize {
    estimate_tokens(key) + estimate_json_tokens(value)
}

/// The session's working memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub session_id: String,
    turns: Vec<Turn>,
    task_state: BTreeMap<String, serde_json::Value>,
    cache: ToolCache,
    critical: Vec<CriticalItem>,
    next_critical: u64,
}

// ── Implementation ────────────────────────────────────────────────────────

impl WorkingMemory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            turns: Vec::new(),
            task_state: BTreeMap::new(),
            cache: ToolCache::new(),
            critical: Vec::new(),
            next_critical: 1,
        }
    }

    // ── Turns ──

    /// Append a turn. Turns are never edited in place.
    pub fn add_turn(&mut self, role: TurnRole, iteration: u32, content: impl Into<String>) {
        self.turns.push(Turn::new(role, iteration, content));
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Swap the turn history for a compacted one.
    pub(crate) fn replace_turns(&mut self, turns: Vec<Turn>) {
        self.turns = turns;
    }

    // ── Task state ──

    pub fn set_state(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.task_state.insert(key.into(), value);
    }

    pub fn state(&self, key: &str) -> Option<&serde_json::Value> {
        self.task_state.get(key)
    }

    /// Current token cost of `key`, zero when absent.
    pub fn state_tokens(&self, key: &str) -> usize {
        self.task_state
            .get(key)
            .map(|v| state_entry_tokens(key, v))
            .unwrap_or(0)
    }

    // ── Tool cache ──

    pub fn cache(&self) -> &ToolCache {
        &self.cache
    }

    pub(crate) fn cache_mut(&mut self) -> &mut ToolCache {
        &mut self.cache
    }

    pub fn store_cache(&mut self, key: String, entry: CacheEntry) {
        self.cache.insert(key, entry);
    }

    // ── Critical items ──

    /// Record a critical item and return its id.
    pub fn add_critical(&mut self, kind: CriticalKind, content: impl Into<String>) -> String {
        let id = format!("crit-{}", self.next_critical);
        self.next_critical += 1;
        self.critical.push(CriticalItem {
            id: id.clone(),
            kind,
            content: content.into(),
        });
        id
    }

    /// Remove a resolved critical item. Returns it if it existed.
    pub fn resolve_critical(&mut self, id: &str) -> Option<CriticalItem> {
        let pos = self.critical.iter().position(|c| c.id == id)?;
        Some(self.critical.remove(pos))
    }

    pub fn critical_items(&self) -> &[CriticalItem] {
        &self.critical
    }

    pub fn has_critical_content(&self, content: &str) -> bool {
        self.critical.iter().any(|c| c.content == content)
    }

    // ── Token accounting ──

    pub fn token_breakdown(&self) -> MemoryTokens {
        MemoryTokens {
            turns: self.turns.iter().map(Turn::tokens).sum(),
            state: self
                .task_state
                .iter()
                .map(|(k, v)| state_entry_tokens(k, v))
                .sum(),
            critical: self.critical_tokens(),
            cache: self.cache_tokens(),
        }
    }

    /// Turns, task state and critical items.
    pub fn memory_tokens(&self) -> usize {
        let b = self.token_breakdown();
        b.turns + b.state + b.critical
    }

    pub fn critical_tokens(&self) -> usize {
        self.critical.iter().map(CriticalItem::tokens).sum()
    }

    pub fn cache_tokens(&self) -> usize {
        self.cache.iter().map(|(_, e)| cache_entry_tokens(e)).sum()
    }

    /// Everything compaction can act on.
    pub fn total_tokens(&self) -> usize {
        self.token_breakdown().total()
    }

    // ── Rendering ──

    /// Render working memory as a text section for the context bundle.
    pub fn render(&self) -> String {
        let mut out = String::new();

        if !self.critical.is_empty() {
            out.push_str("## Critical\n");
            for item in &self.critical {
                out.push_str(&format!("- [{:?}] {}\n", item.kind, item.content));
            }
            out.push('\n');
        }

        if !self.task_state.is_empty() {
            out.push_str("## Task State\n");
            for (key, value) in &self.task_state {
                out.push_str(&format!("- {key}: {value}\n"));
            }
            out.push('\n');
        }

        if !self.turns.is_empty() {
            out.push_str("## History\n");
            for turn in &self.turns {
                out.push_str(&format!(
                    "[{}#{}] {}\n",
                    turn.role.as_str(),
                    turn.iteration,
                    turn.content
                ));
            }
            out.push('\n');
        }

        if !self.cache.is_empty() {
            out.push_str(&format!("## Cached Results\n{} entries\n", self.cache.len()));
        }

        out
    }

    /// One-line summary persisted when the session ends.
    pub fn summarize(&self) -> String {
        let pending = self
            .critical
            .iter()
            .filter(|c| c.kind == CriticalKind::PendingApproval)
            .count();
        let summaries = self
            .turns
            .iter()
            .filter(|t| t.role == TurnRole::Summary)
            .count();
        let mut parts = vec![format!("{} turns", self.turns.len())];
        if summaries > 0 {
            parts.push(format!("{summaries} compacted summary"));
        }
        parts.push(format!(
            "{} critical items ({pending} pending approval)",
            self.critical.len()
        ));
        parts.push(format!("{} cached results", self.cache.len()));
        parts.push(format!("{} tokens", self.total_tokens()));
        parts.join(", ")
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
            && self.task_state.is_empty()
            && self.cache.is_empty()
            && self.critical.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
