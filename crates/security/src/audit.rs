//! Audit logging: structured records of what the loop did and was refused.
//!
//! Tool invocations, authorization and consent refusals, approval decisions,
//! compactions and terminal task states are recorded per task. Entries are
//! kept in memory for the run and fanned out to any attached sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

/// One audited fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub event: AuditEvent,
    /// Who acted: the loop's principal, or the reviewer for approvals.
    pub principal: String,
    pub task_id: String,
    pub outcome: AuditOutcome,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A tool ran, or was served from cache.
    ToolExecution { tool_id: String },
    AuthorizationDenied { tool_id: String },
    ConsentDenied { tool_id: String },
    /// A tier 2 outcome released without review.
    AuditedRelease { tier: u8 },
    /// A reviewer answered, or failed to answer, an approval request.
    ApprovalDecision { tier: u8, decision: String },
    Compaction {
        original_tokens: usize,
        compacted_tokens: usize,
    },
    TaskTerminal { status: String },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolExecution { .. } => "tool_execution",
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::ConsentDenied { .. } => "consent_denied",
            Self::AuditedRelease { .. } => "audited_release",
            Self::ApprovalDecision { .. } => "approval_decision",
            Self::Compaction { .. } => "compaction",
            Self::TaskTerminal { .. } => "task_terminal",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

/// Destination for audit entries besides the in-memory log.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

pub struct AuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
    sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("entries", &self.count())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLogger {
    pub fn new() -> Self {
        Self::with_sinks(Vec::new())
    }

    pub fn with_sinks(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sinks,
        }
    }

    // A poisoned lock still holds a usable log.
    fn lock(&self) -> MutexGuard<'_, Vec<AuditEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn log(
        &self,
        event: AuditEvent,
        principal: &str,
        task_id: &str,
        outcome: AuditOutcome,
        details: Option<String>,
    ) {
        let entry = AuditEntry {
            at: Utc::now(),
            event,
            principal: principal.to_string(),
            task_id: task_id.to_string(),
            outcome,
            details,
        };
        for sink in &self.sinks {
            sink.record(&entry);
        }
        self.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().clone()
    }

    pub fn entries_with(&self, outcome: AuditOutcome) -> Vec<AuditEntry> {
        self.select(|e| e.outcome == outcome)
    }

    pub fn entries_matching(&self, pred: impl Fn(&AuditEvent) -> bool) -> Vec<AuditEntry> {
        self.select(|e| pred(&e.event))
    }

    /// Everything recorded against one task, in order.
    pub fn for_task(&self, task_id: &str) -> Vec<AuditEntry> {
        self.select(|e| e.task_id == task_id)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn select(&self, keep: impl Fn(&AuditEntry) -> bool) -> Vec<AuditEntry> {
        self.lock().iter().filter(|e| keep(e)).cloned().collect()
    }
}

/// Forwards entries to `tracing`; refusals and failures at warn level.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, entry: &AuditEntry) {
        let details = entry.details.as_deref().unwrap_or("");
        match entry.outcome {
            AuditOutcome::Success => tracing::info!(
                kind = entry.event.kind(),
                event = ?entry.event,
                principal = %entry.principal,
                task_id = %entry.task_id,
                details,
                "audit"
            ),
            AuditOutcome::Failure | AuditOutcome::Denied => tracing::warn!(
                kind = entry.event.kind(),
                event = ?entry.event,
                principal = %entry.principal,
                task_id = %entry.task_id,
                outcome = ?entry.outcome,
                details,
                "audit"
            ),
        }
    }
}
