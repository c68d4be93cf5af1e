//! Iteration trace: what happened in each loop iteration, and where it goes.
//!
//! Every iteration produces one [`IterationRecord`]. The orchestrator keeps
//! them in the task's response and also hands each one to the configured
//! [`TraceSink`]s as soon as the iteration ends, so a crash mid-task still
//! leaves the earlier iterations on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use steward_core::{
    ApprovalDecision, ExecutionSummary, HitlTier, Plan, ProposedAction, VerificationResult,
};

use crate::context::CompactionStats;
use crate::orchestrator::LoopState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionTrigger {
    /// Utilization crossed the compaction threshold.
    Threshold,
    /// A reservation would have exceeded its category allocation.
    OverAllocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub trigger: CompactionTrigger,
    #[serde(flatten)]
    pub stats: CompactionStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub tier: HitlTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    /// Why no decision was obtained (timeout, unavailable reviewer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub waited_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    /// Revision of the task this iteration worked on.
    pub task_revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    /// Position of `plan` in the session's plan log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_index: Option<usize>,
    /// Budgeted tokens in use when the iteration ended.
    pub context_tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<HitlTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ProposedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compactions: Vec<CompactionRecord>,
    /// State the loop moved to at the end of this iteration.
    pub decision: LoopState,
    pub recorded_at: DateTime<Utc>,
}

impl IterationRecord {
    pub fn new(iteration: u32, task_revision: u32) -> Self {
        Self {
            iteration,
            task_revision,
            plan: None,
            plan_index: None,
            context_tokens: 0,
            execution: None,
            verification: None,
            tier: None,
            action: None,
            approval: None,
            compactions: Vec::new(),
            decision: LoopState::Gathering,
            recorded_at: Utc::now(),
        }
    }
}

/// Persistence for iteration records.
pub trait TraceSink: Send + Sync {
    fn append(
        &self,
        session_id: &str,
        task_id: &str,
        record: &IterationRecord,
    ) -> steward_core::Result<()>;
}

/// One stored record with its owners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub session_id: String,
    pub task_id: String,
    #[serde(flatten)]
    pub record: IterationRecord,
}

/// Keeps records in memory (tests, `steward run --trace -`).
#[derive(Debug, Default)]
pub struct InMemoryTraceSink {
    entries: Mutex<Vec<TraceEntry>>,
}

impl InMemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TraceSink for InMemoryTraceSink {
    fn append(
        &self,
        session_id: &str,
        task_id: &str,
        record: &IterationRecord,
    ) -> steward_core::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| steward_core::Error::Internal("trace sink lock poisoned".into()))?;
        entries.push(TraceEntry {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            record: record.clone(),
        });
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonLinesTraceSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesTraceSink {
    pub fn open(path: impl AsRef<Path>) -> steward_core::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSink for JsonLinesTraceSink {
    fn append(
        &self,
        session_id: &str,
        task_id: &str,
        record: &IterationRecord,
    ) -> steward_core::Result<()> {
        let entry = TraceEntry {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            record: record.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| steward_core::Error::Internal("trace file lock poisoned".into()))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
