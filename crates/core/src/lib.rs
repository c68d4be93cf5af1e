//! # Steward Core
//!
//! Domain types, traits, and error definitions for the Steward
//! task-execution loop. This crate has **no runtime wiring**: it defines the
//! model that the planner, verifier, executor and orchestrator are written
//! against.
//!
//! ## Design Philosophy
//!
//! Every collaborator at the edge of the loop (tools, knowledge stores,
//! approval reviewers, trace persistence) is a trait here. Implementations
//! live in their respective crates, which keeps:
//! - test doubles trivial to write
//! - the dependency graph pointing inward at core
//! - the loop itself free of ambient lookups

pub mod approval;
pub mod cache;
pub mod context;
pub mod error;
pub mod execution;
pub mod hitl;
pub mod knowledge;
pub mod plan;
pub mod schema;
pub mod task;
pub mod text;
pub mod tool;
pub mod verification;

// Re-export key types at crate root for ergonomics
pub use approval::{ApprovalDecision, ApprovalGateway, ApprovalRequest, FixedApproval, NoReviewer};
pub use cache::{CacheEntry, ToolCache, cache_key, canonical_json};
pub use context::ExecutionContext;
pub use error::{
    ApprovalError, BudgetError, CompactionError, Error, EscalationReason, PlanningError, Result,
    ToolError,
};
pub use execution::{
    ExecutionResult, ExecutionStatus, ExecutionSummary, StepErrorKind, StepResult, StepStatus,
    StepSummary,
};
pub use hitl::{DataSensitivity, HitlTier, Impact, ProposedAction, Reversibility};
pub use knowledge::{
    GuidanceDocument, GuidanceKind, InMemoryKnowledgeStore, KnowledgeCollection, KnowledgeStore,
    RequirementLevel,
};
pub use plan::{Plan, PlanEstimate, PlanLog, PlanStep};
pub use task::{FEEDBACK_PREFIX, Priority, Task, is_feedback, is_mandatory};
pub use tool::{Tool, ToolDescriptor, ToolRegistry};
pub use verification::{Check, CheckKind, VerificationResult};
