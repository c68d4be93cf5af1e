//! The Steward task loop.
//!
//! A task moves through **Gather → Plan → Act → Verify → Decide** until it
//! is complete, escalated to a human, or out of iterations:
//!
//! 1. **Gather** binding guidance and compact memory if the budget is tight
//! 2. **Plan** tool steps for the task (or adapt the previous plan), then
//!    classify the plan into a HITL tier and hold tier 3/4 plans for approval
//! 3. **Act** through the tool executor, in parallel where steps allow
//! 4. **Verify** the result with six checks
//! 5. **Decide**: complete, escalate a critical failure, or iterate with the
//!    verifier's feedback
//!
//! [`Orchestrator`] owns the loop; everything it needs per task lives in a
//! session that is dropped when the task ends.

pub mod act;
pub mod context;
pub mod orchestrator;
pub mod planner;
pub mod tier;
pub mod trace;
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::{
    BudgetCategory, BudgetSnapshot, CompactionService, ContextBudgetManager, ExtractiveSummarizer,
    Summarizer, WorkingMemory,
};
pub use orchestrator::{AgentResponse, LoopState, Orchestrator, ResponseStatus, SetupError};
pub use planner::{Adaptation, Planner, PlanningContext, RulePlanner};
pub use tier::{classify, classify_attributes, derive_action};
pub use trace::{InMemoryTraceSink, IterationRecord, JsonLinesTraceSink, TraceEntry, TraceSink};
pub use verifier::{SelfVerifier, VerificationContext, VerifierError};
