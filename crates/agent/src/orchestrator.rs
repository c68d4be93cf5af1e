//! The orchestrator: drives one task through the autonomous loop.
//!
//! ```text
//!            ┌───────────────────────────────────────────────────────┐
//!            ▼                                                       │
//! GATHERING → PLANNING → tier gate ─┬─ tier 1/2 ────────────┐        │
//!                                   └─ tier 3/4 → AWAITING_APPROVAL  │
//!                                        ├─ approved ───────┤        │
//!                                        ├─ modified ────────────────┤
//!                                        └─ denied / timeout → ESCALATED
//!                                                           ▼        │
//!                           ACTING → VERIFYING ─┬─ incomplete → ITERATING
//!                                               ├─ critical failure → ESCALATED
//!                                               └─ complete → COMPLETE
//! ```
//!
//! The tier gate sits between planning and acting: a plan whose tools need
//! review runs nothing until a reviewer approves it, and the executor is
//! told the highest risk tier it may run. A modification replans from the
//! revised task without acting.
//!
//! Each task gets a fresh session (working memory, budget, plan log). The
//! loop runs at most `max_iterations` times; running out yields
//! `MAX_ITERATIONS`. A task only ends in `SUCCESS` after a verification
//! that came back complete.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use steward_config::AppConfig;
use steward_core::{
    ApprovalDecision, ApprovalError, ApprovalGateway, ApprovalRequest, BudgetError,
    EscalationReason, ExecutionContext, ExecutionResult, FEEDBACK_PREFIX, HitlTier,
    InMemoryKnowledgeStore, KnowledgeCollection, KnowledgeStore, NoReviewer, Plan, PlanLog,
    ProposedAction, StepErrorKind, StepResult, Task, VerificationResult, canonical_json,
};
use steward_security::{AuditEvent, AuditOutcome};
use steward_tools::ToolExecutor;

use crate::act;
use crate::context::token::{estimate_tokens, estimate_turn_tokens};
use crate::context::{
    BudgetCategory, BudgetSnapshot, CompactionService, ContextBudgetManager, CriticalKind,
    Summarizer, TurnRole, WorkingMemory, cache_entry_tokens, state_entry_tokens,
};
use crate::planner::{Adaptation, Planner, PlanningContext, RulePlanner};
use crate::tier::{classify, derive_action};
use crate::trace::{
    ApprovalRecord, CompactionRecord, CompactionTrigger, IterationRecord, TraceSink,
};
use crate::verifier::{SelfVerifier, VerificationContext, VerifierError};

/// Where the loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Gathering,
    Planning,
    Acting,
    Verifying,
    Iterating,
    AwaitingApproval,
    Escalated,
    Complete,
    MaxIterations,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Escalated | Self::Complete | Self::MaxIterations)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
    Escalated,
    MaxIterations,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Escalated => "ESCALATED",
            Self::MaxIterations => "MAX_ITERATIONS",
        }
    }
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller gets back for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub task_id: String,
    pub session_id: String,
    pub status: ResponseStatus,
    pub reason: String,
    /// Output of the last Act phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    pub trace: Vec<IterationRecord>,
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hitl_tier: Option<HitlTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationReason>,
    pub iterations: u32,
    pub budget: BudgetSnapshot,
    pub memory_summary: String,
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Invalid budget: {0}")]
    Budget(#[from] BudgetError),

    #[error("Invalid verifier configuration: {0}")]
    Verifier(#[from] VerifierError),

    #[error("Invalid tool tier cap: {0}")]
    ToolTier(u8),
}

/// Why an iteration ended the loop.
enum Stop {
    Complete,
    Escalated(EscalationReason),
}

impl From<EscalationReason> for Stop {
    fn from(reason: EscalationReason) -> Self {
        Self::Escalated(reason)
    }
}

fn exhausted(err: &BudgetError) -> Stop {
    Stop::Escalated(EscalationReason::BudgetExhausted {
        reason: err.to_string(),
    })
}

enum Outcome {
    Stopped(Stop),
    Cancelled,
    MaxIterations,
}

/// What an answered approval request lets the iteration do.
enum Clearance {
    Approved,
    /// The task was revised; replan without acting.
    Revised,
}

struct Previous {
    plan_index: usize,
    execution: ExecutionResult,
    verification: Option<VerificationResult>,
}

/// Per-task state. Nothing here outlives the task.
struct Session {
    id: String,
    task: Task,
    state: LoopState,
    memory: WorkingMemory,
    budget: ContextBudgetManager,
    knowledge: KnowledgeCollection,
    plans: PlanLog,
    trace: Vec<IterationRecord>,
    /// Signatures of steps that failed; never planned again.
    failed_signatures: BTreeSet<String>,
    previous: Option<Previous>,
    last_output: Option<Value>,
    last_verification: Option<VerificationResult>,
    last_tier: Option<HitlTier>,
}

impl Session {
    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(session_id = %self.id, from = ?self.state, to = ?next, "Loop transition");
            self.state = next;
        }
    }
}

pub struct Orchestrator {
    executor: Arc<ToolExecutor>,
    planner: Arc<dyn Planner>,
    verifier: SelfVerifier,
    compaction: CompactionService,
    knowledge: Arc<dyn KnowledgeStore>,
    approval: Arc<dyn ApprovalGateway>,
    trace_sinks: Vec<Arc<dyn TraceSink>>,
    /// Template cloned into every session.
    budget: ContextBudgetManager,
    safety_rules: Vec<String>,
    max_iterations: u32,
    max_parallel: usize,
    approval_timeout: Duration,
    principal: String,
}

impl Orchestrator {
    pub fn new(config: &AppConfig, executor: Arc<ToolExecutor>) -> Result<Self, SetupError> {
        let mut planner = RulePlanner::new();
        if let Some(level) = config.agent.max_tool_tier {
            let tier = HitlTier::from_level(level).ok_or(SetupError::ToolTier(level))?;
            planner = planner.with_max_tier(tier);
        }
        Ok(Self {
            executor,
            planner: Arc::new(planner),
            verifier: SelfVerifier::from_config(&config.verifier)?,
            compaction: CompactionService::from_config(&config.budget),
            knowledge: Arc::new(InMemoryKnowledgeStore::new()),
            approval: Arc::new(NoReviewer),
            trace_sinks: Vec::new(),
            budget: ContextBudgetManager::from_config(&config.budget)?,
            safety_rules: config.base_context.safety_rules.clone(),
            max_iterations: config.agent.max_iterations,
            max_parallel: config.agent.max_parallel_steps,
            approval_timeout: Duration::from_secs(config.agent.approval_timeout_secs),
            principal: config.agent.principal.clone(),
        })
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = knowledge;
        self
    }

    /// Reviewer consulted for tier 3 and 4 outcomes.
    pub fn with_approval(mut self, approval: Arc<dyn ApprovalGateway>) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.compaction = self.compaction.with_summarizer(summarizer);
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sinks.push(sink);
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub async fn execute_task(&self, task: Task) -> AgentResponse {
        self.execute_task_with_cancel(task, CancellationToken::new())
            .await
    }

    /// Run `task` to a terminal status. Cancellation is honoured between iterations.
    pub async fn execute_task_with_cancel(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> AgentResponse {
        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            task_id = %task.id,
            session_id = %session_id,
            priority = ?task.priority,
            "Task received"
        );

        let mut session = Session {
            memory: WorkingMemory::new(&session_id),
            id: session_id,
            task,
            state: LoopState::Gathering,
            budget: self.budget.clone(),
            knowledge: KnowledgeCollection::default(),
            plans: PlanLog::new(),
            trace: Vec::new(),
            failed_signatures: BTreeSet::new(),
            previous: None,
            last_output: None,
            last_verification: None,
            last_tier: None,
        };

        let outcome = self.drive(&mut session, &cancel).await;
        self.finish(session, outcome)
    }

    async fn drive(&self, session: &mut Session, cancel: &CancellationToken) -> Outcome {
        session.knowledge = self.load_knowledge(&session.task).await;
        if let Err(stop) = self.refresh_base_context(session) {
            return Outcome::Stopped(stop);
        }

        for iteration in 0..self.max_iterations {
            if cancel.is_cancelled() {
                info!(task_id = %session.task.id, iteration, "Task cancelled");
                return Outcome::Cancelled;
            }

            let mut record = IterationRecord::new(iteration, session.task.revision);
            let step = self.iterate(session, iteration, &mut record).await;

            record.decision = match &step {
                Ok(()) if iteration + 1 == self.max_iterations => LoopState::MaxIterations,
                Ok(()) => LoopState::Iterating,
                Err(Stop::Complete) => LoopState::Complete,
                Err(Stop::Escalated(_)) => LoopState::Escalated,
            };
            record.context_tokens = session.budget.total_used();
            session.transition(record.decision);
            self.append_trace(session, record);

            if let Err(stop) = step {
                return Outcome::Stopped(stop);
            }
        }
        Outcome::MaxIterations
    }

    /// One pass of gather → plan → act → verify → decide. `Err` ends the loop.
    async fn iterate(
        &self,
        session: &mut Session,
        iteration: u32,
        record: &mut IterationRecord,
    ) -> Result<(), Stop> {
        // Gather
        session.transition(LoopState::Gathering);
        if session.budget.needs_compaction() {
            self.compact(session, CompactionTrigger::Threshold, record)
                .await?;
        }
        self.gather(session, record).await?;

        // Plan
        session.transition(LoopState::Planning);
        let plan = self.plan(session, iteration).await?;
        let plan_index = session.plans.push(plan.clone());
        record.plan = Some(plan.clone());
        record.plan_index = Some(plan_index);
        self.account_reasoning(session, &plan, record).await?;
        self.add_turn(
            session,
            record,
            TurnRole::Agent,
            iteration,
            format!(
                "Plan {} with {} step(s): {}",
                plan.id,
                plan.steps.len(),
                plan.rationale
            ),
        )
        .await?;

        // Gate
        let action = derive_action(&session.task, &plan, self.executor.registry());
        let tier = classify(&action);
        record.tier = Some(tier);
        record.action = Some(action.clone());
        debug!(task_id = %session.task.id, iteration, tier = tier.level(), "Plan classified");
        let cleared = if tier.requires_approval() {
            session.last_tier = Some(tier);
            match self
                .request_approval(session, iteration, tier, action, record)
                .await?
            {
                Clearance::Approved => HitlTier::Tier4,
                Clearance::Revised => {
                    // Nothing ran; the next plan adapts this one to the revised task.
                    session.previous = Some(Previous {
                        plan_index,
                        execution: ExecutionResult::from_steps(
                            &plan.id,
                            Vec::new(),
                            Vec::new(),
                            None,
                        ),
                        verification: None,
                    });
                    return Ok(());
                }
            }
        } else {
            HitlTier::Tier2
        };

        // Act
        session.transition(LoopState::Acting);
        let mut ctx = ExecutionContext::new(&session.id, &session.task.id, &self.principal)
            .at_iteration(iteration)
            .with_max_tier(cleared);
        ctx.deadline = session.task.deadline;
        let act = act::run_plan(
            &self.executor,
            &plan,
            &ctx,
            session.memory.cache(),
            self.max_parallel,
        )
        .await;
        self.store_cache_writes(session, act.cache_writes)?;
        for step in &act.result.steps {
            self.add_turn(session, record, TurnRole::Tool, iteration, describe_step(step))
                .await?;
        }
        for step in act.result.failed() {
            if step.error_kind == Some(StepErrorKind::Cancelled) {
                continue;
            }
            if let Some(planned) = plan.steps.get(step.index) {
                session.failed_signatures.insert(planned.signature());
            }
        }
        let progress = json!({
            "iteration": iteration,
            "plan_id": plan.id,
            "succeeded": act.result.succeeded().count(),
            "failed": act.result.failed().count(),
            "skipped": act.result.skipped.len(),
        });
        self.set_state(session, record, "progress", progress).await?;
        record.execution = Some(act.result.summary());

        // Verify
        session.transition(LoopState::Verifying);
        let verification = self.verifier.verify(
            &act.result,
            &plan,
            &VerificationContext {
                task: &session.task,
                policy: self.executor.policy(),
            },
        );
        record.verification = Some(verification.clone());
        self.add_turn(
            session,
            record,
            TurnRole::Agent,
            iteration,
            describe_verdict(&verification),
        )
        .await?;
        session.last_output = Some(act.result.output.clone());
        session.last_verification = Some(verification.clone());
        session.previous = Some(Previous {
            plan_index,
            execution: act.result,
            verification: Some(verification.clone()),
        });

        self.decide(session, iteration, tier, &verification, record)
    }

    async fn load_knowledge(&self, task: &Task) -> KnowledgeCollection {
        let Some(domain) = task.domain.as_deref() else {
            return KnowledgeCollection::default();
        };
        match self.knowledge.load(domain).await {
            Ok(collection) => {
                debug!(domain, documents = collection.documents.len(), "Knowledge loaded");
                collection
            }
            Err(e) => {
                warn!(domain, error = %e, "Knowledge load failed; continuing without guidance");
                KnowledgeCollection::new(domain)
            }
        }
    }

    fn base_context(&self, task: &Task) -> String {
        let mut out = String::new();
        if !self.safety_rules.is_empty() {
            out.push_str("## Safety rules\n");
            for rule in &self.safety_rules {
                out.push_str(&format!("- {rule}\n"));
            }
        }
        out.push_str(&task.render());
        out
    }

    /// Account the safety rules and the current task revision as fixed context.
    fn refresh_base_context(&self, session: &mut Session) -> Result<(), Stop> {
        let tokens = estimate_tokens(&self.base_context(&session.task));
        session
            .budget
            .reset_to(BudgetCategory::FixedContext, tokens)
            .map(|_| ())
            .map_err(|e| exhausted(&e))
    }

    /// Binding policies of the task's domain become critical safety facts.
    async fn gather(&self, session: &mut Session, record: &mut IterationRecord) -> Result<(), Stop> {
        let facts: Vec<String> = session
            .knowledge
            .documents
            .iter()
            .filter(|d| d.is_mandatory())
            .map(|d| format!("{}: {}", d.name, d.text))
            .filter(|f| !session.memory.has_critical_content(f))
            .collect();
        for fact in facts {
            self.add_critical(session, record, CriticalKind::SafetyFact, fact)
                .await?;
        }
        Ok(())
    }

    async fn plan(&self, session: &Session, iteration: u32) -> Result<Plan, Stop> {
        let ctx = PlanningContext {
            task: &session.task,
            knowledge: &session.knowledge,
            registry: self.executor.registry(),
            memory: &session.memory,
            iteration,
        };
        let planned = match &session.previous {
            None => self.planner.create_plan(&ctx).await,
            Some(prev) => {
                let Some(previous) = session.plans.get(prev.plan_index) else {
                    return Err(Stop::Escalated(EscalationReason::PlanningFailed {
                        reason: format!("plan {} missing from the plan log", prev.plan_index),
                    }));
                };
                let adaptation = Adaptation {
                    previous,
                    previous_index: prev.plan_index,
                    execution: &prev.execution,
                    verification: prev.verification.as_ref(),
                    failed_signatures: &session.failed_signatures,
                };
                self.planner.adapt_plan(&ctx, &adaptation).await
            }
        };
        planned.map_err(|e| {
            warn!(task_id = %session.task.id, iteration, error = %e, "Planning failed");
            Stop::Escalated(EscalationReason::from(&e))
        })
    }

    /// Tier 3 and 4 plans were approved before acting, so a complete
    /// verification always ends the task.
    fn decide(
        &self,
        session: &mut Session,
        iteration: u32,
        tier: HitlTier,
        verification: &VerificationResult,
        record: &mut IterationRecord,
    ) -> Result<(), Stop> {
        if verification.complete {
            info!(
                task_id = %session.task.id,
                iteration,
                tier = tier.level(),
                confidence = verification.confidence,
                "Verification complete"
            );
            session.last_tier = Some(tier);
            if let Some(action) = record.action.as_mut() {
                action.confidence = verification.confidence;
            }
            if tier == HitlTier::Tier2 {
                self.executor.audit().log(
                    AuditEvent::AuditedRelease { tier: tier.level() },
                    &self.principal,
                    &session.task.id,
                    AuditOutcome::Success,
                    record.action.as_ref().map(|a| a.description.clone()),
                );
            }
            return Err(Stop::Complete);
        }

        if verification.should_escalate {
            let (checks, messages): (Vec<String>, Vec<String>) = verification
                .critical_failures()
                .map(|c| (c.kind.to_string(), c.message.clone()))
                .unzip();
            warn!(
                task_id = %session.task.id,
                iteration,
                checks = ?checks,
                "Critical verification failure"
            );
            return Err(Stop::Escalated(
                EscalationReason::VerificationCriticalFailure { checks, messages },
            ));
        }

        let feedback: Vec<String> = verification
            .failure_reasons()
            .into_iter()
            .map(|r| format!("{FEEDBACK_PREFIX}{r}"))
            .collect();
        debug!(task_id = %session.task.id, iteration, feedback = feedback.len(), "Iterating");
        session.task = session.task.derive(feedback);
        self.refresh_base_context(session)
    }

    /// Block on the reviewer before a tier 3/4 plan runs. `Err` ends the loop.
    async fn request_approval(
        &self,
        session: &mut Session,
        iteration: u32,
        tier: HitlTier,
        action: ProposedAction,
        record: &mut IterationRecord,
    ) -> Result<Clearance, Stop> {
        session.transition(LoopState::AwaitingApproval);
        let pending = self
            .add_critical(
                session,
                record,
                CriticalKind::PendingApproval,
                format!("Awaiting {tier} approval: {}", action.description),
            )
            .await?;

        let request = ApprovalRequest {
            task_id: session.task.id.clone(),
            iteration,
            tier,
            rationale: action.rationale.clone(),
            confidence: action.confidence,
            action,
        };
        info!(
            task_id = %session.task.id,
            iteration,
            tier = tier.level(),
            timeout_secs = self.approval_timeout.as_secs(),
            "Awaiting approval"
        );

        let started = Instant::now();
        let answer =
            match tokio::time::timeout(self.approval_timeout, self.approval.request(request)).await
            {
                Ok(answer) => answer,
                Err(_) => Err(ApprovalError::TimedOut {
                    after_secs: self.approval_timeout.as_secs(),
                }),
            };
        let waited_ms = started.elapsed().as_millis() as u64;

        if let Some(item) = session.memory.resolve_critical(&pending) {
            session
                .budget
                .release(BudgetCategory::WorkingMemory, item.tokens());
        }

        let (outcome, label) = match &answer {
            Ok(ApprovalDecision::Approved) => (AuditOutcome::Success, "approved".to_string()),
            Ok(ApprovalDecision::Denied { .. }) => (AuditOutcome::Denied, "denied".to_string()),
            Ok(ApprovalDecision::Modified { .. }) => {
                (AuditOutcome::Success, "modified".to_string())
            }
            Err(e) => (AuditOutcome::Failure, e.to_string()),
        };
        self.executor.audit().log(
            AuditEvent::ApprovalDecision {
                tier: tier.level(),
                decision: label,
            },
            &self.principal,
            &session.task.id,
            outcome,
            None,
        );
        record.approval = Some(ApprovalRecord {
            tier,
            decision: answer.as_ref().ok().cloned(),
            error: answer.as_ref().err().map(ToString::to_string),
            waited_ms,
        });

        match answer {
            Ok(ApprovalDecision::Approved) => Ok(Clearance::Approved),
            Ok(ApprovalDecision::Denied { reason }) => {
                Err(EscalationReason::ApprovalDenied { reason }.into())
            }
            Ok(ApprovalDecision::Modified { changes }) => {
                info!(task_id = %session.task.id, changes = changes.len(), "Reviewer requested changes");
                self.add_turn(
                    session,
                    record,
                    TurnRole::Reviewer,
                    iteration,
                    format!("Reviewer requested changes: {}", changes.join("; ")),
                )
                .await?;
                session.task = session.task.derive(changes);
                self.refresh_base_context(session)?;
                Ok(Clearance::Revised)
            }
            Err(e) => {
                warn!(task_id = %session.task.id, error = %e, "No approval decision");
                Err(EscalationReason::from(&e).into())
            }
        }
    }

    // ── Budgeted memory writes ──

    /// Reserve `tokens`; on over-allocation compact once and retry.
    async fn admit(
        &self,
        session: &mut Session,
        category: BudgetCategory,
        tokens: usize,
        record: &mut IterationRecord,
    ) -> Result<(), Stop> {
        match session.budget.reserve(category, tokens) {
            Ok(_) => return Ok(()),
            Err(BudgetError::OverAllocation { .. }) => {}
            Err(e) => return Err(exhausted(&e)),
        }
        self.compact(session, CompactionTrigger::OverAllocation, record)
            .await?;
        session
            .budget
            .reserve(category, tokens)
            .map(|_| ())
            .map_err(|e| exhausted(&e))
    }

    async fn compact(
        &self,
        session: &mut Session,
        trigger: CompactionTrigger,
        record: &mut IterationRecord,
    ) -> Result<(), Stop> {
        let target = session.budget.compaction_target_tokens();
        let compacted = self
            .compaction
            .compact(&session.memory, target)
            .await
            .map_err(|e| {
                warn!(session_id = %session.id, error = %e, "Compaction failed");
                Stop::Escalated(EscalationReason::from(&e))
            })?;

        let stats = compacted.stats(target);
        session.memory = compacted.memory;
        session
            .budget
            .reset_to(BudgetCategory::WorkingMemory, session.memory.memory_tokens())
            .map_err(|e| exhausted(&e))?;
        session
            .budget
            .reset_to(BudgetCategory::ToolCache, session.memory.cache_tokens())
            .map_err(|e| exhausted(&e))?;

        self.executor.audit().log(
            AuditEvent::Compaction {
                original_tokens: stats.original_tokens,
                compacted_tokens: stats.compacted_tokens,
            },
            &self.principal,
            &session.task.id,
            AuditOutcome::Success,
            Some(format!("{trigger:?}")),
        );
        record.compactions.push(CompactionRecord { trigger, stats });
        Ok(())
    }

    async fn add_turn(
        &self,
        session: &mut Session,
        record: &mut IterationRecord,
        role: TurnRole,
        iteration: u32,
        content: String,
    ) -> Result<(), Stop> {
        self.admit(
            session,
            BudgetCategory::WorkingMemory,
            estimate_turn_tokens(&content),
            record,
        )
        .await?;
        session.memory.add_turn(role, iteration, content);
        Ok(())
    }

    async fn add_critical(
        &self,
        session: &mut Session,
        record: &mut IterationRecord,
        kind: CriticalKind,
        content: String,
    ) -> Result<String, Stop> {
        self.admit(
            session,
            BudgetCategory::WorkingMemory,
            estimate_turn_tokens(&content),
            record,
        )
        .await?;
        Ok(session.memory.add_critical(kind, content))
    }

    async fn set_state(
        &self,
        session: &mut Session,
        record: &mut IterationRecord,
        key: &str,
        value: Value,
    ) -> Result<(), Stop> {
        let before = session.memory.state_tokens(key);
        let after = state_entry_tokens(key, &value);
        if after > before {
            self.admit(session, BudgetCategory::WorkingMemory, after - before, record)
                .await?;
        } else {
            session
                .budget
                .release(BudgetCategory::WorkingMemory, before - after);
        }
        session.memory.set_state(key, value);
        Ok(())
    }

    /// Store cache entries that fit; the rest are dropped with a warning.
    fn store_cache_writes(
        &self,
        session: &mut Session,
        writes: Vec<(String, steward_core::CacheEntry)>,
    ) -> Result<(), Stop> {
        if writes.is_empty() {
            return Ok(());
        }
        for (key, entry) in writes {
            let tokens = cache_entry_tokens(&entry);
            if let Err(e) = session.budget.reserve(BudgetCategory::ToolCache, tokens) {
                warn!(key = %key, error = %e, "Skipping cache write");
                continue;
            }
            session.memory.store_cache(key, entry);
        }
        // Replaced entries were counted twice above.
        session
            .budget
            .reset_to(BudgetCategory::ToolCache, session.memory.cache_tokens())
            .map(|_| ())
            .map_err(|e| exhausted(&e))
    }

    async fn account_reasoning(
        &self,
        session: &mut Session,
        plan: &Plan,
        record: &mut IterationRecord,
    ) -> Result<(), Stop> {
        let tokens = plan.estimate.tokens;
        let current = session.budget.used(BudgetCategory::Reasoning);
        if tokens <= current {
            session
                .budget
                .reset_to(BudgetCategory::Reasoning, tokens)
                .map(|_| ())
                .map_err(|e| exhausted(&e))
        } else {
            self.admit(session, BudgetCategory::Reasoning, tokens - current, record)
                .await
        }
    }

    fn append_trace(&self, session: &mut Session, record: IterationRecord) {
        for sink in &self.trace_sinks {
            if let Err(e) = sink.append(&session.id, &session.task.id, &record) {
                warn!(session_id = %session.id, error = %e, "Trace sink rejected record");
            }
        }
        session.trace.push(record);
    }

    fn finish(&self, session: Session, outcome: Outcome) -> AgentResponse {
        let (status, reason, escalation) = match outcome {
            Outcome::Stopped(Stop::Complete) => (
                ResponseStatus::Success,
                match session.last_tier {
                    Some(tier) => format!("Completed at {tier}"),
                    None => "Completed".to_string(),
                },
                None,
            ),
            Outcome::Stopped(Stop::Escalated(reason)) => {
                (ResponseStatus::Escalated, reason.to_string(), Some(reason))
            }
            Outcome::Cancelled => (ResponseStatus::Failed, "cancelled".to_string(), None),
            Outcome::MaxIterations => (
                ResponseStatus::MaxIterations,
                format!(
                    "No complete verification within {} iteration(s)",
                    self.max_iterations
                ),
                None,
            ),
        };

        let requires_approval = status == ResponseStatus::Escalated
            || session.last_tier.is_some_and(HitlTier::requires_approval);
        let iterations = session.trace.len() as u32;

        self.executor.audit().log(
            AuditEvent::TaskTerminal {
                status: status.to_string(),
            },
            &self.principal,
            &session.task.id,
            if status == ResponseStatus::Success {
                AuditOutcome::Success
            } else {
                AuditOutcome::Failure
            },
            Some(reason.clone()),
        );
        info!(
            task_id = %session.task.id,
            session_id = %session.id,
            status = %status,
            iterations,
            reason = %reason,
            "Task finished"
        );

        AgentResponse {
            task_id: session.task.id,
            session_id: session.id,
            status,
            reason,
            result: session.last_output,
            verification: session.last_verification,
            requires_approval,
            hitl_tier: session.last_tier,
            escalation,
            iterations,
            budget: session.budget.snapshot(),
            memory_summary: session.memory.summarize(),
            trace: session.trace,
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("max_iterations", &self.max_iterations)
            .field("max_parallel", &self.max_parallel)
            .field("approval_timeout", &self.approval_timeout)
            .field("trace_sinks", &self.trace_sinks.len())
            .finish()
    }
}

const TURN_PREVIEW_CHARS: usize = 600;

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn describe_step(step: &StepResult) -> String {
    if step.is_success() {
        let output = step
            .output
            .as_ref()
            .map(canonical_json)
            .unwrap_or_else(|| "null".into());
        let cached = if step.from_cache { " (cached)" } else { "" };
        format!(
            "{} step {}{cached}: {}",
            step.tool_id,
            step.index,
            clip(&output, TURN_PREVIEW_CHARS)
        )
    } else {
        format!(
            "{} step {} failed [{}]: {}",
            step.tool_id,
            step.index,
            step.error_kind
                .map(|k| k.as_str())
                .unwrap_or("ToolExecutionError"),
            step.error.as_deref().unwrap_or("unknown error")
        )
    }
}

fn describe_verdict(verification: &VerificationResult) -> String {
    let mut out = format!(
        "Verification: passed={} complete={} confidence={:.2}",
        verification.passed, verification.complete, verification.confidence
    );
    let reasons = verification.failure_reasons();
    if !reasons.is_empty() {
        out.push_str(&format!("; {}", reasons.join("; ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        Behaviour, ScriptedApproval, ScriptedTool, SilentReviewer, executor, lookup_descriptor,
    };
    use std::sync::atomic::Ordering;
    use crate::trace::InMemoryTraceSink;
    use steward_core::{
        FixedApproval, GuidanceDocument, GuidanceKind, RequirementLevel, StepStatus,
        ToolDescriptor, ToolRegistry,
    };

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.base_context.safety_rules = vec!["Stay in scope.".into()];
        config
    }

    fn vendor_lookup() -> ScriptedTool {
        ScriptedTool::ok(
            lookup_descriptor("vendor_lookup", "Look up vendor records")
                .with_capabilities(&["vendor", "lookup", "records"]),
            json!({"vendor": "Acme", "status": "active"}),
        )
    }

    fn record_publish() -> ScriptedTool {
        ScriptedTool::ok(
            lookup_descriptor("record_publish", "Publish the vendor record externally")
                .with_capabilities(&["publish", "record"])
                .with_risk_tier(HitlTier::Tier3),
            json!({"published": true}),
        )
    }

    fn registry(tools: Vec<ScriptedTool>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Box::new(tool));
        }
        registry
    }

    fn orchestrator(tools: Vec<ScriptedTool>) -> Orchestrator {
        Orchestrator::new(&config(), executor(registry(tools))).unwrap()
    }

    #[tokio::test]
    async fn low_risk_task_completes_in_one_iteration() {
        let sink = Arc::new(InMemoryTraceSink::new());
        let orch = orchestrator(vec![vendor_lookup(), record_publish()])
            .with_trace_sink(sink.clone());

        let response = orch
            .execute_task(Task::new("T-1", "Look up vendor records"))
            .await;

        assert_eq!(response.status, ResponseStatus::Success, "{}", response.reason);
        assert_eq!(response.iterations, 1);
        assert_eq!(response.hitl_tier, Some(HitlTier::Tier1));
        assert!(!response.requires_approval);
        assert!(response.verification.as_ref().unwrap().complete);
        assert_eq!(response.trace[0].decision, LoopState::Complete);
        assert_eq!(response.result.as_ref().unwrap()[0]["tool_id"], "vendor_lookup");
        assert_eq!(sink.len(), 1);

        let terminal = orch
            .executor()
            .audit()
            .entries_matching(|e| matches!(e, AuditEvent::TaskTerminal { .. }));
        assert_eq!(terminal.len(), 1);
    }

    #[tokio::test]
    async fn failed_step_is_replaced_on_the_next_iteration() {
        let primary = ScriptedTool::failing(
            lookup_descriptor("vendor_lookup", "Look up vendor records")
                .with_capabilities(&["vendor", "lookup", "records"]),
            "upstream 503",
        );
        let fallback = ScriptedTool::ok(
            lookup_descriptor("vendor_search", "Search vendor records")
                .with_capabilities(&["vendor", "search", "records"]),
            json!({"vendor": "Acme"}),
        );
        let orch = orchestrator(vec![primary, fallback]);

        let response = orch
            .execute_task(Task::new("T-2", "Look up vendor records"))
            .await;

        assert_eq!(response.status, ResponseStatus::Success, "{}", response.reason);
        assert_eq!(response.iterations, 2);
        assert_eq!(response.trace[0].decision, LoopState::Iterating);
        let second = response.trace[1].plan.as_ref().unwrap();
        assert_eq!(second.iteration, 1);
        assert_eq!(second.parent, Some(0));
        assert_eq!(second.steps[0].tool_id, "vendor_search");
        assert_eq!(response.trace[1].task_revision, 1);
    }

    #[tokio::test]
    async fn blocked_output_escalates_with_check_names() {
        let leaky = ScriptedTool::ok(
            lookup_descriptor("vendor_lookup", "Look up vendor records")
                .with_capabilities(&["vendor", "lookup", "records"]),
            json!({"note": "owner SSN 123-45-6789"}),
        );
        let response = orchestrator(vec![leaky])
            .execute_task(Task::new("T-3", "Look up vendor records"))
            .await;

        assert_eq!(response.status, ResponseStatus::Escalated);
        assert!(response.requires_approval);
        match response.escalation {
            Some(EscalationReason::VerificationCriticalFailure { checks, .. }) => {
                assert_eq!(checks, vec!["safety".to_string()]);
            }
            other => panic!("unexpected escalation {other:?}"),
        }
        assert!(response.reason.contains("safety"));
    }

    #[tokio::test]
    async fn panicking_tool_fails_its_step_and_the_loop_continues() {
        let crashing = ScriptedTool::new(
            lookup_descriptor("vendor_lookup", "Look up vendor records")
                .with_capabilities(&["vendor", "lookup", "records"]),
            Behaviour::Panic("driver crashed".into()),
        );
        let crashes = crashing.calls();
        let fallback = ScriptedTool::ok(
            lookup_descriptor("vendor_search", "Search vendor records")
                .with_capabilities(&["vendor", "search", "records"]),
            json!({"vendor": "Acme"}),
        );
        let orch = orchestrator(vec![crashing, fallback]);

        let response = orch
            .execute_task(Task::new("T-11", "Look up vendor records"))
            .await;

        assert_eq!(response.status, ResponseStatus::Success, "{}", response.reason);
        assert_eq!(crashes.load(Ordering::SeqCst), 1);
        let first = response.trace[0].execution.as_ref().unwrap();
        assert_eq!(first.steps[0].tool_id, "vendor_lookup");
        assert_eq!(first.steps[0].status, StepStatus::Failed);
        let error = first.steps[0].error.as_deref().unwrap();
        assert!(error.contains("panicked"), "{error}");
        assert!(error.contains("driver crashed"), "{error}");
        assert_eq!(response.trace[0].decision, LoopState::Iterating);
        let second = response.trace[1].plan.as_ref().unwrap();
        assert_eq!(second.steps[0].tool_id, "vendor_search");
    }

    #[tokio::test]
    async fn high_impact_plan_waits_for_approval_before_running() {
        let approval = Arc::new(ScriptedApproval::new(vec![Ok(ApprovalDecision::Approved)]));
        let publish = record_publish();
        let published = publish.calls();
        let orch = orchestrator(vec![vendor_lookup(), publish]).with_approval(approval.clone());

        let response = orch
            .execute_task(Task::new("T-4", "Publish the vendor record"))
            .await;

        assert_eq!(response.status, ResponseStatus::Success, "{}", response.reason);
        assert_eq!(response.hitl_tier, Some(HitlTier::Tier3));
        assert!(response.requires_approval);
        let requests = approval.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tier, HitlTier::Tier3);
        assert_eq!(requests[0].action.tool_ids, vec!["record_publish".to_string()]);
        let record = response.trace[0].approval.as_ref().unwrap();
        assert_eq!(record.decision, Some(ApprovalDecision::Approved));
        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert!(response.verification.as_ref().unwrap().complete);
        // The pending-approval item was resolved
        assert!(response.memory_summary.contains("0 critical items"));
    }

    #[tokio::test]
    async fn denial_escalates_without_running_the_tool() {
        let publish = record_publish();
        let published = publish.calls();
        let orch = orchestrator(vec![publish]).with_approval(Arc::new(FixedApproval(
            ApprovalDecision::Denied {
                reason: "not this quarter".into(),
            },
        )));
        let response = orch
            .execute_task(Task::new("T-5", "Publish the vendor record"))
            .await;

        assert_eq!(response.status, ResponseStatus::Escalated);
        assert_eq!(
            response.escalation,
            Some(EscalationReason::ApprovalDenied {
                reason: "not this quarter".into()
            })
        );
        assert_eq!(published.load(Ordering::SeqCst), 0);
        assert!(response.trace[0].execution.is_none());
        assert!(response.verification.is_none());
        assert_eq!(response.hitl_tier, Some(HitlTier::Tier3));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_reviewer_times_out() {
        let publish = record_publish();
        let published = publish.calls();
        let orch = orchestrator(vec![publish])
            .with_approval(Arc::new(SilentReviewer))
            .with_approval_timeout(Duration::from_secs(30));
        let response = orch
            .execute_task(Task::new("T-6", "Publish the vendor record"))
            .await;

        assert_eq!(response.status, ResponseStatus::Escalated);
        assert_eq!(published.load(Ordering::SeqCst), 0);
        assert_eq!(
            response.escalation,
            Some(EscalationReason::ApprovalTimedOut { after_secs: 30 })
        );
        let record = response.trace[0].approval.as_ref().unwrap();
        assert!(record.decision.is_none());
        assert!(record.waited_ms >= 30_000);
    }

    #[tokio::test]
    async fn no_reviewer_means_unavailable() {
        let publish = record_publish();
        let published = publish.calls();
        let response = orchestrator(vec![publish])
            .execute_task(Task::new("T-7", "Publish the vendor record"))
            .await;
        assert!(matches!(
            response.escalation,
            Some(EscalationReason::ApprovalUnavailable { .. })
        ));
        assert_eq!(published.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn modification_replans_before_anything_runs() {
        let approval = Arc::new(ScriptedApproval::new(vec![
            Ok(ApprovalDecision::Modified {
                changes: vec!["Look up vendor records too".into()],
            }),
            Ok(ApprovalDecision::Approved),
        ]));
        let lookup = vendor_lookup();
        let looked_up = lookup.calls();
        let publish = record_publish();
        let published = publish.calls();
        let orch = orchestrator(vec![lookup, publish]).with_approval(approval.clone());

        let response = orch
            .execute_task(Task::new("T-8", "Publish the vendor record"))
            .await;

        assert_eq!(response.status, ResponseStatus::Success, "{}", response.reason);
        assert_eq!(response.iterations, 2);
        assert_eq!(response.trace[0].decision, LoopState::Iterating);
        let second = response.trace[1].plan.as_ref().unwrap();
        assert_eq!(second.iteration, 1);
        assert_eq!(second.parent, Some(0));
        let tools: Vec<&str> = second.steps.iter().map(|s| s.tool_id.as_str()).collect();
        assert_eq!(tools, vec!["record_publish", "vendor_lookup"]);
        assert_eq!(response.trace[1].task_revision, 1);
        assert_eq!(approval.requests.lock().unwrap().len(), 2);

        // The modified plan never acted; the approved one ran each tool once.
        assert!(response.trace[0].execution.is_none());
        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert_eq!(looked_up.load(Ordering::SeqCst), 1);
        assert_eq!(response.hitl_tier, Some(HitlTier::Tier3));
    }

    #[tokio::test]
    async fn tier_two_plan_runs_and_is_audited_without_review() {
        let archive = ScriptedTool::ok(
            ToolDescriptor::new("record_archive", "Archive the vendor record")
                .with_capabilities(&["archive", "record"])
                .with_risk_tier(HitlTier::Tier2),
            json!({"archived": true}),
        );
        let orch = orchestrator(vec![archive]);

        let response = orch
            .execute_task(Task::new("T-12", "Archive the vendor record"))
            .await;

        assert_eq!(response.status, ResponseStatus::Success, "{}", response.reason);
        assert_eq!(response.hitl_tier, Some(HitlTier::Tier2));
        assert!(!response.requires_approval);
        assert!(response.trace[0].approval.is_none());
        let released = orch
            .executor()
            .audit()
            .entries_matching(|e| matches!(e, AuditEvent::AuditedRelease { .. }));
        assert_eq!(released.len(), 1);
    }

    #[tokio::test]
    async fn unmet_requirement_runs_out_of_iterations() {
        let orch = orchestrator(vec![vendor_lookup()]).with_max_iterations(3);
        let task = Task::new("T-9", "Vendor check")
            .with_requirement("Look up vendor records")
            .with_requirement("MUST translate into Klingon");

        let response = orch.execute_task(task).await;

        assert_eq!(response.status, ResponseStatus::MaxIterations);
        assert_eq!(response.iterations, 3);
        assert_eq!(response.trace[1].decision, LoopState::Iterating);
        assert_eq!(response.trace[2].decision, LoopState::MaxIterations);
        assert!(response.hitl_tier.is_none());
        assert!(!response.requires_approval);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let response = orchestrator(vec![vendor_lookup()])
            .execute_task_with_cancel(Task::new("T-10", "Look up vendor records"), cancel)
            .await;
        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(response.iterations, 0);
    }

    #[tokio::test]
    async fn oversized_task_exhausts_fixed_context() {
        let mut config = config();
        config.budget.total_tokens = 1_000;
        config.budget.fixed_context = 5;
        config.budget.working_memory = 500;
        config.budget.tool_cache = 100;
        config.budget.reasoning = 200;
        config.budget.output_reserve = 100;
        config.budget.dynamic_pool = 0;
        let orch = Orchestrator::new(&config, executor(registry(vec![vendor_lookup()]))).unwrap();

        let response = orch
            .execute_task(Task::new("T-11", "Look up vendor records"))
            .await;
        assert_eq!(response.status, ResponseStatus::Escalated);
        assert!(matches!(
            response.escalation,
            Some(EscalationReason::BudgetExhausted { .. })
        ));
        assert!(response.trace.is_empty());
    }

    #[tokio::test]
    async fn mandatory_policies_become_safety_facts() {
        let store = InMemoryKnowledgeStore::new().with_collection(
            KnowledgeCollection::new("procurement").with_document(
                GuidanceDocument::new(
                    "no-sole-source",
                    GuidanceKind::Policy,
                    "Never rely on a single vendor quote.",
                )
                .with_level(RequirementLevel::Must),
            ),
        );
        let orch = orchestrator(vec![vendor_lookup()]).with_knowledge(Arc::new(store));
        let mut task = Task::new("T-12", "Look up vendor records");
        task.domain = Some("procurement".into());

        let response = orch.execute_task(task).await;
        assert_eq!(response.status, ResponseStatus::Success, "{}", response.reason);
        assert!(response.memory_summary.contains("1 critical items"));
    }

    #[test]
    fn invalid_budget_is_rejected_at_setup() {
        let mut config = config();
        config.budget.total_tokens = 10;
        let err = Orchestrator::new(&config, executor(ToolRegistry::new())).unwrap_err();
        assert!(matches!(err, SetupError::Budget(_)));
    }

    #[test]
    fn invalid_tool_tier_is_rejected_at_setup() {
        let mut config = config();
        config.agent.max_tool_tier = Some(9);
        let err = Orchestrator::new(&config, executor(ToolRegistry::new())).unwrap_err();
        assert!(matches!(err, SetupError::ToolTier(9)));
    }

    #[tokio::test]
    async fn tool_tier_cap_keeps_review_tools_out_of_plans() {
        let mut config = config();
        config.agent.max_tool_tier = Some(2);
        let publish = record_publish();
        let published = publish.calls();
        let approval = Arc::new(ScriptedApproval::new(vec![Ok(ApprovalDecision::Approved)]));
        let orch = Orchestrator::new(&config, executor(registry(vec![vendor_lookup(), publish])))
            .unwrap()
            .with_approval(approval.clone())
            .with_max_iterations(1);

        let response = orch
            .execute_task(Task::new("T-13", "Publish the vendor record"))
            .await;

        assert_eq!(published.load(Ordering::SeqCst), 0);
        assert!(approval.requests.lock().unwrap().is_empty());
        assert!(
            response
                .trace
                .iter()
                .filter_map(|r| r.plan.as_ref())
                .flat_map(|p| &p.steps)
                .all(|s| s.tool_id != "record_publish")
        );
    }
}
