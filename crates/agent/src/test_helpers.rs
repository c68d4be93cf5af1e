//! Shared test doubles for the loop's collaborators.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use steward_core::{
    ApprovalDecision, ApprovalError, ApprovalGateway, ApprovalRequest, ExecutionContext, Tool,
    ToolDescriptor, ToolError, ToolRegistry,
};
use steward_security::{AccessPolicy, AuditLogger, ConsentRegistry};
use steward_tools::ToolExecutor;

/// What a scripted tool does on one call.
#[derive(Debug, Clone)]
pub enum Behaviour {
    Ok(Value),
    Fail(String),
    /// Sleep, then succeed. Combine with paused time for timeout tests.
    Sleep(Duration, Value),
    Panic(String),
}

/// A tool that behaves the same way on every call and counts its calls.
pub struct ScriptedTool {
    descriptor: ToolDescriptor,
    behaviour: Behaviour,
    calls: Arc<AtomicUsize>,
}

impl ScriptedTool {
    pub fn new(descriptor: ToolDescriptor, behaviour: Behaviour) -> Self {
        Self {
            descriptor,
            behaviour,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ok(descriptor: ToolDescriptor, output: Value) -> Self {
        Self::new(descriptor, Behaviour::Ok(output))
    }

    pub fn failing(descriptor: ToolDescriptor, reason: &str) -> Self {
        Self::new(descriptor, Behaviour::Fail(reason.into()))
    }

    /// Shared call counter; stays valid after the tool moves into a registry.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, _parameters: Value, _ctx: &ExecutionContext) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour.clone() {
            Behaviour::Ok(v) => Ok(v),
            Behaviour::Fail(reason) => Err(ToolError::ExecutionFailed {
                tool_id: self.descriptor.id.clone(),
                reason,
            }),
            Behaviour::Sleep(d, v) => {
                tokio::time::sleep(d).await;
                Ok(v)
            }
            Behaviour::Panic(msg) => panic!("{msg}"),
        }
    }
}

/// A reviewer answering from a queue; records every request it sees.
pub struct ScriptedApproval {
    answers: Mutex<VecDeque<Result<ApprovalDecision, ApprovalError>>>,
    pub requests: Arc<Mutex<Vec<ApprovalRequest>>>,
}

impl ScriptedApproval {
    pub fn new(answers: Vec<Result<ApprovalDecision, ApprovalError>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl ApprovalGateway for ScriptedApproval {
    async fn request(&self, request: ApprovalRequest) -> Result<ApprovalDecision, ApprovalError> {
        self.requests.lock().unwrap().push(request);
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApprovalError::Unavailable("script exhausted".into())))
    }
}

/// A reviewer who never answers.
pub struct SilentReviewer;

#[async_trait]
impl ApprovalGateway for SilentReviewer {
    async fn request(&self, _request: ApprovalRequest) -> Result<ApprovalDecision, ApprovalError> {
        std::future::pending().await
    }
}

/// Executor allowing every tool, with nothing consented.
pub fn executor(registry: ToolRegistry) -> Arc<ToolExecutor> {
    Arc::new(ToolExecutor::new(
        Arc::new(registry),
        AccessPolicy::allow_all(),
        Arc::new(ConsentRegistry::new()),
        Arc::new(AuditLogger::new()),
    ))
}

/// A read-only tier-1 descriptor whose only parameter is a free-text query.
pub fn lookup_descriptor(id: &str, description: &str) -> ToolDescriptor {
    ToolDescriptor::new(id, description)
        .with_parameter_schema(serde_json::json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        }))
        .with_risk_tier(steward_core::HitlTier::Tier1)
        .read_only()
}
