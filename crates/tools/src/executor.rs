//! Tool executor — runs one plan step through the tool boundary.
//!
//! Order of operations for a call:
//! 1. Descriptor lookup
//! 2. Parameter validation (before any side effect)
//! 3. Authorization against the access policy (deny by default)
//! 4. Risk tier against the context's cleared tier
//! 5. Consent, when the descriptor requires it
//! 6. Cache lookup for cacheable tools
//! 7. Execution bounded by the descriptor's timeout
//! 8. Result verification against the output schema
//!
//! Every failure, including a panic inside the tool, becomes a failed
//! [`StepResult`]. The executor never writes the session cache itself: a
//! successful cacheable call hands back the entry for the owner to store.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use steward_core::{
    CacheEntry, ExecutionContext, PlanStep, StepResult, ToolCache, ToolError, ToolRegistry,
    cache_key,
};
use steward_security::{AccessPolicy, AuditEvent, AuditLogger, AuditOutcome, ConsentProvider};

/// The result of one step plus the cache entry it produced, if any.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub result: StepResult,
    pub cache_write: Option<(String, CacheEntry)>,
}

struct Completed {
    output: serde_json::Value,
    from_cache: bool,
    cache_write: Option<(String, CacheEntry)>,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    policy: AccessPolicy,
    consent: Arc<dyn ConsentProvider>,
    audit: Arc<AuditLogger>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: AccessPolicy,
        consent: Arc<dyn ConsentProvider>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            registry,
            policy,
            consent,
            audit,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Execute step `index` of a plan against a read-only cache snapshot.
    pub async fn execute_step(
        &self,
        index: usize,
        step: &PlanStep,
        ctx: &ExecutionContext,
        cache: &ToolCache,
    ) -> ToolOutcome {
        let started = Instant::now();
        let outcome = self.run(step, ctx, cache).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(done) => {
                debug!(
                    tool = %step.tool_id,
                    step = index,
                    duration_ms,
                    from_cache = done.from_cache,
                    "Tool call succeeded"
                );
                self.audit.log(
                    AuditEvent::ToolExecution {
                        tool_id: step.tool_id.clone(),
                    },
                    &ctx.principal,
                    &ctx.task_id,
                    AuditOutcome::Success,
                    done.from_cache.then(|| "served from cache".to_string()),
                );
                let mut result = StepResult::success(index, &step.tool_id, done.output, duration_ms);
                if done.from_cache {
                    result = result.cached();
                }
                ToolOutcome {
                    result,
                    cache_write: done.cache_write,
                }
            }
            Err(err) => {
                warn!(tool = %step.tool_id, step = index, error = %err, "Tool call failed");
                if !err.is_refusal() {
                    self.audit.log(
                        AuditEvent::ToolExecution {
                            tool_id: step.tool_id.clone(),
                        },
                        &ctx.principal,
                        &ctx.task_id,
                        AuditOutcome::Failure,
                        Some(err.to_string()),
                    );
                }
                ToolOutcome {
                    result: StepResult::failure(index, &step.tool_id, &err, duration_ms),
                    cache_write: None,
                }
            }
        }
    }

    async fn run(
        &self,
        step: &PlanStep,
        ctx: &ExecutionContext,
        cache: &ToolCache,
    ) -> Result<Completed, ToolError> {
        let tool = self
            .registry
            .get(&step.tool_id)
            .ok_or_else(|| ToolError::NotFound(step.tool_id.clone()))?;
        let descriptor = tool.descriptor();

        tool.validate_parameters(&step.parameters)?;

        if let Err(err) = self.policy.authorize(&ctx.principal, &step.tool_id) {
            self.audit.log(
                AuditEvent::AuthorizationDenied {
                    tool_id: step.tool_id.clone(),
                },
                &ctx.principal,
                &ctx.task_id,
                AuditOutcome::Denied,
                None,
            );
            return Err(err);
        }

        if !ctx.clears(descriptor.risk_tier) {
            let cleared = ctx.max_tier.map_or(0, |t| t.level());
            self.audit.log(
                AuditEvent::AuthorizationDenied {
                    tool_id: step.tool_id.clone(),
                },
                &ctx.principal,
                &ctx.task_id,
                AuditOutcome::Denied,
                Some(format!("risk tier above cleared tier {cleared}")),
            );
            return Err(ToolError::AboveClearedTier {
                tool_id: step.tool_id.clone(),
                risk_tier: descriptor.risk_tier.level(),
                cleared,
            });
        }

        if descriptor.requires_consent
            && !self.consent.has_consent(&ctx.principal, &step.tool_id).await
        {
            self.audit.log(
                AuditEvent::ConsentDenied {
                    tool_id: step.tool_id.clone(),
                },
                &ctx.principal,
                &ctx.task_id,
                AuditOutcome::Denied,
                None,
            );
            return Err(ToolError::ConsentDenied {
                tool_id: step.tool_id.clone(),
            });
        }

        let key = descriptor
            .cacheable
            .then(|| cache_key(&step.tool_id, &step.parameters));
        if let Some(hit) = key.as_deref().and_then(|k| cache.get(k, Utc::now())) {
            return Ok(Completed {
                output: hit.output.clone(),
                from_cache: true,
                cache_write: None,
            });
        }

        let call = AssertUnwindSafe(tool.execute(step.parameters.clone(), ctx)).catch_unwind();
        let output = match tokio::time::timeout(Duration::from_millis(descriptor.timeout_ms), call)
            .await
        {
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool_id: step.tool_id.clone(),
                    timeout_ms: descriptor.timeout_ms,
                });
            }
            Ok(Err(payload)) => {
                return Err(ToolError::Panicked {
                    tool_id: step.tool_id.clone(),
                    message: panic_message(payload.as_ref()),
                });
            }
            Ok(Ok(result)) => result?,
        };

        tool.verify_result(&output)?;

        let cache_write = key.map(|k| {
            (
                k,
                CacheEntry {
                    tool_id: step.tool_id.clone(),
                    output: output.clone(),
                    stored_at: Utc::now(),
                    ttl_ms: descriptor.cache_ttl_ms,
                },
            )
        });

        Ok(Completed {
            output,
            from_cache: false,
            cache_write,
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("registry", &self.registry)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use steward_core::{HitlTier, StepErrorKind, Tool, ToolDescriptor};
    use steward_security::ConsentRegistry;

    struct CountingTool {
        descriptor: ToolDescriptor,
        calls: Arc<AtomicUsize>,
        behavior: Behavior,
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Echo,
        Sleep(u64),
        Panic,
        BadOutput,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn descriptor(&self) -> &ToolDescriptor {
            &self.descriptor
        }

        async fn execute(
            &self,
            parameters: serde_json::Value,
            _ctx: &ExecutionContext,
        ) -> Result<serde_json::Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Echo => Ok(json!({ "echo": parameters })),
                Behavior::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!({ "echo": parameters }))
                }
                Behavior::Panic => panic!("tool blew up"),
                Behavior::BadOutput => Ok(json!({ "unexpected": true })),
            }
        }
    }

    fn tool(id: &str, behavior: Behavior, calls: Arc<AtomicUsize>) -> CountingTool {
        CountingTool {
            descriptor: ToolDescriptor::new(id, "test tool")
                .with_parameter_schema(json!({
                    "type": "object",
                    "properties": { "q": { "type": "string" } },
                    "required": ["q"]
                }))
                .with_output_schema(json!({ "type": "object", "required": ["echo"] }))
                .with_timeout_ms(100),
            calls,
            behavior,
        }
    }

    fn executor_with(
        tools: Vec<CountingTool>,
        policy: AccessPolicy,
        consent: ConsentRegistry,
    ) -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        for t in tools {
            registry.register(Box::new(t));
        }
        ToolExecutor::new(
            Arc::new(registry),
            policy,
            Arc::new(consent),
            Arc::new(AuditLogger::new()),
        )
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("session", "T-1", "steward")
    }

    fn step(tool_id: &str) -> PlanStep {
        PlanStep::new(tool_id, json!({ "q": "hello" }))
    }

    #[tokio::test]
    async fn successful_call_is_audited() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor_with(
            vec![tool("echo", Behavior::Echo, calls.clone())],
            AccessPolicy::allow_all(),
            ConsentRegistry::new(),
        );
        let out = exec
            .execute_step(0, &step("echo"), &ctx(), &ToolCache::new())
            .await;
        assert!(out.result.is_success());
        assert_eq!(out.result.output.unwrap()["echo"]["q"], "hello");
        assert!(out.cache_write.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.audit().count(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_fails_step() {
        let exec = executor_with(vec![], AccessPolicy::allow_all(), ConsentRegistry::new());
        let out = exec
            .execute_step(0, &step("ghost"), &ctx(), &ToolCache::new())
            .await;
        assert_eq!(out.result.error_kind, Some(StepErrorKind::ToolNotFound));
    }

    #[tokio::test]
    async fn invalid_parameters_rejected_before_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor_with(
            vec![tool("echo", Behavior::Echo, calls.clone())],
            AccessPolicy::allow_all(),
            ConsentRegistry::new(),
        );
        let bad = PlanStep::new("echo", json!({ "q": 5 }));
        let out = exec.execute_step(0, &bad, &ctx(), &ToolCache::new()).await;
        assert_eq!(out.result.error_kind, Some(StepErrorKind::InvalidParameters));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deny_by_default_refuses_without_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor_with(
            vec![tool("echo", Behavior::Echo, calls.clone())],
            AccessPolicy::default(),
            ConsentRegistry::new(),
        );
        let out = exec
            .execute_step(0, &step("echo"), &ctx(), &ToolCache::new())
            .await;
        assert_eq!(out.result.error_kind, Some(StepErrorKind::Unauthorized));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let denied = exec.audit().entries_with(AuditOutcome::Denied);
        assert_eq!(denied.len(), 1);
    }

    #[tokio::test]
    async fn consent_required_and_missing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut t = tool("publish", Behavior::Echo, calls.clone());
        t.descriptor.requires_consent = true;
        let exec = executor_with(vec![t], AccessPolicy::allow_all(), ConsentRegistry::new());
        let out = exec
            .execute_step(0, &step("publish"), &ctx(), &ToolCache::new())
            .await;
        assert_eq!(out.result.error_kind, Some(StepErrorKind::ConsentDenied));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn risk_tier_above_clearance_is_refused() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut t = tool("publish", Behavior::Echo, calls.clone());
        t.descriptor.risk_tier = HitlTier::Tier3;
        let exec = executor_with(vec![t], AccessPolicy::allow_all(), ConsentRegistry::new());

        let refused = exec
            .execute_step(
                0,
                &step("publish"),
                &ctx().with_max_tier(HitlTier::Tier2),
                &ToolCache::new(),
            )
            .await;
        assert_eq!(refused.result.error_kind, Some(StepErrorKind::Unauthorized));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let denied = exec.audit().entries_with(AuditOutcome::Denied);
        assert_eq!(denied.len(), 1);
        assert!(denied[0].details.as_deref().unwrap().contains("cleared tier 2"));

        let cleared = exec
            .execute_step(
                0,
                &step("publish"),
                &ctx().with_max_tier(HitlTier::Tier4),
                &ToolCache::new(),
            )
            .await;
        assert!(cleared.result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn consent_granted_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut t = tool("publish", Behavior::Echo, calls.clone());
        t.descriptor.requires_consent = true;
        let consent = ConsentRegistry::new();
        consent.grant("publish");
        let exec = executor_with(vec![t], AccessPolicy::allow_all(), consent);
        let out = exec
            .execute_step(0, &step("publish"), &ctx(), &ToolCache::new())
            .await;
        assert!(out.result.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_failed_step() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor_with(
            vec![tool("slow", Behavior::Sleep(5_000), calls)],
            AccessPolicy::allow_all(),
            ConsentRegistry::new(),
        );
        let out = exec
            .execute_step(2, &step("slow"), &ctx(), &ToolCache::new())
            .await;
        assert_eq!(out.result.index, 2);
        assert_eq!(out.result.error_kind, Some(StepErrorKind::ToolTimeout));
        assert!(out.result.error.unwrap().starts_with("ToolTimeoutError"));
    }

    #[tokio::test]
    async fn panic_is_caught() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor_with(
            vec![tool("boom", Behavior::Panic, calls)],
            AccessPolicy::allow_all(),
            ConsentRegistry::new(),
        );
        let out = exec
            .execute_step(0, &step("boom"), &ctx(), &ToolCache::new())
            .await;
        assert_eq!(out.result.error_kind, Some(StepErrorKind::ToolExecution));
        assert!(out.result.error.unwrap().contains("tool blew up"));
    }

    #[tokio::test]
    async fn output_violating_schema_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor_with(
            vec![tool("odd", Behavior::BadOutput, calls)],
            AccessPolicy::allow_all(),
            ConsentRegistry::new(),
        );
        let out = exec
            .execute_step(0, &step("odd"), &ctx(), &ToolCache::new())
            .await;
        assert_eq!(out.result.error_kind, Some(StepErrorKind::OutputRejected));
    }

    #[tokio::test]
    async fn cacheable_call_returns_entry_then_hits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut t = tool("lookup", Behavior::Echo, calls.clone());
        t.descriptor = t.descriptor.clone().with_cache_ttl_ms(60_000);
        let exec = executor_with(vec![t], AccessPolicy::allow_all(), ConsentRegistry::new());

        let mut cache = ToolCache::new();
        let first = exec.execute_step(0, &step("lookup"), &ctx(), &cache).await;
        let (key, entry) = first.cache_write.expect("cacheable result");
        assert_eq!(key, cache_key("lookup", &json!({ "q": "hello" })));
        cache.insert(key, entry);

        let second = exec.execute_step(0, &step("lookup"), &ctx(), &cache).await;
        assert!(second.result.from_cache);
        assert!(second.cache_write.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
