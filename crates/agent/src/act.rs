//! The Act phase: run a plan's steps through the tool executor.
//!
//! Consecutive parallel-safe steps form a batch that runs concurrently, at
//! most `max_parallel` at a time. Everything else runs one step at a time in
//! plan order. A failing critical step aborts the rest of the plan: batch
//! siblings already in flight are reported as cancelled, steps never started
//! are reported as skipped.

use chrono::Utc;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use steward_core::{
    CacheEntry, ExecutionContext, ExecutionResult, Plan, StepResult, ToolCache, ToolError,
};
use steward_tools::ToolExecutor;

/// What one Act phase produced.
#[derive(Debug, Clone)]
pub struct ActOutcome {
    pub result: ExecutionResult,
    /// Entries for the session cache, in completion order.
    pub cache_writes: Vec<(String, CacheEntry)>,
}

#[derive(Default)]
struct Collected {
    steps: Vec<StepResult>,
    skipped: Vec<usize>,
    cache_writes: Vec<(String, CacheEntry)>,
}

pub async fn run_plan(
    executor: &ToolExecutor,
    plan: &Plan,
    ctx: &ExecutionContext,
    cache: &ToolCache,
    max_parallel: usize,
) -> ActOutcome {
    let mut collected = Collected::default();
    let mut aborted_by = None;
    let mut next = 0;

    while next < plan.steps.len() {
        let end = if plan.steps[next].parallel_safe {
            next + plan.steps[next..]
                .iter()
                .take_while(|s| s.parallel_safe)
                .count()
        } else {
            next + 1
        };

        if ctx.deadline.is_some_and(|d| d <= Utc::now()) {
            warn!(task_id = %ctx.task_id, step = next, "Deadline passed; skipping remaining steps");
            collected.skipped.extend(next..plan.steps.len());
            break;
        }

        if let Some(index) =
            run_batch(executor, plan, next..end, ctx, cache, max_parallel, &mut collected).await
        {
            info!(
                task_id = %ctx.task_id,
                step = index,
                tool = %plan.steps[index].tool_id,
                "Critical step failed; aborting plan"
            );
            collected.skipped.extend(end..plan.steps.len());
            aborted_by = Some(index);
            break;
        }
        next = end;
    }

    ActOutcome {
        result: ExecutionResult::from_steps(
            &plan.id,
            collected.steps,
            collected.skipped,
            aborted_by,
        ),
        cache_writes: collected.cache_writes,
    }
}

/// Run `batch` concurrently. Returns the index of a failed critical step.
async fn run_batch(
    executor: &ToolExecutor,
    plan: &Plan,
    batch: Range<usize>,
    ctx: &ExecutionContext,
    cache: &ToolCache,
    max_parallel: usize,
    collected: &mut Collected,
) -> Option<usize> {
    if batch.len() > 1 {
        debug!(from = batch.start, to = batch.end, "Running parallel batch");
    }
    let started: Vec<AtomicBool> = batch.clone().map(|_| AtomicBool::new(false)).collect();
    let mut finished = BTreeSet::new();
    let mut abort = None;

    {
        let mut calls = futures::stream::iter(batch.clone())
            .map(|index| {
                let flag = &started[index - batch.start];
                let step = &plan.steps[index];
                async move {
                    flag.store(true, Ordering::SeqCst);
                    (index, executor.execute_step(index, step, ctx, cache).await)
                }
            })
            .buffer_unordered(max_parallel.max(1));

        while let Some((index, outcome)) = calls.next().await {
            finished.insert(index);
            let critical_failure = plan.steps[index].critical && !outcome.result.is_success();
            collected.steps.push(outcome.result);
            collected.cache_writes.extend(outcome.cache_write);
            if critical_failure {
                abort = Some(index);
                break;
            }
        }
        // Dropping the stream cancels siblings still in flight.
    }

    if abort.is_some() {
        for index in batch.clone().filter(|i| !finished.contains(i)) {
            if started[index - batch.start].load(Ordering::SeqCst) {
                let tool_id = plan.steps[index].tool_id.clone();
                collected.steps.push(StepResult::failure(
                    index,
                    &tool_id,
                    &ToolError::Cancelled { tool_id: tool_id.clone() },
                    0,
                ));
            } else {
                collected.skipped.push(index);
            }
        }
    }
    abort
}
