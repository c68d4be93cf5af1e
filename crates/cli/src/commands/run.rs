//! `steward run`: Run one task file through the loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use steward_agent::{JsonLinesTraceSink, Orchestrator, ResponseStatus};
use steward_config::AppConfig;
use steward_core::{ApprovalDecision, ApprovalGateway, FixedApproval, KnowledgeStore, Task};
use steward_security::{AccessPolicy, AuditLogger, ConsentRegistry, TracingSink};
use steward_tools::{DirectoryKnowledgeStore, ToolExecutor, default_registry};

use super::approval::StdinApproval;

pub struct RunOptions {
    pub task: PathBuf,
    pub auto_approve: bool,
    pub deny_all: bool,
    pub trace: Option<PathBuf>,
    pub max_iterations: Option<u32>,
}

/// Run the task and report how it ended; the caller maps that to an exit code.
pub async fn run(options: RunOptions) -> Result<ResponseStatus, Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let task = load_task(&options.task)?;

    let knowledge: Arc<dyn KnowledgeStore> =
        Arc::new(DirectoryKnowledgeStore::new(config.knowledge_dir()));
    let executor = Arc::new(ToolExecutor::new(
        Arc::new(default_registry(knowledge.clone())),
        AccessPolicy::from_config(&config.security),
        Arc::new(ConsentRegistry::from_config(&config.security)),
        Arc::new(AuditLogger::with_sinks(vec![Box::new(TracingSink)])),
    ));

    let approval: Arc<dyn ApprovalGateway> = if options.auto_approve {
        Arc::new(FixedApproval(ApprovalDecision::Approved))
    } else if options.deny_all {
        Arc::new(FixedApproval(ApprovalDecision::Denied {
            reason: "denied by --deny-all".into(),
        }))
    } else {
        Arc::new(StdinApproval::new())
    };

    let mut orchestrator = Orchestrator::new(&config, executor)?
        .with_knowledge(knowledge)
        .with_approval(approval);
    if let Some(max) = options.max_iterations {
        orchestrator = orchestrator.with_max_iterations(max.max(1));
    }
    if let Some(path) = &options.trace {
        orchestrator = orchestrator.with_trace_sink(Arc::new(JsonLinesTraceSink::open(path)?));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping after the current iteration");
            on_signal.cancel();
        }
    });

    let response = orchestrator.execute_task_with_cancel(task, cancel).await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if response.status != ResponseStatus::Success {
        eprintln!("  {}: {}", response.status, response.reason);
    }
    Ok(response.status)
}

/// Process exit code for a finished task. 2 is left to usage errors.
pub fn exit_code(status: ResponseStatus) -> u8 {
    match status {
        ResponseStatus::Success => 0,
        ResponseStatus::Failed => 1,
        ResponseStatus::Escalated => 3,
        ResponseStatus::MaxIterations => 4,
    }
}

/// Read a task from `.toml`, or JSON for any other extension.
pub fn load_task(path: &Path) -> Result<Task, Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let task: Task = if is_toml {
        toml::from_str(&source).map_err(|e| format!("Invalid task {}: {e}", path.display()))?
    } else {
        serde_json::from_str(&source)
            .map_err(|e| format!("Invalid task {}: {e}", path.display()))?
    };
    if task.id.trim().is_empty() {
        return Err(format!("Task in {} has an empty id", path.display()).into());
    }
    Ok(task)
}
