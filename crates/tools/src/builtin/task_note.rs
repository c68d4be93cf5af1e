//! Task note tool — records a note or draft against the current task.
//!
//! Notes are kept in an in-process notebook shared by clones of the handle
//! returned from [`TaskNoteTool::notebook`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};

use steward_core::{
    DataSensitivity, ExecutionContext, HitlTier, Reversibility, Tool, ToolDescriptor, ToolError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNote {
    pub id: String,
    pub task_id: String,
    pub iteration: u32,
    pub title: Option<String>,
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

pub struct TaskNoteTool {
    descriptor: ToolDescriptor,
    notebook: Arc<Mutex<Vec<TaskNote>>>,
}

impl TaskNoteTool {
    pub fn new() -> Self {
        let descriptor = ToolDescriptor::new(
            "task_note",
            "Record a note, summary or draft for the task",
        )
        .with_capabilities(&["note", "record", "summary", "draft", "document", "write"])
        .with_parameter_schema(json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Content of the note"
                },
                "title": {
                    "type": "string",
                    "description": "Optional heading"
                }
            },
            "required": ["text"]
        }))
        .with_output_schema(json!({
            "type": "object",
            "properties": {
                "note_id": { "type": "string" },
                "recorded": { "type": "boolean" }
            },
            "required": ["note_id", "recorded"]
        }))
        .with_risk_tier(HitlTier::Tier2)
        .with_reversibility(Reversibility::Full)
        .with_sensitivity(DataSensitivity::Internal)
        .with_timeout_ms(2_000);
        Self {
            descriptor,
            notebook: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the recorded notes.
    pub fn notebook(&self) -> Arc<Mutex<Vec<TaskNote>>> {
        Arc::clone(&self.notebook)
    }
}

impl Default for TaskNoteTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for TaskNoteTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(
        &self,
        parameters: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ToolError> {
        let text = parameters["text"]
            .as_str()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidParameters {
                tool_id: self.descriptor.id.clone(),
                reason: "'text' must be a non-empty string".into(),
            })?;

        let note = TaskNote {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: ctx.task_id.clone(),
            iteration: ctx.iteration,
            title: parameters["title"].as_str().map(str::to_string),
            text: text.to_string(),
            recorded_at: Utc::now(),
        };
        let note_id = note.id.clone();

        self.notebook
            .lock()
            .map_err(|_| ToolError::ExecutionFailed {
                tool_id: self.descriptor.id.clone(),
                reason: "notebook lock poisoned".into(),
            })?
            .push(note);

        Ok(json!({
            "note_id": note_id,
            "task_id": ctx.task_id,
            "recorded": true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_note_for_task() {
        let tool = TaskNoteTool::new();
        let notebook = tool.notebook();
        let ctx = ExecutionContext::new("s", "T-7", "steward").at_iteration(2);

        let out = tool
            .execute(json!({"text": "Vendor A is cheaper", "title": "Finding"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["recorded"], true);
        assert!(tool.verify_result(&out).is_ok());

        let notes = notebook.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].task_id, "T-7");
        assert_eq!(notes[0].iteration, 2);
        assert_eq!(notes[0].title.as_deref(), Some("Finding"));
    }

    #[test]
    fn empty_text_fails_validation() {
        let tool = TaskNoteTool::new();
        assert!(tool.validate_parameters(&json!({"text": ""})).is_err());
        assert!(tool.validate_parameters(&json!({})).is_err());
    }

    #[test]
    fn descriptor_is_side_effecting() {
        let tool = TaskNoteTool::new();
        assert!(!tool.descriptor().read_only);
        assert!(!tool.descriptor().cacheable);
        assert_eq!(tool.descriptor().risk_tier, HitlTier::Tier2);
    }
}
