//! Built-in tools shipped with Steward.

pub mod knowledge_search;
pub mod task_note;

pub use knowledge_search::KnowledgeSearchTool;
pub use task_note::{TaskNote, TaskNoteTool};
