//! Tool boundary for Steward.
//!
//! The [`ToolExecutor`] runs a single plan step with validation,
//! authorization, consent, caching, a timeout and result verification.
//! The built-in tools search domain guidance and record task notes; real
//! deployments register their own tools alongside them.

pub mod builtin;
pub mod executor;
pub mod knowledge_dir;

use std::sync::Arc;

use steward_core::{KnowledgeStore, ToolRegistry};

pub use builtin::{KnowledgeSearchTool, TaskNote, TaskNoteTool};
pub use executor::{ToolExecutor, ToolOutcome};
pub use knowledge_dir::DirectoryKnowledgeStore;

/// Create a default tool registry with all built-in tools.
pub fn default_registry(knowledge: Arc<dyn KnowledgeStore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(KnowledgeSearchTool::new(knowledge)));
    registry.register(Box::new(TaskNoteTool::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::{HitlTier, InMemoryKnowledgeStore};

    #[test]
    fn default_registry_has_builtins() {
        let registry = default_registry(Arc::new(InMemoryKnowledgeStore::new()));
        assert_eq!(registry.ids(), vec!["knowledge_search", "task_note"]);
        assert_eq!(registry.search(None, Some(HitlTier::Tier1)).len(), 1);
    }
}
