//! Consent — grants required before running tools flagged `requires_consent`.
//!
//! Nothing is granted by default.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::RwLock;

use steward_config::SecurityConfig;

/// Answers whether a principal has consented to a tool running.
#[async_trait]
pub trait ConsentProvider: Send + Sync {
    async fn has_consent(&self, principal: &str, tool_id: &str) -> bool;
}

/// Grants held in process, keyed by tool id.
#[derive(Debug, Default)]
pub struct ConsentRegistry {
    grants: RwLock<HashSet<String>>,
}

impl ConsentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        let registry = Self::new();
        for tool_id in &config.granted_consents {
            registry.grant(tool_id);
        }
        registry
    }

    pub fn grant(&self, tool_id: &str) {
        self.grants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tool_id.to_string());
    }

    pub fn revoke(&self, tool_id: &str) -> bool {
        self.grants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tool_id)
    }

    pub fn is_granted(&self, tool_id: &str) -> bool {
        self.grants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(tool_id)
    }

    pub fn count(&self) -> usize {
        self.grants.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl ConsentProvider for ConsentRegistry {
    async fn has_consent(&self, _principal: &str, tool_id: &str) -> bool {
        self.is_granted(tool_id)
    }
}
