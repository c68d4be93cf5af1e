//! Access policy — which tools the loop's principal may run.
//!
//! Deny by default: an empty allowlist permits nothing. `"*"` allows every
//! tool, and an entry ending in `*` matches by prefix. The denylist always
//! wins over the allowlist.

use steward_config::SecurityConfig;
use steward_core::ToolError;

/// Result of checking a tool against the policy.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessDecision {
    Allowed,
    Denied { tool_id: String, reason: String },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed: Vec<String>,
    denied: Vec<String>,
}

impl AccessPolicy {
    pub fn new(allowed: Vec<String>, denied: Vec<String>) -> Self {
        Self { allowed, denied }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(config.allowed_tools.clone(), config.denied_tools.clone())
    }

    pub fn allow_all() -> Self {
        Self::new(vec!["*".into()], vec![])
    }

    pub fn deny(mut self, tool_id: impl Into<String>) -> Self {
        self.denied.push(tool_id.into());
        self
    }

    /// Check if a tool is allowed.
    ///
    /// Rules:
    /// - If the tool matches `denied` → deny
    /// - If `allowed` is empty → deny all (secure by default)
    /// - Otherwise the tool must match an `allowed` entry
    pub fn check_tool(&self, tool_id: &str) -> AccessDecision {
        if self.denied.iter().any(|p| matches_pattern(p, tool_id)) {
            return AccessDecision::Denied {
                tool_id: tool_id.into(),
                reason: "Tool is on the denylist".into(),
            };
        }

        if self.allowed.is_empty() {
            return AccessDecision::Denied {
                tool_id: tool_id.into(),
                reason: "No tools configured (deny by default)".into(),
            };
        }

        if self.allowed.iter().any(|p| matches_pattern(p, tool_id)) {
            AccessDecision::Allowed
        } else {
            AccessDecision::Denied {
                tool_id: tool_id.into(),
                reason: format!(
                    "Tool '{}' not in allowlist ({} entries configured)",
                    tool_id,
                    self.allowed.len()
                ),
            }
        }
    }

    /// Authorize `principal` to run `tool_id`, as a tool error on refusal.
    pub fn authorize(&self, principal: &str, tool_id: &str) -> Result<(), ToolError> {
        match self.check_tool(tool_id) {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Denied { reason, .. } => {
                tracing::warn!(principal, tool = tool_id, %reason, "Tool call refused");
                Err(ToolError::Unauthorized {
                    tool_id: tool_id.into(),
                    principal: principal.into(),
                })
            }
        }
    }

    /// Whether the tool is explicitly denied, independent of the allowlist.
    pub fn is_denied(&self, tool_id: &str) -> bool {
        self.denied.iter().any(|p| matches_pattern(p, tool_id))
    }
}

fn matches_pattern(pattern: &str, tool_id: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => tool_id.starts_with(prefix),
        None => pattern == tool_id,
    }
}
