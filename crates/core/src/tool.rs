//! Tool trait — the abstraction over the loop's capabilities.
//!
//! A tool exposes three capabilities: validate its parameters, execute, and
//! verify its own output. Tools are registered in the [`ToolRegistry`] by
//! identifier and dispatched through the trait, never by type inspection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::context::ExecutionContext;
use crate::error::ToolError;
use crate::hitl::{DataSensitivity, HitlTier, Reversibility};
use crate::schema;

/// Registry entry describing a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,

    /// Where the collaborator implementing this tool lives.
    #[serde(default)]
    pub endpoint_ref: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default = "empty_schema")]
    pub parameter_schema: serde_json::Value,

    #[serde(default = "empty_schema")]
    pub output_schema: serde_json::Value,

    #[serde(default = "default_risk_tier")]
    pub risk_tier: HitlTier,

    #[serde(default)]
    pub requires_consent: bool,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub cacheable: bool,

    #[serde(default)]
    pub cache_ttl_ms: u64,

    /// No side effects; steps using it may run in parallel.
    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub reversibility: Reversibility,

    #[serde(default)]
    pub sensitivity: DataSensitivity,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({})
}
fn default_risk_tier() -> HitlTier {
    HitlTier::Tier2
}
fn default_timeout_ms() -> u64 {
    30_000
}

impl ToolDescriptor {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint_ref: String::new(),
            description: description.into(),
            capabilities: Vec::new(),
            parameter_schema: empty_schema(),
            output_schema: empty_schema(),
            risk_tier: default_risk_tier(),
            requires_consent: false,
            timeout_ms: default_timeout_ms(),
            cacheable: false,
            cache_ttl_ms: 0,
            read_only: false,
            reversibility: Reversibility::Full,
            sensitivity: DataSensitivity::Public,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_parameter_schema(mut self, schema: serde_json::Value) -> Self {
        self.parameter_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_risk_tier(mut self, tier: HitlTier) -> Self {
        self.risk_tier = tier;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_cache_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.cacheable = true;
        self.cache_ttl_ms = ttl_ms;
        self
    }

    pub fn requiring_consent(mut self) -> Self {
        self.requires_consent = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_reversibility(mut self, reversibility: Reversibility) -> Self {
        self.reversibility = reversibility;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: DataSensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    /// Words the planner matches task text against.
    pub fn search_text(&self) -> String {
        format!(
            "{} {} {}",
            self.id.replace(['_', '-'], " "),
            self.description,
            self.capabilities.join(" ").replace(['_', '-'], " ")
        )
    }
}

/// The core Tool trait.
///
/// `validate_parameters` and `verify_result` default to JSON-Schema checks
/// against the descriptor; tools with stricter rules override them.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    fn id(&self) -> &str {
        &self.descriptor().id
    }

    /// Reject parameters that violate the declared schema. Runs before any side effect.
    fn validate_parameters(&self, parameters: &serde_json::Value) -> Result<(), ToolError> {
        schema::validate(&self.descriptor().parameter_schema, parameters).map_err(|reason| {
            ToolError::InvalidParameters {
                tool_id: self.id().to_string(),
                reason,
            }
        })
    }

    async fn execute(
        &self,
        parameters: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ToolError>;

    /// Reject output that violates the declared output schema.
    fn verify_result(&self, output: &serde_json::Value) -> Result<(), ToolError> {
        schema::validate(&self.descriptor().output_schema, output).map_err(|reason| {
            ToolError::OutputRejected {
                tool_id: self.id().to_string(),
                reason,
            }
        })
    }
}

/// Lookup table of available tools keyed by identifier.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same id.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let id = tool.id().to_string();
        if self.tools.insert(id.clone(), tool).is_some() {
            warn!(tool = %id, "Tool re-registered; previous definition replaced");
        }
    }

    pub fn get(&self, id: &str) -> Option<&dyn Tool> {
        self.tools.get(id).map(|t| t.as_ref())
    }

    pub fn descriptor(&self, id: &str) -> Option<&ToolDescriptor> {
        self.get(id).map(|t| t.descriptor())
    }

    /// All descriptors, sorted by id.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut all: Vec<&ToolDescriptor> = self.tools.values().map(|t| t.descriptor()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Descriptors offering `capability` (if given) at or below `max_tier` (if given).
    pub fn search(
        &self,
        capability: Option<&str>,
        max_tier: Option<HitlTier>,
    ) -> Vec<&ToolDescriptor> {
        self.descriptors()
            .into_iter()
            .filter(|d| capability.is_none_or(|c| d.capabilities.iter().any(|x| x == c)))
            .filter(|d| max_tier.is_none_or(|t| d.risk_tier <= t))
            .collect()
    }

    /// Sorted tool ids.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.ids())
            .finish()
    }
}
