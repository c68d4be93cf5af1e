//! Configuration loading, validation, and management for Steward.
//!
//! Loads configuration from `~/.steward/config.toml` (or `STEWARD_CONFIG`)
//! with environment variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.steward/config.toml`.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Control-loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Context window budget
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Self-verification thresholds
    #[serde(default)]
    pub verifier: VerifierConfig,

    /// Tool authorization and consent
    #[serde(default)]
    pub security: SecurityConfig,

    /// Always-loaded context
    #[serde(default)]
    pub base_context: BaseContextConfig,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("agent", &self.agent)
            .field("budget", &self.budget)
            .field("verifier", &self.verifier)
            .field("security", &self.security)
            .field("base_context", &self.base_context)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Upper bound on concurrently running parallel-safe steps.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// How long to wait for a reviewer before treating silence as a denial.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,

    /// Identity the loop acts as when authorizing tools.
    #[serde(default = "default_principal")]
    pub principal: String,

    /// Highest tool risk tier (1-4) the planner may choose. Unset allows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_tier: Option<u8>,
}

fn default_max_iterations() -> u32 {
    5
}
fn default_max_parallel_steps() -> usize {
    4
}
fn default_approval_timeout_secs() -> u64 {
    300
}
fn default_principal() -> String {
    "steward".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_parallel_steps: default_max_parallel_steps(),
            approval_timeout_secs: default_approval_timeout_secs(),
            principal: default_principal(),
            max_tool_tier: None,
        }
    }
}

/// Token ceiling and its partition into categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_total_tokens")]
    pub total_tokens: usize,

    #[serde(default = "default_fixed_context")]
    pub fixed_context: usize,

    #[serde(default = "default_working_memory")]
    pub working_memory: usize,

    #[serde(default = "default_tool_cache")]
    pub tool_cache: usize,

    #[serde(default = "default_reasoning")]
    pub reasoning: usize,

    #[serde(default = "default_output_reserve")]
    pub output_reserve: usize,

    #[serde(default = "default_dynamic_pool")]
    pub dynamic_pool: usize,

    /// Fraction of the ceiling above which compaction runs before Gather.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,

    /// Fraction of the ceiling compaction aims for.
    #[serde(default = "default_compaction_target")]
    pub compaction_target: f32,

    /// Summary length relative to the summarized history.
    #[serde(default = "default_compression_ratio")]
    pub compression_ratio: f32,

    /// Most recent turns kept verbatim by compaction.
    #[serde(default = "default_keep_recent_turns")]
    pub keep_recent_turns: usize,
}

fn default_total_tokens() -> usize {
    32_000
}
fn default_fixed_context() -> usize {
    4_000
}
fn default_working_memory() -> usize {
    12_000
}
fn default_tool_cache() -> usize {
    6_000
}
fn default_reasoning() -> usize {
    4_000
}
fn default_output_reserve() -> usize {
    4_000
}
fn default_dynamic_pool() -> usize {
    2_000
}
fn default_compaction_threshold() -> f32 {
    0.8
}
fn default_compaction_target() -> f32 {
    0.5
}
fn default_compression_ratio() -> f32 {
    0.3
}
fn default_keep_recent_turns() -> usize {
    4
}

impl BudgetConfig {
    /// Sum of the category allocations.
    pub fn allocated(&self) -> usize {
        self.fixed_context
            + self.working_memory
            + self.tool_cache
            + self.reasoning
            + self.output_reserve
            + self.dynamic_pool
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_tokens: default_total_tokens(),
            fixed_context: default_fixed_context(),
            working_memory: default_working_memory(),
            tool_cache: default_tool_cache(),
            reasoning: default_reasoning(),
            output_reserve: default_output_reserve(),
            dynamic_pool: default_dynamic_pool(),
            compaction_threshold: default_compaction_threshold(),
            compaction_target: default_compaction_target(),
            compression_ratio: default_compression_ratio(),
            keep_recent_turns: default_keep_recent_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f32,

    /// Regexes whose match anywhere in the output fails the safety check.
    #[serde(default = "default_blocked_patterns")]
    pub blocked_patterns: Vec<String>,
}

fn default_confidence_threshold() -> f32 {
    0.7
}
fn default_quality_threshold() -> f32 {
    0.6
}
fn default_blocked_patterns() -> Vec<String> {
    vec![
        r"\b\d{3}-\d{2}-\d{4}\b".into(),
        r"-----BEGIN [A-Z ]*PRIVATE KEY-----".into(),
    ]
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            quality_threshold: default_quality_threshold(),
            blocked_patterns: default_blocked_patterns(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Tools the principal may run. Empty denies everything; `"*"` allows all.
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,

    /// Always denied, even when matched by `allowed_tools`.
    #[serde(default)]
    pub denied_tools: Vec<String>,

    /// Tool ids for which consent has been granted ahead of time.
    #[serde(default)]
    pub granted_consents: Vec<String>,
}

fn default_allowed_tools() -> Vec<String> {
    vec!["*".into()]
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_tools: default_allowed_tools(),
            denied_tools: vec![],
            granted_consents: vec![],
        }
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("allowed_tools", &self.allowed_tools)
            .field("denied_tools", &self.denied_tools)
            .field(
                "granted_consents",
                &format_args!("[{} grant(s)]", self.granted_consents.len()),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseContextConfig {
    /// Safety rules loaded before the first iteration of every task.
    #[serde(default = "default_safety_rules")]
    pub safety_rules: Vec<String>,

    /// Directory of `<domain>.toml` knowledge collections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_dir: Option<PathBuf>,
}

fn default_safety_rules() -> Vec<String> {
    vec![
        "Never disclose restricted personal data.".into(),
        "Do not act outside the scope of the submitted task.".into(),
        "Escalate to a human reviewer when unsure about an irreversible action.".into(),
    ]
}

impl Default for BaseContextConfig {
    fn default() -> Self {
        Self {
            safety_rules: default_safety_rules(),
            knowledge_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.steward/config.toml).
    ///
    /// Environment overrides:
    /// - `STEWARD_CONFIG` (alternate config file path)
    /// - `STEWARD_MAX_ITERATIONS`
    /// - `STEWARD_TOTAL_TOKENS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("STEWARD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup, then re-validate.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("STEWARD_MAX_ITERATIONS") {
            self.agent.max_iterations = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("STEWARD_MAX_ITERATIONS is not a number: {raw}"))
            })?;
        }

        if let Some(raw) = lookup("STEWARD_TOTAL_TOKENS") {
            self.budget.total_tokens = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("STEWARD_TOTAL_TOKENS is not a number: {raw}"))
            })?;
        }

        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".steward")
    }

    /// Default directory for knowledge collections.
    pub fn knowledge_dir(&self) -> PathBuf {
        self.base_context
            .knowledge_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("knowledge"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.agent.max_parallel_steps == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_parallel_steps must be at least 1".into(),
            ));
        }

        if let Some(tier) = self.agent.max_tool_tier
            && !(1..=4).contains(&tier)
        {
            return Err(ConfigError::ValidationError(format!(
                "agent.max_tool_tier must be between 1 and 4, got {tier}"
            )));
        }

        let b = &self.budget;
        if b.allocated() > b.total_tokens {
            return Err(ConfigError::ValidationError(format!(
                "budget allocations ({}) exceed total_tokens ({})",
                b.allocated(),
                b.total_tokens
            )));
        }

        let fractions = [
            ("budget.compaction_threshold", b.compaction_threshold),
            ("budget.compaction_target", b.compaction_target),
            ("budget.compression_ratio", b.compression_ratio),
            ("verifier.confidence_threshold", self.verifier.confidence_threshold),
            ("verifier.quality_threshold", self.verifier.quality_threshold),
        ];
        for (name, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }

        if b.compaction_target >= b.compaction_threshold {
            return Err(ConfigError::ValidationError(
                "budget.compaction_target must be below budget.compaction_threshold".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
