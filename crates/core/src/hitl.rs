//! Human-in-the-loop tiers and the risk attributes they are derived from.

use serde::{Deserialize, Serialize};

/// Escalation tier for a proposed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HitlTier {
    /// Auto-proceed.
    #[serde(rename = "TIER_1")]
    Tier1 = 1,
    /// Proceed, then audit.
    #[serde(rename = "TIER_2")]
    Tier2 = 2,
    /// Wait for approval.
    #[serde(rename = "TIER_3")]
    Tier3 = 3,
    /// Escalate immediately and block.
    #[serde(rename = "TIER_4")]
    Tier4 = 4,
}

impl HitlTier {
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Tier1),
            2 => Some(Self::Tier2),
            3 => Some(Self::Tier3),
            4 => Some(Self::Tier4),
            _ => None,
        }
    }

    /// Tier 3 and 4 never auto-proceed.
    pub fn requires_approval(self) -> bool {
        self >= Self::Tier3
    }

    pub fn requires_audit(self) -> bool {
        self >= Self::Tier2
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Tier1 => "auto-proceed",
            Self::Tier2 => "proceed-and-audit",
            Self::Tier3 => "wait-for-approval",
            Self::Tier4 => "immediate-escalation",
        }
    }
}

impl std::fmt::Display for HitlTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier {} ({})", self.level(), self.label())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Impact {
    #[default]
    Low,
    Medium,
    High,
}

/// Ordered from least to most risky.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reversibility {
    #[default]
    Full,
    Partial,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSensitivity {
    #[default]
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl DataSensitivity {
    pub const ALL: [DataSensitivity; 4] = [
        DataSensitivity::Public,
        DataSensitivity::Internal,
        DataSensitivity::Confidential,
        DataSensitivity::Restricted,
    ];
}

macro_rules! impl_from_str {
    ($ty:ty, { $($text:literal => $variant:expr),+ $(,)? }) => {
        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok($variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($ty))),
                }
            }
        }
    };
}

impl_from_str!(Impact, { "low" => Impact::Low, "medium" => Impact::Medium, "high" => Impact::High });
impl_from_str!(Reversibility, {
    "full" => Reversibility::Full,
    "partial" => Reversibility::Partial,
    "none" => Reversibility::None,
});
impl_from_str!(DataSensitivity, {
    "public" => DataSensitivity::Public,
    "internal" => DataSensitivity::Internal,
    "confidential" => DataSensitivity::Confidential,
    "restricted" => DataSensitivity::Restricted,
});

/// The action a reviewer is asked about: releasing the outcome of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub description: String,
    pub tool_ids: Vec<String>,
    pub impact: Impact,
    pub reversibility: Reversibility,
    pub sensitivity: DataSensitivity,
    pub rationale: String,
    pub confidence: f32,
}

impl ProposedAction {
    pub fn new(
        description: impl Into<String>,
        impact: Impact,
        reversibility: Reversibility,
        sensitivity: DataSensitivity,
    ) -> Self {
        Self {
            description: description.into(),
            tool_ids: Vec::new(),
            impact,
            reversibility,
            sensitivity,
            rationale: String::new(),
            confidence: 1.0,
        }
    }
}
