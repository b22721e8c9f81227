//! Risk tiers and event severities.
//!
//! A stream's risk tier controls how often its frames are sampled:
//!
//! - `High`: sampled most often, never throttled under backpressure
//! - `Medium`: the default tier
//! - `Low`: sampled least often, throttled first under backpressure

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Urgency level of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Safety-critical scene; shortest sampling interval.
    High,

    /// Normal supervision.
    #[default]
    Medium,

    /// Low-traffic or low-risk scene.
    Low,
}

impl RiskTier {
    /// All tiers, most urgent first.
    pub const ALL: &'static [RiskTier] = &[RiskTier::High, RiskTier::Medium, RiskTier::Low];

    /// Returns the tier name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::High => "high",
            RiskTier::Medium => "medium",
            RiskTier::Low => "low",
        }
    }

    /// Returns the urgency rank (3 = most urgent).
    pub fn urgency(&self) -> u8 {
        match self {
            RiskTier::High => 3,
            RiskTier::Medium => 2,
            RiskTier::Low => 1,
        }
    }

    /// Returns true if `self` is more urgent than `other`.
    pub fn is_more_urgent_than(&self, other: RiskTier) -> bool {
        self.urgency() > other.urgency()
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = RiskTierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" | "h" => Ok(RiskTier::High),
            "medium" | "m" | "normal" => Ok(RiskTier::Medium),
            "low" | "l" => Ok(RiskTier::Low),
            _ => Err(RiskTierParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown risk tier: {0}")]
pub struct RiskTierParseError(String);

/// Severity of an emitted event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = SeverityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            _ => Err(SeverityParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown severity: {0}")]
pub struct SeverityParseError(String);
