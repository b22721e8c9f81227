//! Detection events handed to the event sink.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{RiskTier, RuleId, Severity, StreamId};

/// A rule-triggered event.
///
/// Events are immutable once built; the engine hands them to the sink and
/// keeps no reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    #[schemars(with = "String")]
    pub id: Uuid,
    pub rule_id: RuleId,
    pub rule_name: String,
    pub category: String,
    pub stream_id: StreamId,
    pub severity: Severity,
    /// Stream tier at the time the event fired.
    pub risk_tier: RiskTier,
    pub timestamp: DateTime<Utc>,
    /// Predicate strength in `[0, 1]`.
    pub confidence: f64,
    /// Fields declared by the rule's output schema.
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Returns true if this event should escalate a stream at `threshold`.
    pub fn escalates(&self, threshold: Severity) -> bool {
        self.severity >= threshold
    }
}
