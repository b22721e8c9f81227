//! Rule configuration document.
//!
//! This is the declarative, serde-level shape of a rule set. It is
//! intentionally lenient: unknown fields are ignored and most numeric
//! parameters are optional here, because the rule catalog reports missing
//! or out-of-range values by name for every offending rule at once instead
//! of failing on the first serde error.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use validator::Validate;

use crate::calibration::CalibrationProfileSpec;
use crate::{ModelId, RiskTier, Severity};

/// Top-level rule document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RuleDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Name of the calibration profile the posture classifier uses.
    /// Required whenever `calibration_profiles` is non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_profile: Option<String>,

    #[serde(default)]
    pub calibration_profiles: BTreeMap<String, CalibrationProfileSpec>,

    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl RuleDocument {
    /// JSON Schema of the document format.
    pub fn schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(RuleDocument)
    }
}

/// One rule as written in the document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct RuleSpec {
    #[validate(length(min = 1, message = "rule id must not be empty"))]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    #[validate(length(min = 1, message = "category must not be empty"))]
    pub category: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub severity: Severity,

    /// Perception models whose output the rule consumes.
    #[serde(default, alias = "detection_models")]
    pub required_models: Vec<ModelId>,

    pub predicate: PredicateSpec,

    #[serde(default)]
    pub detection_params: DetectionParams,

    /// Per-tier parameter sets. An entry replaces `detection_params`
    /// entirely while the stream is at that tier.
    #[serde(default)]
    pub tier_overrides: HashMap<RiskTier, DetectionParams>,

    #[serde(default)]
    pub cooldown: CooldownSpec,

    #[serde(default)]
    pub output_schema: OutputSchemaSpec,
}

fn default_enabled() -> bool {
    true
}

/// Predicate shape. `kind` is one of `ratio`, `count`, `multi_role`,
/// `keypoint_absence`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PredicateSpec {
    #[serde(default)]
    pub kind: String,

    /// Per-observation qualification for `ratio` and `count`.
    #[serde(default, rename = "match")]
    pub matcher: MatchSpec,

    /// Role constraints for `multi_role`.
    #[serde(default)]
    pub roles: Vec<RoleSpec>,

    /// `exactly` or `at_least` (multi_role).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Number of distinct persons (multi_role).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persons: Option<u32>,

    /// Joint names that must stay visible (keypoint_absence).
    #[serde(default)]
    pub joints: Vec<String>,
}

/// Conditions one observation must meet to qualify.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MatchSpec {
    /// Any of these object classes present.
    #[serde(default, alias = "detection_objects")]
    pub objects: Vec<String>,

    /// Some tracked person currently holds this posture label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posture: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_persons: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_persons: Option<u32>,
}

impl MatchSpec {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
            && self.posture.is_none()
            && self.min_persons.is_none()
            && self.max_persons.is_none()
    }
}

/// A role one distinct person must fill.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RoleSpec {
    pub name: String,
    /// Accepted posture labels; empty accepts any person.
    #[serde(default)]
    pub postures: Vec<String>,
}

/// Numeric detection parameters.
///
/// Which fields are required depends on the predicate kind; the catalog
/// enforces that.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct DetectionParams {
    #[serde(default, alias = "analysis_window", skip_serializing_if = "Option::is_none")]
    #[validate(range(exclusive_min = 0.0, message = "must be greater than zero"))]
    pub analysis_window_secs: Option<f64>,

    #[serde(default, alias = "frame_interval", skip_serializing_if = "Option::is_none")]
    #[validate(range(exclusive_min = 0.0, message = "must be greater than zero"))]
    pub frame_interval_secs: Option<f64>,

    #[serde(
        default,
        alias = "min_detection_ratio",
        alias = "min_fall_ratio",
        alias = "min_sleep_ratio",
        skip_serializing_if = "Option::is_none"
    )]
    #[validate(range(exclusive_min = 0.0, max = 1.0, message = "must be in (0, 1]"))]
    pub min_ratio: Option<f64>,

    #[serde(default, alias = "min_valid_frames", skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub min_hits: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_appearances: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0, max = 1.0, message = "must be in [0, 1]"))]
    pub min_confidence: Option<f64>,

    /// Entries required before a ratio-based predicate may hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub min_samples: Option<u32>,
}

/// When a fired rule may fire again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct CooldownSpec {
    /// Re-arm after this much time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(exclusive_min = 0.0, message = "must be greater than zero"))]
    pub duration_secs: Option<f64>,

    /// Re-arm after the predicate was false for this many evaluations in a row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub quiet_evaluations: Option<u32>,
}

impl Default for CooldownSpec {
    fn default() -> Self {
        Self {
            duration_secs: None,
            quiet_evaluations: Some(1),
        }
    }
}

/// Payload fields an event must carry, with their declared JSON types
/// (`number`, `integer`, `string`, `array`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputSchemaSpec {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}
