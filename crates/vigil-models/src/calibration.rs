//! Posture calibration profiles.
//!
//! A profile is a named set of posture definitions (geometric bounds over
//! keypoint features) plus the debounce settings the classifier applies.
//! Several profiles may coexist in one rule document; exactly one is
//! selected per stream.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

fn default_min_joint_confidence() -> f64 {
    0.3
}

fn default_min_consecutive_frames() -> u32 {
    15
}

fn default_stability_window() -> u32 {
    10
}

fn default_analysis_window_frames() -> u32 {
    30
}

fn default_reference_height_px() -> f64 {
    140.0
}

fn default_track_ttl_frames() -> u32 {
    30
}

/// One named calibration profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct CalibrationProfileSpec {
    /// Tie-break order when several postures qualify, most important first.
    /// Postures not listed rank after listed ones, alphabetically.
    #[serde(default)]
    pub priority: Vec<String>,

    #[serde(default = "default_min_joint_confidence")]
    #[validate(range(min = 0.0, max = 1.0, message = "must be in [0, 1]"))]
    pub min_joint_confidence: f64,

    #[serde(default = "default_min_consecutive_frames")]
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub min_consecutive_frames: u32,

    #[serde(default = "default_stability_window")]
    #[validate(range(min = 2, message = "must be at least 2"))]
    pub stability_window: u32,

    /// Frames over which keypoint visibility is tracked for the
    /// indeterminate check.
    #[serde(default = "default_analysis_window_frames")]
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub analysis_window_frames: u32,

    /// Pixel height of a standing person used to normalise `height_ratio`.
    #[serde(default = "default_reference_height_px")]
    #[validate(range(exclusive_min = 0.0, message = "must be greater than zero"))]
    pub reference_height_px: f64,

    /// Image row of the floor for this camera. Enables `ankle_elevation`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 0.0, message = "must not be negative"))]
    pub ground_line_px: Option<f64>,

    #[serde(default = "default_track_ttl_frames")]
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub track_ttl_frames: u32,

    #[serde(default)]
    pub postures: BTreeMap<String, PostureSpec>,
}

impl Default for CalibrationProfileSpec {
    fn default() -> Self {
        Self {
            priority: Vec::new(),
            min_joint_confidence: default_min_joint_confidence(),
            min_consecutive_frames: default_min_consecutive_frames(),
            stability_window: default_stability_window(),
            analysis_window_frames: default_analysis_window_frames(),
            reference_height_px: default_reference_height_px(),
            ground_line_px: None,
            track_ttl_frames: default_track_ttl_frames(),
            postures: BTreeMap::new(),
        }
    }
}

/// Definition of one posture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PostureSpec {
    /// Feature name → range. Every bound must hold for a frame to vote.
    #[serde(default)]
    pub bounds: BTreeMap<String, BoundSpec>,

    /// Joints that must clear `min_joint_confidence`.
    #[serde(default)]
    pub required_joints: Vec<String>,

    /// Overrides the profile's debounce for this posture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_consecutive_frames: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steady: Option<SteadySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<CompositeSpec>,
}

/// Closed range over a feature; either end may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoundSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl BoundSpec {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Variance gate for postures that must be held still.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct SteadySpec {
    pub feature: String,
    #[validate(range(min = 0.0, message = "must not be negative"))]
    pub variance_threshold: f64,
}

/// A posture that requires a base posture plus a repeated motion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompositeSpec {
    /// Any of these postures' bounds must hold.
    pub base: Vec<String>,
    pub nod: NodSpec,
}

/// Oscillation sub-pattern (e.g. repeated head drops).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct NodSpec {
    pub metric: String,
    #[serde(alias = "window")]
    #[validate(range(min = 3, message = "must be at least 3"))]
    pub nod_detection_window: u32,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub nod_count_min: u32,
    #[serde(default)]
    #[validate(range(min = 0.0, message = "must not be negative"))]
    pub min_amplitude: f64,
}
