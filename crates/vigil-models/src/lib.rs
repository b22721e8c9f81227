//! Shared data models for the Vigil behavior-event engine.
//!
//! This crate provides Serde-serializable types for:
//! - Stream, rule and model identifiers
//! - Risk tiers and event severities
//! - The perception-model contract (detections, keypoints)
//! - Frames and detection events
//! - The rule configuration document and calibration profiles

pub mod calibration;
pub mod event;
pub mod frame;
pub mod ids;
pub mod perception;
pub mod posture;
pub mod risk;
pub mod rule;

// Re-export common types
pub use calibration::{BoundSpec, CalibrationProfileSpec, CompositeSpec, NodSpec, PostureSpec, SteadySpec};
pub use event::Event;
pub use frame::{Frame, FrameData};
pub use ids::{ModelId, RuleId, StreamId};
pub use perception::{
    BoundingBox, Detection, InferenceOutput, Joint, JointParseError, Keypoint, ModelCapability,
    ModelCapabilityParseError, PoseEstimate,
};
pub use posture::PostureLabel;
pub use risk::{RiskTier, RiskTierParseError, Severity, SeverityParseError};
pub use rule::{
    CooldownSpec, DetectionParams, MatchSpec, OutputSchemaSpec, PredicateSpec, RoleSpec, RuleDocument, RuleSpec,
};
