//! Perception-model contract types.
//!
//! These mirror the JSON returned by the perception service for one frame:
//! object detections from a detector model and per-person keypoints from a
//! pose model. Coordinates are in frame pixels, y growing downward.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Capability a perception model provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModelCapability {
    /// Class + bounding box detections.
    ObjectDetection,
    /// Per-person body keypoints.
    PoseEstimation,
}

impl ModelCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCapability::ObjectDetection => "object_detection",
            ModelCapability::PoseEstimation => "pose_estimation",
        }
    }
}

impl fmt::Display for ModelCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ModelCapability {
    type Err = ModelCapabilityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "object_detection" | "detection" | "detector" => Ok(ModelCapability::ObjectDetection),
            "pose_estimation" | "pose" => Ok(ModelCapability::PoseEstimation),
            _ => Err(ModelCapabilityParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown model capability.
#[derive(Debug, Error)]
#[error("Unknown model capability: {0}")]
pub struct ModelCapabilityParseError(String);

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).abs()
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).abs()
    }
}

/// A single object detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Detection {
    #[serde(alias = "class")]
    pub class_name: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// COCO-17 body joints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Joint {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl Joint {
    /// All joints in COCO index order.
    pub const ALL: [Joint; 17] = [
        Joint::Nose,
        Joint::LeftEye,
        Joint::RightEye,
        Joint::LeftEar,
        Joint::RightEar,
        Joint::LeftShoulder,
        Joint::RightShoulder,
        Joint::LeftElbow,
        Joint::RightElbow,
        Joint::LeftWrist,
        Joint::RightWrist,
        Joint::LeftHip,
        Joint::RightHip,
        Joint::LeftKnee,
        Joint::RightKnee,
        Joint::LeftAnkle,
        Joint::RightAnkle,
    ];

    /// Position in the COCO keypoint array.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Joint for a COCO keypoint index.
    pub fn from_index(idx: usize) -> Option<Joint> {
        Self::ALL.get(idx).copied()
    }

    /// Snake-case joint name as used in rule documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            Joint::Nose => "nose",
            Joint::LeftEye => "left_eye",
            Joint::RightEye => "right_eye",
            Joint::LeftEar => "left_ear",
            Joint::RightEar => "right_ear",
            Joint::LeftShoulder => "left_shoulder",
            Joint::RightShoulder => "right_shoulder",
            Joint::LeftElbow => "left_elbow",
            Joint::RightElbow => "right_elbow",
            Joint::LeftWrist => "left_wrist",
            Joint::RightWrist => "right_wrist",
            Joint::LeftHip => "left_hip",
            Joint::RightHip => "right_hip",
            Joint::LeftKnee => "left_knee",
            Joint::RightKnee => "right_knee",
            Joint::LeftAnkle => "left_ankle",
            Joint::RightAnkle => "right_ankle",
        }
    }
}

impl fmt::Display for Joint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Joint {
    type Err = JointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|j| j.as_str() == name)
            .ok_or_else(|| JointParseError(s.to_string()))
    }
}

/// Error returned when parsing an unknown joint name.
#[derive(Debug, Error)]
#[error("Unknown joint: {0}")]
pub struct JointParseError(String);

/// A tracked body-joint location with confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Keypoint {
    pub joint: Joint,
    pub x: f64,
    pub y: f64,
    pub confidence: f64,
}

/// Keypoints for one person in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct PoseEstimate {
    /// Tracker identity, when the pose model tracks across frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
    #[serde(default)]
    pub keypoints: Vec<Keypoint>,
}

impl PoseEstimate {
    /// Keypoint for `joint`, if reported.
    pub fn keypoint(&self, joint: Joint) -> Option<&Keypoint> {
        self.keypoints.iter().find(|k| k.joint == joint)
    }

    /// Keypoint for `joint` if its confidence reaches `min_confidence`.
    pub fn visible(&self, joint: Joint, min_confidence: f64) -> Option<&Keypoint> {
        self.keypoint(joint).filter(|k| k.confidence >= min_confidence)
    }
}

/// Model output for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct InferenceOutput {
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub poses: Vec<PoseEstimate>,
    /// Model-side inference latency in milliseconds.
    #[serde(default)]
    pub latency_ms: f64,
}
