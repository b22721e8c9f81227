//! Keypoint geometry features used by the posture classifier.
//!
//! All features are computed in frame pixels (y grows downward). A feature
//! whose joints are missing or below the confidence threshold is absent
//! (`None`), and any posture bound on an absent feature fails.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use vigil_models::{Joint, PoseEstimate};

const FEATURE_COUNT: usize = 12;

/// Derived per-person feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    /// Nose-to-ankle height divided by the profile's reference height.
    HeightRatio,
    /// Nose-to-ankle height in pixels.
    HeightPx,
    /// Hip-knee-ankle angle, degrees.
    LeftKneeAngle,
    RightKneeAngle,
    /// Shoulder-hip-ankle angle at the hip midpoint, degrees.
    TrunkAngle,
    /// Horizontal distance between shoulder and hip midpoints.
    ShoulderHipOffset,
    /// Knee midpoint y minus hip midpoint y.
    HipKneeOffset,
    /// Standard deviation of visible keypoint y coordinates.
    VerticalSpread,
    /// Nose y minus shoulder midpoint y.
    HeadDrop,
    /// Angle between the shoulder→eye vector and vertical, degrees.
    NeckAngle,
    /// Absolute change of `HeightPx` since the person's previous frame.
    Movement,
    /// Height of the higher ankle above the profile's ground line, divided
    /// by the reference height. Absent when no ground line is calibrated.
    AnkleElevation,
}

impl Feature {
    pub const ALL: [Feature; FEATURE_COUNT] = [
        Feature::HeightRatio,
        Feature::HeightPx,
        Feature::LeftKneeAngle,
        Feature::RightKneeAngle,
        Feature::TrunkAngle,
        Feature::ShoulderHipOffset,
        Feature::HipKneeOffset,
        Feature::VerticalSpread,
        Feature::HeadDrop,
        Feature::NeckAngle,
        Feature::Movement,
        Feature::AnkleElevation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::HeightRatio => "height_ratio",
            Feature::HeightPx => "height_px",
            Feature::LeftKneeAngle => "left_knee_angle",
            Feature::RightKneeAngle => "right_knee_angle",
            Feature::TrunkAngle => "trunk_angle",
            Feature::ShoulderHipOffset => "shoulder_hip_offset",
            Feature::HipKneeOffset => "hip_knee_offset",
            Feature::VerticalSpread => "vertical_spread",
            Feature::HeadDrop => "head_drop",
            Feature::NeckAngle => "neck_angle",
            Feature::Movement => "movement",
            Feature::AnkleElevation => "ankle_elevation",
        }
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Feature {
    type Err = FeatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == name)
            .ok_or_else(|| FeatureParseError(s.to_string()))
    }
}

#[derive(Debug, Error)]
#[error("Unknown feature: {0}")]
pub struct FeatureParseError(String);

/// Feature values for one person in one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeatureVector {
    values: [Option<f64>; FEATURE_COUNT],
}

impl FeatureVector {
    pub fn get(&self, feature: Feature) -> Option<f64> {
        self.values[feature.slot()]
    }

    pub fn set(&mut self, feature: Feature, value: Option<f64>) {
        self.values[feature.slot()] = value.filter(|v| v.is_finite());
    }

    /// Compute features for `pose`.
    ///
    /// `previous_height_px` is the person's `HeightPx` on their previous
    /// frame, used for `Movement`. `ground_line_px` is the image row of the
    /// floor, used for `AnkleElevation`.
    pub fn compute(
        pose: &PoseEstimate,
        min_confidence: f64,
        reference_height_px: f64,
        ground_line_px: Option<f64>,
        previous_height_px: Option<f64>,
    ) -> Self {
        let point = |joint: Joint| pose.visible(joint, min_confidence).map(|k| (k.x, k.y));
        let mid = |left: Joint, right: Joint| midpoint(point(left), point(right));

        let nose = point(Joint::Nose);
        let shoulders = mid(Joint::LeftShoulder, Joint::RightShoulder);
        let hips = mid(Joint::LeftHip, Joint::RightHip);
        let knees = mid(Joint::LeftKnee, Joint::RightKnee);
        let ankles = mid(Joint::LeftAnkle, Joint::RightAnkle);
        let eyes = mid(Joint::LeftEye, Joint::RightEye);

        let mut fv = Self::default();

        let height_px = match (nose, ankles) {
            (Some(n), Some(a)) => Some((a.1 - n.1).abs()),
            _ => None,
        };
        fv.set(Feature::HeightPx, height_px);
        if reference_height_px > 0.0 {
            fv.set(Feature::HeightRatio, height_px.map(|h| h / reference_height_px));
        }

        fv.set(
            Feature::LeftKneeAngle,
            angle_at(point(Joint::LeftHip), point(Joint::LeftKnee), point(Joint::LeftAnkle)),
        );
        fv.set(
            Feature::RightKneeAngle,
            angle_at(point(Joint::RightHip), point(Joint::RightKnee), point(Joint::RightAnkle)),
        );
        fv.set(Feature::TrunkAngle, angle_at(shoulders, hips, ankles));

        if let (Some(s), Some(h)) = (shoulders, hips) {
            fv.set(Feature::ShoulderHipOffset, Some((s.0 - h.0).abs()));
        }
        if let (Some(h), Some(k)) = (hips, knees) {
            fv.set(Feature::HipKneeOffset, Some(k.1 - h.1));
        }
        if let (Some(n), Some(s)) = (nose, shoulders) {
            fv.set(Feature::HeadDrop, Some(n.1 - s.1));
        }
        if let (Some(e), Some(s)) = (eyes, shoulders) {
            fv.set(Feature::NeckAngle, angle_from_vertical(e.0 - s.0, e.1 - s.1));
        }

        let ys: Vec<f64> = pose
            .keypoints
            .iter()
            .filter(|k| k.confidence >= min_confidence)
            .map(|k| k.y)
            .collect();
        if ys.len() >= 2 {
            fv.set(Feature::VerticalSpread, Some(std_dev(&ys)));
        }

        if let (Some(h), Some(prev)) = (height_px, previous_height_px) {
            fv.set(Feature::Movement, Some((h - prev).abs()));
        }

        let highest_ankle = [point(Joint::LeftAnkle), point(Joint::RightAnkle)]
            .into_iter()
            .flatten()
            .map(|(_, y)| y)
            .reduce(f64::min);
        if let (Some(ground), Some(y)) = (ground_line_px, highest_ankle) {
            if reference_height_px > 0.0 {
                fv.set(Feature::AnkleElevation, Some((ground - y) / reference_height_px));
            }
        }

        fv
    }
}

/// Mean of whichever sides are visible.
fn midpoint(left: Option<(f64, f64)>, right: Option<(f64, f64)>) -> Option<(f64, f64)> {
    match (left, right) {
        (Some(l), Some(r)) => Some(((l.0 + r.0) / 2.0, (l.1 + r.1) / 2.0)),
        (Some(p), None) | (None, Some(p)) => Some(p),
        (None, None) => None,
    }
}

/// Angle ABC at vertex B, in degrees.
pub fn angle_at(a: Option<(f64, f64)>, b: Option<(f64, f64)>, c: Option<(f64, f64)>) -> Option<f64> {
    let (a, b, c) = (a?, b?, c?);
    let ba = (a.0 - b.0, a.1 - b.1);
    let bc = (c.0 - b.0, c.1 - b.1);
    let norm = (ba.0.hypot(ba.1)) * (bc.0.hypot(bc.1));
    if norm < f64::EPSILON {
        return None;
    }
    let cos = ((ba.0 * bc.0 + ba.1 * bc.1) / norm).clamp(-1.0, 1.0);
    Some(cos.acos().to_degrees())
}

/// Angle between (dx, dy) and straight up, in degrees.
fn angle_from_vertical(dx: f64, dy: f64) -> Option<f64> {
    let len = dx.hypot(dy);
    if len < f64::EPSILON {
        return None;
    }
    Some((-dy / len).clamp(-1.0, 1.0).acos().to_degrees())
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Population variance; zero for fewer than two values.
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

/// Count local maxima that rise at least `min_amplitude` above both
/// neighbours.
pub fn count_peaks(values: &[f64], min_amplitude: f64) -> usize {
    values
        .windows(3)
        .filter(|w| {
            let (prev, cur, next) = (w[0], w[1], w[2]);
            cur > prev && cur > next && cur - prev.max(next) >= min_amplitude
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_models::Keypoint;

    fn kp(joint: Joint, x: f64, y: f64) -> Keypoint {
        Keypoint { joint, x, y, confidence: 0.9 }
    }

    /// Upright person roughly 140px tall.
    fn standing() -> PoseEstimate {
        PoseEstimate {
            track_id: Some(1),
            bbox: None,
            keypoints: vec![
                kp(Joint::Nose, 100.0, 20.0),
                kp(Joint::LeftEye, 97.0, 17.0),
                kp(Joint::RightEye, 103.0, 17.0),
                kp(Joint::LeftShoulder, 90.0, 40.0),
                kp(Joint::RightShoulder, 110.0, 40.0),
                kp(Joint::LeftHip, 92.0, 90.0),
                kp(Joint::RightHip, 108.0, 90.0),
                kp(Joint::LeftKnee, 92.0, 125.0),
                kp(Joint::RightKnee, 108.0, 125.0),
                kp(Joint::LeftAnkle, 92.0, 160.0),
                kp(Joint::RightAnkle, 108.0, 160.0),
            ],
        }
    }

    #[test]
    fn test_standing_features() {
        let fv = FeatureVector::compute(&standing(), 0.3, 140.0, None, None);
        assert_eq!(fv.get(Feature::HeightPx), Some(140.0));
        assert_eq!(fv.get(Feature::HeightRatio), Some(1.0));
        assert!((fv.get(Feature::LeftKneeAngle).unwrap() - 180.0).abs() < 1e-6);
        assert!((fv.get(Feature::TrunkAngle).unwrap() - 180.0).abs() < 1e-6);
        assert_eq!(fv.get(Feature::ShoulderHipOffset), Some(0.0));
        assert_eq!(fv.get(Feature::HipKneeOffset), Some(35.0));
        assert_eq!(fv.get(Feature::HeadDrop), Some(-20.0));
        assert!(fv.get(Feature::NeckAngle).unwrap() < 1e-6);
        assert_eq!(fv.get(Feature::Movement), None);
        assert_eq!(fv.get(Feature::AnkleElevation), None);
    }

    #[test]
    fn test_low_confidence_joints_make_features_absent() {
        let mut pose = standing();
        for k in pose.keypoints.iter_mut() {
            if matches!(k.joint, Joint::LeftAnkle | Joint::RightAnkle) {
                k.confidence = 0.1;
            }
        }
        let fv = FeatureVector::compute(&pose, 0.3, 140.0, Some(300.0), Some(100.0));
        assert_eq!(fv.get(Feature::HeightPx), None);
        assert_eq!(fv.get(Feature::HeightRatio), None);
        assert_eq!(fv.get(Feature::Movement), None);
        assert_eq!(fv.get(Feature::AnkleElevation), None);
        assert!(fv.get(Feature::HipKneeOffset).is_some());
    }

    #[test]
    fn test_movement_uses_previous_height() {
        let fv = FeatureVector::compute(&standing(), 0.3, 140.0, None, Some(150.0));
        assert_eq!(fv.get(Feature::Movement), Some(10.0));
    }

    #[test]
    fn test_ankle_elevation_uses_higher_ankle() {
        // On the floor: ankles sit on the ground line.
        let fv = FeatureVector::compute(&standing(), 0.3, 140.0, Some(160.0), None);
        assert_eq!(fv.get(Feature::AnkleElevation), Some(0.0));

        // Standing on a ledge 70px up with one foot lifted a further 14px.
        let mut pose = standing();
        for k in pose.keypoints.iter_mut() {
            k.y -= 70.0;
            if k.joint == Joint::LeftAnkle {
                k.y -= 14.0;
            }
        }
        let fv = FeatureVector::compute(&pose, 0.3, 140.0, Some(160.0), None);
        assert!((fv.get(Feature::AnkleElevation).unwrap() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_right_angle() {
        let angle = angle_at(Some((0.0, 1.0)), Some((0.0, 0.0)), Some((1.0, 0.0))).unwrap();
        assert!((angle - 90.0).abs() < 1e-9);
        assert_eq!(angle_at(Some((0.0, 0.0)), Some((0.0, 0.0)), Some((1.0, 0.0))), None);
    }

    #[test]
    fn test_count_peaks_respects_amplitude() {
        let series = [0.0, 20.0, 0.0, 5.0, 0.0, 30.0, 10.0];
        assert_eq!(count_peaks(&series, 15.0), 2);
        assert_eq!(count_peaks(&series, 1.0), 3);
        assert_eq!(count_peaks(&[1.0, 2.0], 0.0), 0);
    }

    #[test]
    fn test_feature_names_parse() {
        for f in Feature::ALL {
            assert_eq!(f.as_str().parse::<Feature>().unwrap(), f);
        }
        assert!("wingspan".parse::<Feature>().is_err());
    }
}
