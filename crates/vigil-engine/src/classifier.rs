//! Debounced posture classification.
//!
//! Every frame, each tracked person's keypoints are turned into a
//! [`FeatureVector`] and the frame *votes* for the highest-priority posture
//! whose bounds hold (or `unknown`). A named label is only published after
//! `min_consecutive_frames` consecutive votes for it; any frame voting
//! otherwise drops the label back to `unknown` at once.
//!
//! # Calibration
//! Posture definitions live in a [`CalibrationProfile`] compiled from the
//! rule document. Profiles are data: the classifier knows nothing about
//! particular postures.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use vigil_models::{BoundSpec, CalibrationProfileSpec, Joint, PoseEstimate, PostureLabel};

use crate::geometry::{count_peaks, variance, Feature, FeatureVector};

/// Joints checked for the indeterminate state when no posture declares any.
const DEFAULT_CORE_JOINTS: [Joint; 5] = [
    Joint::Nose,
    Joint::LeftShoulder,
    Joint::RightShoulder,
    Joint::LeftHip,
    Joint::RightHip,
];

/// A profile problem found while compiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileIssue {
    pub field: String,
    pub message: String,
}

impl ProfileIssue {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Variance gate.
#[derive(Debug, Clone, PartialEq)]
pub struct SteadyGate {
    pub feature: Feature,
    pub variance_threshold: f64,
}

/// Oscillation requirement of a composite posture.
#[derive(Debug, Clone, PartialEq)]
pub struct NodPattern {
    /// Indices into [`CalibrationProfile::postures`].
    pub base: Vec<usize>,
    pub metric: Feature,
    pub window: usize,
    pub count_min: usize,
    pub min_amplitude: f64,
}

/// Compiled posture definition.
#[derive(Debug, Clone, PartialEq)]
pub struct PostureDef {
    pub label: PostureLabel,
    pub bounds: Vec<(Feature, BoundSpec)>,
    pub required_joints: Vec<Joint>,
    pub min_consecutive_frames: u32,
    pub steady: Option<SteadyGate>,
    pub composite: Option<NodPattern>,
}

/// Compiled calibration profile. Postures are stored in priority order.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationProfile {
    pub name: String,
    pub postures: Vec<PostureDef>,
    pub min_joint_confidence: f64,
    pub min_consecutive_frames: u32,
    pub stability_window: usize,
    pub analysis_window_frames: usize,
    pub reference_height_px: f64,
    pub ground_line_px: Option<f64>,
    pub track_ttl_frames: u64,
    core_joints: Vec<Joint>,
    history_len: usize,
}

impl CalibrationProfile {
    /// Profile with no postures; every person settles to `unknown`.
    pub fn empty() -> Self {
        let spec = CalibrationProfileSpec::default();
        Self {
            name: "default".to_string(),
            postures: Vec::new(),
            min_joint_confidence: spec.min_joint_confidence,
            min_consecutive_frames: spec.min_consecutive_frames,
            stability_window: spec.stability_window as usize,
            analysis_window_frames: spec.analysis_window_frames as usize,
            reference_height_px: spec.reference_height_px,
            ground_line_px: spec.ground_line_px,
            track_ttl_frames: u64::from(spec.track_ttl_frames),
            core_joints: DEFAULT_CORE_JOINTS.to_vec(),
            history_len: spec.stability_window as usize,
        }
    }

    /// Compile a profile, collecting every problem.
    pub fn compile(name: &str, spec: &CalibrationProfileSpec) -> Result<Self, Vec<ProfileIssue>> {
        let mut issues = Vec::new();

        // Priority order: listed names first, then the rest alphabetically.
        let mut order: Vec<&String> = Vec::new();
        for (i, p) in spec.priority.iter().enumerate() {
            if !spec.postures.contains_key(p) {
                issues.push(ProfileIssue::new(
                    format!("priority[{i}]"),
                    format!("references undeclared posture '{p}'"),
                ));
            } else if !order.contains(&p) {
                order.push(p);
            }
        }
        for posture in spec.postures.keys() {
            if !order.contains(&posture) {
                order.push(posture);
            }
        }

        let index_of = |posture: &str| order.iter().position(|n| n.as_str() == posture);

        let mut postures = Vec::with_capacity(order.len());
        for posture_name in &order {
            let Some(p) = spec.postures.get(*posture_name) else {
                continue;
            };
            let field = |f: &str| format!("postures.{posture_name}.{f}");

            if matches!(posture_name.as_str(), PostureLabel::UNKNOWN | PostureLabel::INDETERMINATE) {
                issues.push(ProfileIssue::new(
                    format!("postures.{posture_name}"),
                    "reserved posture name",
                ));
            }

            let mut bounds = Vec::new();
            for (feature_name, bound) in &p.bounds {
                match feature_name.parse::<Feature>() {
                    Ok(feature) => {
                        if let (Some(min), Some(max)) = (bound.min, bound.max) {
                            if min > max {
                                issues.push(ProfileIssue::new(
                                    field(&format!("bounds.{feature_name}")),
                                    "min is greater than max",
                                ));
                            }
                        }
                        bounds.push((feature, *bound));
                    }
                    Err(e) => issues.push(ProfileIssue::new(field(&format!("bounds.{feature_name}")), e.to_string())),
                }
            }

            let mut required_joints = Vec::new();
            for (i, joint) in p.required_joints.iter().enumerate() {
                match joint.parse::<Joint>() {
                    Ok(j) => required_joints.push(j),
                    Err(e) => issues.push(ProfileIssue::new(field(&format!("required_joints[{i}]")), e.to_string())),
                }
            }

            if p.min_consecutive_frames == Some(0) {
                issues.push(ProfileIssue::new(field("min_consecutive_frames"), "must be at least 1"));
            }

            let steady = match &p.steady {
                Some(s) => match s.feature.parse::<Feature>() {
                    Ok(feature) if s.variance_threshold >= 0.0 => Some(SteadyGate {
                        feature,
                        variance_threshold: s.variance_threshold,
                    }),
                    Ok(_) => {
                        issues.push(ProfileIssue::new(field("steady.variance_threshold"), "must not be negative"));
                        None
                    }
                    Err(e) => {
                        issues.push(ProfileIssue::new(field("steady.feature"), e.to_string()));
                        None
                    }
                },
                None => None,
            };

            let composite = match &p.composite {
                Some(c) => {
                    let mut base = Vec::new();
                    for b in &c.base {
                        match index_of(b) {
                            Some(idx) if b != *posture_name => base.push(idx),
                            _ => issues.push(ProfileIssue::new(
                                field("composite.base"),
                                format!("references undeclared base posture '{b}'"),
                            )),
                        }
                    }
                    if c.base.is_empty() {
                        issues.push(ProfileIssue::new(field("composite.base"), "needs at least one base posture"));
                    }
                    if c.nod.nod_detection_window < 3 {
                        issues.push(ProfileIssue::new(field("composite.nod.nod_detection_window"), "must be at least 3"));
                    }
                    if c.nod.nod_count_min == 0 {
                        issues.push(ProfileIssue::new(field("composite.nod.nod_count_min"), "must be at least 1"));
                    }
                    match c.nod.metric.parse::<Feature>() {
                        Ok(metric) => Some(NodPattern {
                            base,
                            metric,
                            window: c.nod.nod_detection_window as usize,
                            count_min: c.nod.nod_count_min as usize,
                            min_amplitude: c.nod.min_amplitude,
                        }),
                        Err(e) => {
                            issues.push(ProfileIssue::new(field("composite.nod.metric"), e.to_string()));
                            None
                        }
                    }
                }
                None => None,
            };

            postures.push(PostureDef {
                label: PostureLabel::named(posture_name.as_str()),
                bounds,
                required_joints,
                min_consecutive_frames: p.min_consecutive_frames.unwrap_or(spec.min_consecutive_frames),
                steady,
                composite,
            });
        }

        // Composite bases must not themselves be composite.
        for def in &postures {
            if let Some(c) = &def.composite {
                if c.base.iter().any(|&b| postures[b].composite.is_some()) {
                    issues.push(ProfileIssue::new(
                        format!("postures.{}.composite.base", def.label),
                        "base posture must not be composite",
                    ));
                }
            }
        }

        if !issues.is_empty() {
            return Err(issues);
        }

        let mut core_joints: Vec<Joint> = postures
            .iter()
            .flat_map(|p| p.required_joints.iter().copied())
            .collect();
        core_joints.sort();
        core_joints.dedup();
        if core_joints.is_empty() {
            core_joints = DEFAULT_CORE_JOINTS.to_vec();
        }

        let stability_window = spec.stability_window.max(2) as usize;
        let history_len = postures
            .iter()
            .filter_map(|p| p.composite.as_ref().map(|c| c.window))
            .max()
            .unwrap_or(0)
            .max(stability_window);

        Ok(Self {
            name: name.to_string(),
            postures,
            min_joint_confidence: spec.min_joint_confidence,
            min_consecutive_frames: spec.min_consecutive_frames.max(1),
            stability_window,
            analysis_window_frames: spec.analysis_window_frames.max(1) as usize,
            reference_height_px: spec.reference_height_px,
            ground_line_px: spec.ground_line_px,
            track_ttl_frames: u64::from(spec.track_ttl_frames.max(1)),
            core_joints,
            history_len,
        })
    }

    /// Whether `label` is a posture this profile can produce.
    pub fn declares(&self, label: &PostureLabel) -> bool {
        !label.is_named() || self.postures.iter().any(|p| &p.label == label)
    }

    /// True when `other` differs from this profile at most in bound values,
    /// as after a recalibration.
    pub fn same_shape(&self, other: &Self) -> bool {
        if self.postures.len() != other.postures.len() {
            return false;
        }
        let mut aligned = other.clone();
        for (theirs, ours) in aligned.postures.iter_mut().zip(&self.postures) {
            if theirs.bounds.len() != ours.bounds.len()
                || theirs.bounds.iter().zip(&ours.bounds).any(|(a, b)| a.0 != b.0)
            {
                return false;
            }
            theirs.bounds.clone_from(&ours.bounds);
        }
        aligned == *self
    }

    fn debounce_for(&self, vote: &PostureLabel) -> u32 {
        self.postures
            .iter()
            .find(|p| &p.label == vote)
            .map(|p| p.min_consecutive_frames)
            .unwrap_or(self.min_consecutive_frames)
            .max(1)
    }
}

/// Classifier output for one person on one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PostureReading {
    pub track_id: u64,
    /// Published (debounced) label.
    pub label: PostureLabel,
    /// This frame's raw vote.
    pub vote: PostureLabel,
    /// Consecutive votes for the current candidate.
    pub consecutive: u32,
    /// When the published label last changed.
    pub stable_since: Option<Instant>,
    /// Geometry this frame's vote was taken on.
    pub features: FeatureVector,
}

/// Per-person classifier state.
#[derive(Debug, Clone)]
struct ActionState {
    label: PostureLabel,
    candidate: PostureLabel,
    consecutive: u32,
    stable_since: Option<Instant>,
    history: VecDeque<FeatureVector>,
    /// true = core joints visible on that frame.
    visibility: VecDeque<bool>,
    last_height_px: Option<f64>,
    last_seen_frame: u64,
}

impl ActionState {
    fn new(frame: u64) -> Self {
        Self {
            label: PostureLabel::Unknown,
            candidate: PostureLabel::Unknown,
            consecutive: 0,
            stable_since: None,
            history: VecDeque::new(),
            visibility: VecDeque::new(),
            last_height_px: None,
            last_seen_frame: frame,
        }
    }
}

/// Per-stream posture classifier. Owned by the stream's worker.
#[derive(Debug)]
pub struct ActionClassifier {
    profile: Arc<CalibrationProfile>,
    tracks: HashMap<u64, ActionState>,
    frame: u64,
}

impl ActionClassifier {
    pub fn new(profile: Arc<CalibrationProfile>) -> Self {
        Self {
            profile,
            tracks: HashMap::new(),
            frame: 0,
        }
    }

    pub fn profile(&self) -> &Arc<CalibrationProfile> {
        &self.profile
    }

    /// Swap the profile. Tracked state restarts if the definition changed
    /// beyond bound values.
    pub fn set_profile(&mut self, profile: Arc<CalibrationProfile>) {
        if !self.profile.same_shape(&profile) {
            debug!(profile = %profile.name, "Calibration profile changed, resetting tracks");
            self.tracks.clear();
        }
        self.profile = profile;
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
        self.frame = 0;
    }

    /// Classify every person in one frame.
    ///
    /// Persons without a tracker id are keyed by their index in `poses`.
    pub fn classify(&mut self, poses: &[PoseEstimate], at: Instant) -> Vec<PostureReading> {
        self.frame += 1;
        let frame = self.frame;
        let profile = Arc::clone(&self.profile);

        let mut readings = Vec::with_capacity(poses.len());
        for (idx, pose) in poses.iter().enumerate() {
            let track_id = pose.track_id.unwrap_or(idx as u64);
            let state = self.tracks.entry(track_id).or_insert_with(|| ActionState::new(frame));
            state.last_seen_frame = frame;
            readings.push(Self::step(&profile, state, track_id, pose, at));
        }

        let ttl = profile.track_ttl_frames;
        self.tracks.retain(|_, s| frame - s.last_seen_frame < ttl);

        readings
    }

    fn step(
        profile: &CalibrationProfile,
        state: &mut ActionState,
        track_id: u64,
        pose: &PoseEstimate,
        at: Instant,
    ) -> PostureReading {
        let features = FeatureVector::compute(
            pose,
            profile.min_joint_confidence,
            profile.reference_height_px,
            profile.ground_line_px,
            state.last_height_px,
        );
        if let Some(h) = features.get(Feature::HeightPx) {
            state.last_height_px = Some(h);
        }

        push_capped(&mut state.history, features, profile.history_len);
        let visible = profile
            .core_joints
            .iter()
            .all(|&j| pose.visible(j, profile.min_joint_confidence).is_some());
        push_capped(&mut state.visibility, visible, profile.analysis_window_frames);

        let occluded = state.visibility.iter().filter(|v| !**v).count();
        if occluded * 2 > profile.analysis_window_frames {
            if state.label != PostureLabel::Indeterminate {
                state.label = PostureLabel::Indeterminate;
                state.stable_since = Some(at);
            }
            state.candidate = PostureLabel::Unknown;
            state.consecutive = 0;
            return PostureReading {
                track_id,
                label: state.label.clone(),
                vote: PostureLabel::Indeterminate,
                consecutive: 0,
                stable_since: state.stable_since,
                features,
            };
        }

        let vote = Self::vote(profile, state, pose, &features);

        if vote == state.candidate {
            state.consecutive = state.consecutive.saturating_add(1);
        } else {
            state.candidate = vote.clone();
            state.consecutive = 1;
        }

        // Leaving a posture is immediate; entering one is debounced.
        if vote != state.label && state.label != PostureLabel::Unknown {
            debug!(track_id, from = %state.label, "Posture lost");
            state.label = PostureLabel::Unknown;
            state.stable_since = Some(at);
        }

        if state.candidate.is_named()
            && state.consecutive >= profile.debounce_for(&state.candidate)
            && state.label != state.candidate
        {
            debug!(
                track_id,
                from = %state.label,
                to = %state.candidate,
                frames = state.consecutive,
                "Posture changed"
            );
            state.label = state.candidate.clone();
            state.stable_since = Some(at);
        }

        PostureReading {
            track_id,
            label: state.label.clone(),
            vote,
            consecutive: state.consecutive,
            stable_since: state.stable_since,
            features,
        }
    }

    /// Highest-priority qualifying posture, or `unknown`.
    fn vote(
        profile: &CalibrationProfile,
        state: &ActionState,
        pose: &PoseEstimate,
        features: &FeatureVector,
    ) -> PostureLabel {
        for def in &profile.postures {
            if !Self::shape_holds(profile, def, pose, features) {
                continue;
            }

            if let Some(nod) = &def.composite {
                let base_holds = nod
                    .base
                    .iter()
                    .any(|&b| Self::shape_holds(profile, &profile.postures[b], pose, features));
                if !base_holds {
                    continue;
                }
                let series: Vec<f64> = state
                    .history
                    .iter()
                    .rev()
                    .take(nod.window)
                    .rev()
                    .filter_map(|fv| fv.get(nod.metric))
                    .collect();
                if count_peaks(&series, nod.min_amplitude) < nod.count_min {
                    continue;
                }
            }

            if let Some(gate) = &def.steady {
                let recent: Vec<f64> = state
                    .history
                    .iter()
                    .rev()
                    .take(profile.stability_window)
                    .filter_map(|fv| fv.get(gate.feature))
                    .collect();
                if variance(&recent) > gate.variance_threshold {
                    // Bounds hold but the person is not still.
                    return PostureLabel::Unknown;
                }
            }

            return def.label.clone();
        }
        PostureLabel::Unknown
    }

    fn shape_holds(profile: &CalibrationProfile, def: &PostureDef, pose: &PoseEstimate, features: &FeatureVector) -> bool {
        def.required_joints
            .iter()
            .all(|&j| pose.visible(j, profile.min_joint_confidence).is_some())
            && def
                .bounds
                .iter()
                .all(|(feature, bound)| features.get(*feature).is_some_and(|v| bound.contains(v)))
    }
}

fn push_capped<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    if buf.len() >= cap.max(1) {
        buf.pop_front();
    }
    buf.push_back(value);
}
