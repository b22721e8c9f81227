//! Compiled rules.
//!
//! The catalog turns each [`vigil_models::RuleSpec`] into a [`Rule`] whose
//! predicate is a tagged enum with typed thresholds, so evaluation never
//! looks at strings.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use vigil_models::{Joint, ModelId, PostureLabel, RiskTier, RuleId, Severity};

use crate::observation::{Observation, TrackedPerson};
use crate::window::TemporalWindow;

/// Object confidence used when a rule does not set `min_confidence`.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;

/// A validated, immutable rule shared read-only by every stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    pub category: String,
    pub enabled: bool,
    pub severity: Severity,
    pub required_models: Vec<ModelId>,
    pub predicate: Predicate,
    pub params: Thresholds,
    /// Complete replacement parameter sets per tier.
    pub tier_overrides: HashMap<RiskTier, Thresholds>,
    pub cooldown: Cooldown,
    pub output: Vec<OutputField>,
    /// Hash of the rule's canonical JSON.
    pub fingerprint: u64,
}

impl Rule {
    /// Parameters in force at `tier`.
    pub fn thresholds(&self, tier: RiskTier) -> &Thresholds {
        self.tier_overrides.get(&tier).unwrap_or(&self.params)
    }
}

/// Rule predicate with its per-kind shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Qualifying fraction of the window reaches `min_ratio`.
    Ratio { matcher: ObservationMatcher },
    /// Qualifying entries reach `min_hits`.
    Count { matcher: ObservationMatcher },
    /// Distinct tracked persons fill distinct roles simultaneously.
    MultiRole {
        roles: Vec<RoleConstraint>,
        persons: usize,
        mode: PersonMode,
    },
    /// Required joints occluded more than `max_appearances` times.
    KeypointAbsence { joints: Vec<Joint> },
}

impl Predicate {
    pub fn kind(&self) -> PredicateKind {
        match self {
            Predicate::Ratio { .. } => PredicateKind::Ratio,
            Predicate::Count { .. } => PredicateKind::Count,
            Predicate::MultiRole { .. } => PredicateKind::MultiRole,
            Predicate::KeypointAbsence { .. } => PredicateKind::KeypointAbsence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredicateKind {
    Ratio,
    Count,
    MultiRole,
    KeypointAbsence,
}

impl PredicateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredicateKind::Ratio => "ratio",
            PredicateKind::Count => "count",
            PredicateKind::MultiRole => "multi_role",
            PredicateKind::KeypointAbsence => "keypoint_absence",
        }
    }
}

impl fmt::Display for PredicateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PredicateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ratio" => Ok(PredicateKind::Ratio),
            "count" => Ok(PredicateKind::Count),
            "multi_role" | "multirole" => Ok(PredicateKind::MultiRole),
            "keypoint_absence" | "absence" => Ok(PredicateKind::KeypointAbsence),
            other => Err(format!(
                "unknown predicate kind '{other}' (expected ratio, count, multi_role or keypoint_absence)"
            )),
        }
    }
}

/// Person-count mode of a multi-role predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonMode {
    Exactly,
    AtLeast,
}

impl PersonMode {
    pub fn admits(&self, count: usize, required: usize) -> bool {
        match self {
            PersonMode::Exactly => count == required,
            PersonMode::AtLeast => count >= required,
        }
    }
}

impl FromStr for PersonMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exactly" | "exact" => Ok(PersonMode::Exactly),
            "at_least" | "atleast" | "min" => Ok(PersonMode::AtLeast),
            other => Err(format!("unknown mode '{other}' (expected exactly or at_least)")),
        }
    }
}

/// Per-observation qualification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationMatcher {
    pub objects: Vec<String>,
    pub posture: Option<PostureLabel>,
    pub min_persons: Option<usize>,
    pub max_persons: Option<usize>,
}

impl ObservationMatcher {
    /// Whether every configured condition holds for `obs`.
    pub fn matches(&self, obs: &Observation, min_confidence: f64) -> bool {
        if !self.objects.is_empty() && !self.objects.iter().any(|o| obs.has_object(o, min_confidence)) {
            return false;
        }
        if let Some(posture) = &self.posture {
            if !obs.persons.iter().any(|p| &p.label == posture) {
                return false;
            }
        }
        let persons = obs.person_count();
        self.min_persons.map_or(true, |min| persons >= min) && self.max_persons.map_or(true, |max| persons <= max)
    }

    /// Configured object classes present in `obs`.
    pub fn matched_objects<'a>(&'a self, obs: &Observation, min_confidence: f64) -> impl Iterator<Item = &'a str> + 'a {
        let present: Vec<bool> = self.objects.iter().map(|o| obs.has_object(o, min_confidence)).collect();
        self.objects
            .iter()
            .zip(present)
            .filter_map(|(o, hit)| hit.then_some(o.as_str()))
    }
}

/// One role of a multi-role predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleConstraint {
    pub name: String,
    /// Accepted labels; empty accepts anyone.
    pub postures: Vec<PostureLabel>,
}

impl RoleConstraint {
    pub fn accepts(&self, person: &TrackedPerson) -> bool {
        self.postures.is_empty() || self.postures.contains(&person.label)
    }
}

/// Typed threshold for the predicate kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    /// Ratio and multi-role.
    Ratio { min_ratio: f64, min_samples: Option<usize> },
    Count { min_hits: usize },
    Absence { max_appearances: usize },
}

/// Resolved numeric parameters for one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub analysis_window: Duration,
    /// Sampling interval assumed for window capacity; falls back to the
    /// stream's current interval.
    pub frame_interval: Option<Duration>,
    pub min_confidence: f64,
    pub criterion: Criterion,
}

impl Thresholds {
    /// Window capacity for a stream sampled every `stream_interval`.
    pub fn capacity(&self, stream_interval: Duration) -> usize {
        let interval = self.frame_interval.unwrap_or(stream_interval);
        TemporalWindow::<()>::capacity_for(self.analysis_window, interval)
    }
}

/// Re-arm conditions after an event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cooldown {
    pub duration: Option<Duration>,
    pub quiet_evaluations: Option<u32>,
}

/// Declared payload field.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputField {
    pub name: String,
    pub field: PayloadField,
}

/// Values an event payload may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadField {
    Ratio,
    Hits,
    WindowSize,
    WindowCapacity,
    MatchedObjects,
    TrackIds,
    Postures,
    Absences,
    RiskTier,
    AnalysisWindowSecs,
    FrameSequence,
}

impl PayloadField {
    pub const ALL: [PayloadField; 11] = [
        PayloadField::Ratio,
        PayloadField::Hits,
        PayloadField::WindowSize,
        PayloadField::WindowCapacity,
        PayloadField::MatchedObjects,
        PayloadField::TrackIds,
        PayloadField::Postures,
        PayloadField::Absences,
        PayloadField::RiskTier,
        PayloadField::AnalysisWindowSecs,
        PayloadField::FrameSequence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadField::Ratio => "ratio",
            PayloadField::Hits => "hits",
            PayloadField::WindowSize => "window_size",
            PayloadField::WindowCapacity => "window_capacity",
            PayloadField::MatchedObjects => "matched_objects",
            PayloadField::TrackIds => "track_ids",
            PayloadField::Postures => "postures",
            PayloadField::Absences => "absences",
            PayloadField::RiskTier => "risk_tier",
            PayloadField::AnalysisWindowSecs => "analysis_window_secs",
            PayloadField::FrameSequence => "frame_sequence",
        }
    }

    /// JSON type name accepted in an output schema.
    pub fn json_type(&self) -> &'static str {
        match self {
            PayloadField::Ratio | PayloadField::AnalysisWindowSecs => "number",
            PayloadField::Hits
            | PayloadField::WindowSize
            | PayloadField::WindowCapacity
            | PayloadField::Absences
            | PayloadField::FrameSequence => "integer",
            PayloadField::RiskTier => "string",
            PayloadField::MatchedObjects | PayloadField::TrackIds | PayloadField::Postures => "array",
        }
    }

    /// Whether a schema declaring `declared` accepts this field.
    /// `number` also admits integer fields.
    pub fn accepts_type(&self, declared: &str) -> bool {
        let declared = declared.trim().to_lowercase();
        declared == self.json_type() || (declared == "number" && self.json_type() == "integer")
    }
}

impl FromStr for PayloadField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == name)
            .ok_or_else(|| format!("unknown payload field '{s}'"))
    }
}
