//! Sliding-window rule evaluation.
//!
//! Each stream worker owns one [`EventEvaluator`]. For every enabled rule
//! whose required model outputs are present, the new observation is
//! appended to that (stream, rule) window and the rule's predicate is
//! re-evaluated. A predicate turning true fires exactly one [`Event`] and
//! puts the pair in cool-down until the rule's re-arm condition holds.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use vigil_models::{Event, RiskTier, RuleId, StreamId};

use crate::catalog::RuleSet;
use crate::error::{EngineError, EngineResult};
use crate::observation::{Observation, TrackedPerson};
use crate::rule::{Cooldown, Criterion, PayloadField, PersonMode, Predicate, RoleConstraint, Rule, Thresholds};
use crate::window::TemporalWindow;

/// Evaluator tuning.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Consecutive missing-input ticks before a rule is suspended.
    pub suspend_after_misses: u32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            suspend_after_misses: 5,
        }
    }
}

/// Stream-level inputs to one evaluation tick.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub stream_id: &'a StreamId,
    pub tier: RiskTier,
    /// The stream's current sampling interval.
    pub stream_interval: Duration,
}

/// Why a rule did not evaluate on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    MissingInput,
    Suspended,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::MissingInput => "missing_input",
            SkipReason::Suspended => "suspended",
        }
    }
}

/// Result of one tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub events: Vec<Event>,
    pub skipped: Vec<(RuleId, SkipReason)>,
    /// Rules suspended on this tick.
    pub suspended: Vec<RuleId>,
    /// Rules whose input came back on this tick.
    pub resumed: Vec<RuleId>,
    /// Rules evaluated on this tick.
    pub evaluated: usize,
}

impl TickOutcome {
    pub fn missing_input_count(&self) -> usize {
        self.skipped
            .iter()
            .filter(|(_, r)| matches!(r, SkipReason::MissingInput | SkipReason::Suspended))
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CooldownState {
    Armed,
    Cooling { since: Instant, false_streak: u32 },
}

/// Runtime state of one (stream, rule) pair.
#[derive(Debug)]
struct RuleRuntime {
    fingerprint: u64,
    window: TemporalWindow<Arc<Observation>>,
    cooldown: CooldownState,
    consecutive_misses: u32,
    degraded_ticks: u64,
    suspended: bool,
    events_fired: u64,
}

impl RuleRuntime {
    fn new(fingerprint: u64, capacity: usize) -> Self {
        Self {
            fingerprint,
            window: TemporalWindow::new(capacity),
            cooldown: CooldownState::Armed,
            consecutive_misses: 0,
            degraded_ticks: 0,
            suspended: false,
            events_fired: 0,
        }
    }
}

/// Read-only view of a pair's runtime state.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleStateView {
    pub window_len: usize,
    pub window_capacity: usize,
    pub cooling_down: bool,
    pub suspended: bool,
    pub consecutive_misses: u32,
    pub degraded_ticks: u64,
    pub events_fired: u64,
}

/// Predicate result over the current window.
#[derive(Debug, Clone, Default)]
struct Assessment {
    holds: bool,
    confidence: f64,
    qualifying: usize,
    absences: usize,
    matched_objects: BTreeSet<String>,
    track_ids: Vec<u64>,
}

/// Per-stream rule evaluator.
#[derive(Debug, Default)]
pub struct EventEvaluator {
    config: EvaluatorConfig,
    states: HashMap<(StreamId, RuleId), RuleRuntime>,
}

impl EventEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    /// Evaluate every rule of `rules` against a new observation.
    pub fn evaluate(
        &mut self,
        rules: &RuleSet,
        ctx: EvalContext<'_>,
        observation: Arc<Observation>,
    ) -> EngineResult<TickOutcome> {
        self.sync_rules(ctx.stream_id, rules);

        let mut outcome = TickOutcome::default();
        for rule in rules.rules() {
            if !rule.enabled {
                outcome.skipped.push((rule.id.clone(), SkipReason::Disabled));
                continue;
            }

            let thresholds = rule.thresholds(ctx.tier);
            let capacity = thresholds.capacity(ctx.stream_interval);
            let state = self
                .states
                .entry((ctx.stream_id.clone(), rule.id.clone()))
                .or_insert_with(|| RuleRuntime::new(rule.fingerprint, capacity));

            if !observation.has_models(&rule.required_models) {
                Self::record_miss(&self.config, ctx.stream_id, rule, state, &mut outcome);
                continue;
            }

            if state.suspended {
                info!(stream_id = %ctx.stream_id, rule_id = %rule.id, "Input resumed, rule re-enabled");
                state.suspended = false;
                outcome.resumed.push(rule.id.clone());
            }
            state.consecutive_misses = 0;

            state.window.resize(capacity);
            state.window.push(Arc::clone(&observation));

            let assessment = assess(rule, thresholds, &state.window)?;
            outcome.evaluated += 1;

            if Self::advance_cooldown(&rule.cooldown, state, assessment.holds, observation.at) {
                let event = build_event(rule, thresholds, ctx, &state.window, &observation, &assessment);
                debug!(
                    stream_id = %ctx.stream_id,
                    rule_id = %rule.id,
                    confidence = event.confidence,
                    "Rule fired"
                );
                state.events_fired += 1;
                outcome.events.push(event);
            }
        }
        Ok(outcome)
    }

    /// Record a tick on which no model output arrived at all.
    pub fn record_missing(&mut self, rules: &RuleSet, stream_id: &StreamId, stream_interval: Duration) -> TickOutcome {
        self.sync_rules(stream_id, rules);

        let mut outcome = TickOutcome::default();
        for rule in rules.rules() {
            if !rule.enabled {
                outcome.skipped.push((rule.id.clone(), SkipReason::Disabled));
                continue;
            }
            let capacity = rule.params.capacity(stream_interval);
            let state = self
                .states
                .entry((stream_id.clone(), rule.id.clone()))
                .or_insert_with(|| RuleRuntime::new(rule.fingerprint, capacity));
            Self::record_miss(&self.config, stream_id, rule, state, &mut outcome);
        }
        outcome
    }

    /// Drop every state of `stream_id`.
    pub fn remove_stream(&mut self, stream_id: &StreamId) {
        self.states.retain(|(stream, _), _| stream != stream_id);
    }

    pub fn rule_state(&self, stream_id: &StreamId, rule_id: &RuleId) -> Option<RuleStateView> {
        self.states
            .get(&(stream_id.clone(), rule_id.clone()))
            .map(|s| RuleStateView {
                window_len: s.window.len(),
                window_capacity: s.window.capacity(),
                cooling_down: matches!(s.cooldown, CooldownState::Cooling { .. }),
                suspended: s.suspended,
                consecutive_misses: s.consecutive_misses,
                degraded_ticks: s.degraded_ticks,
                events_fired: s.events_fired,
            })
    }

    /// Rules currently suspended for `stream_id`.
    pub fn suspended_rules(&self, stream_id: &StreamId) -> Vec<RuleId> {
        let mut ids: Vec<RuleId> = self
            .states
            .iter()
            .filter(|((stream, _), s)| stream == stream_id && s.suspended)
            .map(|((_, rule), _)| rule.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop state of removed rules and restart rules whose definition changed.
    fn sync_rules(&mut self, stream_id: &StreamId, rules: &RuleSet) {
        self.states.retain(|(stream, rule_id), state| {
            if stream != stream_id {
                return true;
            }
            match rules.get(rule_id) {
                Some(rule) if rule.fingerprint == state.fingerprint => true,
                Some(_) => {
                    debug!(stream_id = %stream, rule_id = %rule_id, "Rule changed, resetting state");
                    false
                }
                None => false,
            }
        });
    }

    fn record_miss(
        config: &EvaluatorConfig,
        stream_id: &StreamId,
        rule: &Rule,
        state: &mut RuleRuntime,
        outcome: &mut TickOutcome,
    ) {
        state.consecutive_misses = state.consecutive_misses.saturating_add(1);
        state.degraded_ticks += 1;

        if !state.suspended && state.consecutive_misses >= config.suspend_after_misses {
            warn!(
                stream_id = %stream_id,
                rule_id = %rule.id,
                misses = state.consecutive_misses,
                "Required input missing, suspending rule"
            );
            state.suspended = true;
            outcome.suspended.push(rule.id.clone());
        }

        let reason = if state.suspended {
            SkipReason::Suspended
        } else {
            SkipReason::MissingInput
        };
        outcome.skipped.push((rule.id.clone(), reason));
    }

    /// Update cool-down for this evaluation. Returns true if an event fires.
    fn advance_cooldown(cooldown: &Cooldown, state: &mut RuleRuntime, holds: bool, at: Instant) -> bool {
        if let CooldownState::Cooling { since, false_streak } = state.cooldown {
            let false_streak = if holds { 0 } else { false_streak + 1 };
            let quiet = cooldown.quiet_evaluations.is_some_and(|q| false_streak >= q);
            let elapsed = cooldown
                .duration
                .is_some_and(|d| at.saturating_duration_since(since) >= d);
            state.cooldown = if quiet || elapsed {
                CooldownState::Armed
            } else {
                CooldownState::Cooling { since, false_streak }
            };
        }

        if holds && state.cooldown == CooldownState::Armed {
            state.cooldown = CooldownState::Cooling {
                since: at,
                false_streak: 0,
            };
            return true;
        }
        false
    }
}

fn assess(rule: &Rule, thresholds: &Thresholds, window: &TemporalWindow<Arc<Observation>>) -> EngineResult<Assessment> {
    let size = window.len();
    let min_conf = thresholds.min_confidence;
    let mut a = Assessment::default();
    if size == 0 {
        return Ok(a);
    }

    match (&rule.predicate, &thresholds.criterion) {
        (Predicate::Ratio { matcher }, Criterion::Ratio { min_ratio, min_samples }) => {
            for obs in window.iter() {
                if matcher.matches(obs, min_conf) {
                    a.qualifying += 1;
                    a.matched_objects
                        .extend(matcher.matched_objects(obs, min_conf).map(str::to_string));
                }
            }
            let ratio = a.qualifying as f64 / size as f64;
            let needed = min_samples.unwrap_or(window.capacity()).min(window.capacity());
            a.holds = size >= needed && ratio >= *min_ratio;
            a.confidence = ratio;
        }
        (Predicate::Count { matcher }, Criterion::Count { min_hits }) => {
            for obs in window.iter() {
                if matcher.matches(obs, min_conf) {
                    a.qualifying += 1;
                    a.matched_objects
                        .extend(matcher.matched_objects(obs, min_conf).map(str::to_string));
                }
            }
            a.holds = a.qualifying >= *min_hits;
            a.confidence = (a.qualifying as f64 / (*min_hits).max(1) as f64).min(1.0);
        }
        (Predicate::MultiRole { roles, persons, mode }, Criterion::Ratio { min_ratio, min_samples }) => {
            for obs in window.iter() {
                if let Some(ids) = fill_roles(roles, *persons, *mode, &obs.persons) {
                    a.qualifying += 1;
                    a.track_ids = ids;
                }
            }
            let ratio = a.qualifying as f64 / size as f64;
            let needed = min_samples.unwrap_or(window.capacity()).min(window.capacity());
            a.holds = size >= needed && ratio >= *min_ratio;
            a.confidence = ratio;
        }
        (Predicate::KeypointAbsence { joints }, Criterion::Absence { max_appearances }) => {
            for obs in window.iter() {
                let occluded = !obs.persons.is_empty()
                    && obs
                        .persons
                        .iter()
                        .any(|p| joints.iter().any(|&j| p.pose.visible(j, min_conf).is_none()));
                if occluded {
                    a.absences += 1;
                }
            }
            a.qualifying = a.absences;
            a.holds = a.absences > *max_appearances;
            a.confidence = a.absences as f64 / size as f64;
        }
        (predicate, criterion) => {
            return Err(EngineError::internal_invariant(format!(
                "rule {} pairs a {} predicate with {:?}",
                rule.id,
                predicate.kind(),
                criterion
            )));
        }
    }
    Ok(a)
}

/// Assign distinct persons to roles. Returns the assigned track ids.
fn fill_roles(
    roles: &[RoleConstraint],
    required: usize,
    mode: PersonMode,
    persons: &[TrackedPerson],
) -> Option<Vec<u64>> {
    if !mode.admits(persons.len(), required) {
        return None;
    }

    // Kuhn's augmenting-path matching, roles on the left.
    let mut owner: Vec<Option<usize>> = vec![None; persons.len()];
    for role in 0..roles.len() {
        let mut visited = vec![false; persons.len()];
        if !augment(role, roles, persons, &mut owner, &mut visited) {
            return None;
        }
    }

    let mut assigned = vec![0u64; roles.len()];
    for (person, role) in owner.iter().enumerate() {
        if let Some(role) = role {
            assigned[*role] = persons[person].track_id;
        }
    }
    Some(assigned)
}

fn augment(
    role: usize,
    roles: &[RoleConstraint],
    persons: &[TrackedPerson],
    owner: &mut [Option<usize>],
    visited: &mut [bool],
) -> bool {
    for (p, person) in persons.iter().enumerate() {
        if visited[p] || !roles[role].accepts(person) {
            continue;
        }
        visited[p] = true;
        let free = match owner[p] {
            None => true,
            Some(other) => augment(other, roles, persons, owner, visited),
        };
        if free {
            owner[p] = Some(role);
            return true;
        }
    }
    false
}

fn build_event(
    rule: &Rule,
    thresholds: &Thresholds,
    ctx: EvalContext<'_>,
    window: &TemporalWindow<Arc<Observation>>,
    observation: &Observation,
    a: &Assessment,
) -> Event {
    use serde_json::{json, Value};

    let mut payload = serde_json::Map::new();
    for output in &rule.output {
        let value: Value = match output.field {
            PayloadField::Ratio => json!(a.qualifying as f64 / window.len().max(1) as f64),
            PayloadField::Hits => json!(a.qualifying),
            PayloadField::WindowSize => json!(window.len()),
            PayloadField::WindowCapacity => json!(window.capacity()),
            PayloadField::MatchedObjects => json!(a.matched_objects),
            PayloadField::TrackIds => {
                if a.track_ids.is_empty() {
                    json!(observation.persons.iter().map(|p| p.track_id).collect::<Vec<_>>())
                } else {
                    json!(a.track_ids)
                }
            }
            PayloadField::Postures => json!(observation
                .persons
                .iter()
                .map(|p| p.label.to_string())
                .collect::<Vec<_>>()),
            PayloadField::Absences => json!(a.absences),
            PayloadField::RiskTier => json!(ctx.tier.as_str()),
            PayloadField::AnalysisWindowSecs => json!(thresholds.analysis_window.as_secs_f64()),
            PayloadField::FrameSequence => json!(observation.sequence),
        };
        payload.insert(output.name.clone(), value);
    }

    Event {
        id: Uuid::new_v4(),
        rule_id: rule.id.clone(),
        rule_name: rule.name.clone(),
        category: rule.category.clone(),
        stream_id: ctx.stream_id.clone(),
        severity: rule.severity,
        risk_tier: ctx.tier,
        timestamp: observation.captured_at,
        confidence: a.confidence.clamp(0.0, 1.0),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{RuleCatalog, RuleSource};
    use crate::registry::ModelRegistry;
    use chrono::Utc;
    use vigil_models::{BoundingBox, Detection, Joint, Keypoint, ModelCapability, PoseEstimate, PostureLabel};

    fn registry() -> ModelRegistry {
        ModelRegistry::new()
            .with_model("detector", ModelCapability::ObjectDetection)
            .with_model("pose", ModelCapability::PoseEstimation)
    }

    fn rules(json: &str) -> Arc<RuleSet> {
        RuleCatalog::from_source(registry(), RuleSource::Json(json.to_string()))
            .unwrap()
            .snapshot()
    }

    fn phone(confidence: f64) -> Detection {
        Detection {
            class_name: "cell phone".into(),
            confidence,
            bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 5.0, y2: 10.0 },
        }
    }

    fn detector_obs(seq: u64, at: Instant, hit: bool) -> Arc<Observation> {
        let detections = if hit { vec![phone(0.9)] } else { vec![] };
        Arc::new(
            Observation::new(seq, at, Utc::now())
                .with_model("detector")
                .with_detections(detections),
        )
    }

    fn person(track_id: u64, label: &str) -> TrackedPerson {
        TrackedPerson {
            track_id,
            label: PostureLabel::from(label),
            pose: PoseEstimate {
                track_id: Some(track_id),
                bbox: None,
                keypoints: vec![Keypoint { joint: Joint::Nose, x: 0.0, y: 0.0, confidence: 0.9 }],
            },
        }
    }

    fn pose_obs(seq: u64, at: Instant, persons: Vec<TrackedPerson>) -> Arc<Observation> {
        Arc::new(Observation::new(seq, at, Utc::now()).with_model("pose").with_persons(persons))
    }

    const PHONE_RULES: &str = r#"{"rules": [{
        "id": "phone", "category": "violation", "required_models": ["detector"],
        "predicate": {"kind": "count", "match": {"objects": ["cell phone"]}},
        "detection_params": {"analysis_window_secs": 300, "frame_interval_secs": 2, "min_hits": 8},
        "cooldown": {"quiet_evaluations": 3},
        "output_schema": {"fields": {"hits": "integer", "window_capacity": "integer", "risk_tier": "string"}}
    }]}"#;

    fn ctx(stream: &StreamId) -> EvalContext<'_> {
        EvalContext {
            stream_id: stream,
            tier: RiskTier::Medium,
            stream_interval: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_count_rule_fires_on_eighth_hit_once() {
        let set = rules(PHONE_RULES);
        let stream = StreamId::from("cam-1");
        let mut evaluator = EventEvaluator::default();
        let start = Instant::now();

        for seq in 1..=7u64 {
            let at = start + Duration::from_secs(seq * 2);
            let out = evaluator.evaluate(&set, ctx(&stream), detector_obs(seq, at, true)).unwrap();
            assert!(out.events.is_empty(), "fired early at hit {seq}");
        }

        let out = evaluator
            .evaluate(&set, ctx(&stream), detector_obs(8, start + Duration::from_secs(16), true))
            .unwrap();
        assert_eq!(out.events.len(), 1);
        let event = &out.events[0];
        assert_eq!(event.payload["hits"], 8);
        assert_eq!(event.payload["window_capacity"], 150);
        assert_eq!(event.payload["risk_tier"], "medium");
        assert_eq!(event.confidence, 1.0);

        // Ninth hit while still cooling down.
        let out = evaluator
            .evaluate(&set, ctx(&stream), detector_obs(9, start + Duration::from_secs(18), true))
            .unwrap();
        assert!(out.events.is_empty());

        let state = evaluator.rule_state(&stream, &RuleId::from("phone")).unwrap();
        assert_eq!(state.window_capacity, 150);
        assert_eq!(state.window_len, 9);
        assert!(state.cooling_down);
        assert_eq!(state.events_fired, 1);
    }

    #[test]
    fn test_cooldown_holds_while_predicate_stays_true() {
        let doc = r#"{"rules": [{
            "id": "phone", "category": "violation", "required_models": ["detector"],
            "predicate": {"kind": "ratio", "match": {"objects": ["cell phone"]}},
            "detection_params": {"analysis_window_secs": 8, "min_ratio": 0.5},
            "cooldown": {"quiet_evaluations": 2}
        }]}"#;
        let set = rules(doc);
        let stream = StreamId::from("cam-1");
        let mut evaluator = EventEvaluator::default();
        let t = Instant::now();

        // Capacity 4: min_samples defaults to a full window.
        let mut fired = 0;
        for seq in 1..=20u64 {
            let out = evaluator.evaluate(&set, ctx(&stream), detector_obs(seq, t, true)).unwrap();
            fired += out.events.len();
            if seq < 4 {
                assert!(out.events.is_empty());
            }
        }
        assert_eq!(fired, 1);

        // Two false evaluations re-arm; ratio needs the phone back in half the window.
        for seq in 21..=24u64 {
            evaluator.evaluate(&set, ctx(&stream), detector_obs(seq, t, false)).unwrap();
        }
        let mut refired = 0;
        for seq in 25..=26u64 {
            refired += evaluator
                .evaluate(&set, ctx(&stream), detector_obs(seq, t, true))
                .unwrap()
                .events
                .len();
        }
        assert_eq!(refired, 1);
    }

    #[test]
    fn test_cooldown_duration_rearms_while_true() {
        let doc = r#"{"rules": [{
            "id": "phone", "category": "violation", "required_models": ["detector"],
            "predicate": {"kind": "count", "match": {"objects": ["cell phone"]}},
            "detection_params": {"analysis_window_secs": 10, "frame_interval_secs": 1, "min_hits": 1},
            "cooldown": {"duration_secs": 5}
        }]}"#;
        let set = rules(doc);
        let stream = StreamId::from("cam-1");
        let mut evaluator = EventEvaluator::default();
        let start = Instant::now();

        let mut fired_at = Vec::new();
        for s in 0..12u64 {
            let at = start + Duration::from_secs(s);
            let out = evaluator.evaluate(&set, ctx(&stream), detector_obs(s, at, true)).unwrap();
            if !out.events.is_empty() {
                fired_at.push(s);
            }
        }
        assert_eq!(fired_at, vec![0, 5, 10]);
    }

    #[test]
    fn test_ratio_independent_of_arrival_order() {
        let doc = r#"{"rules": [{
            "id": "phone", "category": "violation", "required_models": ["detector"],
            "predicate": {"kind": "ratio", "match": {"objects": ["cell phone"]}},
            "detection_params": {"analysis_window_secs": 10, "frame_interval_secs": 1, "min_ratio": 0.6}
        }]}"#;
        let set = rules(doc);
        let t = Instant::now();
        let patterns: [[bool; 10]; 3] = [
            [true, true, true, true, true, true, false, false, false, false],
            [false, false, false, false, true, true, true, true, true, true],
            [true, false, true, false, true, false, true, true, true, false],
        ];

        for pattern in patterns {
            let stream = StreamId::from("cam-1");
            let mut evaluator = EventEvaluator::default();
            let mut fired = false;
            for (i, hit) in pattern.iter().enumerate() {
                let out = evaluator
                    .evaluate(&set, ctx(&stream), detector_obs(i as u64, t, *hit))
                    .unwrap();
                fired |= !out.events.is_empty();
            }
            assert!(fired, "6/10 should satisfy min_ratio 0.6 for {pattern:?}");
        }

        let stream = StreamId::from("cam-1");
        let mut evaluator = EventEvaluator::default();
        let mut fired = false;
        for i in 0..10u64 {
            let out = evaluator
                .evaluate(&set, ctx(&stream), detector_obs(i, t, i % 2 == 0))
                .unwrap();
            fired |= !out.events.is_empty();
        }
        assert!(!fired, "5/10 must not satisfy min_ratio 0.6");
    }

    #[test]
    fn test_missing_input_skips_and_suspends() {
        let set = rules(PHONE_RULES);
        let stream = StreamId::from("cam-1");
        let mut evaluator = EventEvaluator::new(EvaluatorConfig {
            suspend_after_misses: 3,
        });
        let t = Instant::now();

        evaluator.evaluate(&set, ctx(&stream), detector_obs(1, t, true)).unwrap();

        let pose_only = pose_obs(2, t, vec![]);
        let out = evaluator.evaluate(&set, ctx(&stream), Arc::clone(&pose_only)).unwrap();
        assert_eq!(out.skipped, vec![(RuleId::from("phone"), SkipReason::MissingInput)]);
        evaluator.record_missing(&set, &stream, Duration::from_secs(2));
        let out = evaluator.evaluate(&set, ctx(&stream), pose_only).unwrap();
        assert_eq!(out.suspended, vec![RuleId::from("phone")]);
        assert_eq!(out.skipped, vec![(RuleId::from("phone"), SkipReason::Suspended)]);

        let state = evaluator.rule_state(&stream, &RuleId::from("phone")).unwrap();
        assert_eq!(state.window_len, 1, "missing ticks must not touch the window");
        assert_eq!(state.degraded_ticks, 3);
        assert_eq!(evaluator.suspended_rules(&stream), vec![RuleId::from("phone")]);

        let out = evaluator.evaluate(&set, ctx(&stream), detector_obs(3, t, true)).unwrap();
        assert_eq!(out.resumed, vec![RuleId::from("phone")]);
        assert!(evaluator.suspended_rules(&stream).is_empty());
        assert_eq!(evaluator.rule_state(&stream, &RuleId::from("phone")).unwrap().window_len, 2);
    }

    #[test]
    fn test_tier_override_resizes_window() {
        let doc = r#"{"rules": [{
            "id": "phone", "category": "violation", "required_models": ["detector"],
            "predicate": {"kind": "count", "match": {"objects": ["cell phone"]}},
            "detection_params": {"analysis_window_secs": 20, "min_hits": 5},
            "tier_overrides": {"high": {"analysis_window_secs": 6, "min_hits": 2}}
        }]}"#;
        let set = rules(doc);
        let stream = StreamId::from("cam-1");
        let mut evaluator = EventEvaluator::default();
        let t = Instant::now();

        for seq in 0..6u64 {
            evaluator.evaluate(&set, ctx(&stream), detector_obs(seq, t, false)).unwrap();
        }
        let phone = RuleId::from("phone");
        assert_eq!(evaluator.rule_state(&stream, &phone).unwrap().window_capacity, 10);

        let high = EvalContext {
            stream_id: &stream,
            tier: RiskTier::High,
            stream_interval: Duration::from_secs(1),
        };
        evaluator.evaluate(&set, high, detector_obs(6, t, true)).unwrap();
        let state = evaluator.rule_state(&stream, &phone).unwrap();
        assert_eq!(state.window_capacity, 6);
        assert_eq!(state.window_len, 6);

        // Override min_hits of 2 applies.
        let out = evaluator.evaluate(&set, high, detector_obs(7, t, true)).unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].risk_tier, RiskTier::High);
    }

    #[test]
    fn test_multi_role_needs_distinct_persons() {
        let doc = r#"{
            "calibration_profiles": {"ward": {"postures": {
                "standing": {"bounds": {"height_ratio": {"min": 0.8}}},
                "lying": {"bounds": {"height_ratio": {"max": 0.4}}}
            }}},
            "rules": [{
                "id": "care", "category": "care", "required_models": ["pose"],
                "predicate": {
                    "kind": "multi_role", "persons": 2, "mode": "exactly",
                    "roles": [{"name": "caregiver", "postures": ["standing"]}, {"name": "resident", "postures": ["lying", "standing"]}]
                },
                "detection_params": {"analysis_window_secs": 3, "frame_interval_secs": 1, "min_ratio": 1.0},
                "output_schema": {"fields": {"track_ids": "array"}}
            }]
        }"#;
        let set = rules(doc);
        let stream = StreamId::from("cam-1");
        let mut evaluator = EventEvaluator::default();
        let t = Instant::now();

        // One standing person cannot fill both roles; three persons break "exactly".
        let frames = [
            vec![person(1, "standing")],
            vec![person(1, "standing"), person(2, "lying"), person(3, "lying")],
            vec![person(1, "standing"), person(2, "sitting")],
        ];
        for (i, persons) in frames.into_iter().enumerate() {
            let out = evaluator.evaluate(&set, ctx(&stream), pose_obs(i as u64, t, persons)).unwrap();
            assert!(out.events.is_empty());
        }

        let mut events = Vec::new();
        for seq in 10..13u64 {
            // Only person 2 fits the caregiver role.
            let persons = vec![person(1, "lying"), person(2, "standing")];
            events.extend(evaluator.evaluate(&set, ctx(&stream), pose_obs(seq, t, persons)).unwrap().events);
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["track_ids"], serde_json::json!([2, 1]));
    }

    #[test]
    fn test_keypoint_absence_counts_occluded_entries() {
        let doc = r#"{"rules": [{
            "id": "masked", "category": "security", "required_models": ["pose"],
            "predicate": {"kind": "keypoint_absence", "joints": ["nose"]},
            "detection_params": {"analysis_window_secs": 10, "frame_interval_secs": 1, "max_appearances": 2, "min_confidence": 0.5},
            "output_schema": {"fields": {"absences": "integer"}}
        }]}"#;
        let set = rules(doc);
        let stream = StreamId::from("cam-1");
        let mut evaluator = EventEvaluator::default();
        let t = Instant::now();

        let mut masked = person(1, "unknown");
        masked.pose.keypoints.clear();

        // Empty scenes never count.
        for seq in 0..5u64 {
            let out = evaluator.evaluate(&set, ctx(&stream), pose_obs(seq, t, vec![])).unwrap();
            assert!(out.events.is_empty());
        }
        evaluator.evaluate(&set, ctx(&stream), pose_obs(5, t, vec![masked.clone()])).unwrap();
        evaluator.evaluate(&set, ctx(&stream), pose_obs(6, t, vec![masked.clone()])).unwrap();
        let out = evaluator.evaluate(&set, ctx(&stream), pose_obs(7, t, vec![masked])).unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].payload["absences"], 3);
        assert!((out.events[0].confidence - 3.0 / 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_reload_drops_removed_and_resets_changed_rules() {
        let catalog = RuleCatalog::from_source(registry(), RuleSource::Json(PHONE_RULES.to_string())).unwrap();
        let stream = StreamId::from("cam-1");
        let mut evaluator = EventEvaluator::default();
        let t = Instant::now();

        let set = catalog.snapshot();
        for seq in 0..3u64 {
            evaluator.evaluate(&set, ctx(&stream), detector_obs(seq, t, true)).unwrap();
        }
        let phone = RuleId::from("phone");
        assert_eq!(evaluator.rule_state(&stream, &phone).unwrap().window_len, 3);

        // Same document: state survives.
        let same = catalog.reload(RuleSource::Json(PHONE_RULES.to_string())).unwrap();
        evaluator.evaluate(&same, ctx(&stream), detector_obs(3, t, true)).unwrap();
        assert_eq!(evaluator.rule_state(&stream, &phone).unwrap().window_len, 4);

        // Changed threshold: fresh window.
        let changed = catalog
            .reload(RuleSource::Json(PHONE_RULES.replace("\"min_hits\": 8", "\"min_hits\": 9")))
            .unwrap();
        evaluator.evaluate(&changed, ctx(&stream), detector_obs(4, t, true)).unwrap();
        assert_eq!(evaluator.rule_state(&stream, &phone).unwrap().window_len, 1);

        // Removed rule: state dropped.
        let empty = catalog.reload(RuleSource::Json(r#"{"rules": []}"#.to_string())).unwrap();
        evaluator.evaluate(&empty, ctx(&stream), detector_obs(5, t, true)).unwrap();
        assert!(evaluator.rule_state(&stream, &phone).is_none());
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let set = rules(&PHONE_RULES.replace("\"id\": \"phone\",", "\"id\": \"phone\", \"enabled\": false,"));
        let stream = StreamId::from("cam-1");
        let mut evaluator = EventEvaluator::default();
        let out = evaluator
            .evaluate(&set, ctx(&stream), detector_obs(1, Instant::now(), true))
            .unwrap();
        assert_eq!(out.skipped, vec![(RuleId::from("phone"), SkipReason::Disabled)]);
        assert_eq!(out.evaluated, 0);
    }
}
