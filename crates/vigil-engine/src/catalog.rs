//! Rule catalog: load, validate, compile and publish rule sets.
//!
//! A document is validated as a whole. Every problem across every rule is
//! collected into one [`CatalogError::Validation`]; nothing is published
//! unless the whole document is valid. Publishing swaps an `Arc<RuleSet>`
//! under a short write lock, so readers holding a snapshot keep evaluating
//! against it while a reload happens.

use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};
use validator::{Validate, ValidationErrors};

use vigil_models::{
    CalibrationProfileSpec, DetectionParams, Joint, ModelCapability, PostureLabel, PredicateSpec, RuleDocument,
    RuleId, RuleSpec,
};

use crate::classifier::CalibrationProfile;
use crate::error::{CatalogError, CatalogResult, EngineError, EngineResult, RuleViolation};
use crate::registry::ModelRegistry;
use crate::rule::{
    Cooldown, Criterion, ObservationMatcher, OutputField, PayloadField, PersonMode, Predicate, PredicateKind,
    RoleConstraint, Rule, Thresholds, DEFAULT_MIN_CONFIDENCE,
};
use crate::window::{TemporalWindow, MAX_WINDOW_CAPACITY};

/// Subject used for document-level violations.
const DOCUMENT: &str = "document";

/// Where a rule document comes from.
#[derive(Debug, Clone)]
pub enum RuleSource {
    Json(String),
    File(PathBuf),
    Document(RuleDocument),
}

impl RuleSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }
}

/// Immutable, validated rule set.
#[derive(Debug, Clone)]
pub struct RuleSet {
    generation: u64,
    rules: Vec<Arc<Rule>>,
    index: HashMap<RuleId, usize>,
    profiles: BTreeMap<String, Arc<CalibrationProfile>>,
    default_profile: Arc<CalibrationProfile>,
    document: RuleDocument,
}

impl RuleSet {
    /// Set with no rules, as published before the first load.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            rules: Vec::new(),
            index: HashMap::new(),
            profiles: BTreeMap::new(),
            default_profile: Arc::new(CalibrationProfile::empty()),
            document: RuleDocument::default(),
        }
    }

    /// Publication counter; 0 until published.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn version(&self) -> Option<&str> {
        self.document.version.as_deref()
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn get(&self, id: &RuleId) -> Option<&Arc<Rule>> {
        self.index.get(id).map(|&i| &self.rules[i])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.iter().filter(|r| r.enabled).count()
    }

    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Profile selected by the document.
    pub fn default_profile(&self) -> &Arc<CalibrationProfile> {
        &self.default_profile
    }

    /// Profile for a stream: the named one, or the document's selection.
    pub fn resolve_profile(&self, name: Option<&str>) -> EngineResult<Arc<CalibrationProfile>> {
        match name {
            None => Ok(Arc::clone(&self.default_profile)),
            Some(name) => self
                .profiles
                .get(name)
                .cloned()
                .ok_or_else(|| EngineError::UnknownProfile(name.to_string())),
        }
    }

    /// The document this set was compiled from.
    pub fn document(&self) -> &RuleDocument {
        &self.document
    }
}

/// Owner of the published rule set.
#[derive(Debug)]
pub struct RuleCatalog {
    registry: ModelRegistry,
    published: RwLock<Arc<RuleSet>>,
}

impl RuleCatalog {
    /// Catalog publishing an empty rule set.
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            published: RwLock::new(Arc::new(RuleSet::empty())),
        }
    }

    /// Catalog with `source` loaded and published.
    pub fn from_source(registry: ModelRegistry, source: RuleSource) -> CatalogResult<Self> {
        let catalog = Self::new(registry);
        catalog.reload(source)?;
        Ok(catalog)
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Parse, validate and compile `source` without publishing it.
    pub fn load(&self, source: RuleSource) -> CatalogResult<RuleSet> {
        let (document, violations) = parse_source(source)?;
        compile_document(&self.registry, document, violations)
    }

    /// Load `source` and atomically publish it.
    ///
    /// On failure the previously published set stays in place.
    pub fn reload(&self, source: RuleSource) -> CatalogResult<Arc<RuleSet>> {
        let mut set = match self.load(source) {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "Rule reload rejected, keeping current rule set");
                return Err(e);
            }
        };

        let mut guard = self.published.write().unwrap_or_else(|e| e.into_inner());
        set.generation = guard.generation + 1;
        let set = Arc::new(set);
        *guard = Arc::clone(&set);
        drop(guard);

        info!(
            generation = set.generation,
            rules = set.len(),
            enabled = set.enabled_count(),
            profiles = set.profiles.len(),
            "Rule set published"
        );
        Ok(set)
    }

    /// Currently published set. Never blocks on evaluation.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.published.read().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Lenient top-level shape so one malformed rule does not hide the others.
#[derive(Deserialize)]
struct RawDocument {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    calibration_profile: Option<String>,
    #[serde(default)]
    calibration_profiles: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    rules: Vec<serde_json::Value>,
}

fn parse_source(source: RuleSource) -> CatalogResult<(RuleDocument, Vec<RuleViolation>)> {
    let text = match source {
        RuleSource::Document(doc) => return Ok((doc, Vec::new())),
        RuleSource::Json(text) => text,
        RuleSource::File(path) => std::fs::read_to_string(&path)?,
    };

    let raw: RawDocument = serde_json::from_str(&text)?;
    let mut violations = Vec::new();

    let mut calibration_profiles = BTreeMap::new();
    for (name, value) in raw.calibration_profiles {
        match serde_json::from_value::<CalibrationProfileSpec>(value) {
            Ok(spec) => {
                calibration_profiles.insert(name, spec);
            }
            Err(e) => violations.push(RuleViolation::new(
                format!("calibration_profiles.{name}"),
                "",
                e.to_string(),
            )),
        }
    }

    let mut rules = Vec::with_capacity(raw.rules.len());
    for (i, value) in raw.rules.into_iter().enumerate() {
        let subject = value
            .get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("rules[{i}]"));
        match serde_json::from_value::<RuleSpec>(value) {
            Ok(spec) => rules.push(spec),
            Err(e) => violations.push(RuleViolation::new(subject, "", e.to_string())),
        }
    }

    let document = RuleDocument {
        version: raw.version,
        calibration_profile: raw.calibration_profile,
        calibration_profiles,
        rules,
    };
    Ok((document, violations))
}

/// Violation collector for one subject.
struct Violations<'a> {
    subject: String,
    list: &'a mut Vec<RuleViolation>,
    before: usize,
}

impl<'a> Violations<'a> {
    fn new(subject: impl Into<String>, list: &'a mut Vec<RuleViolation>) -> Self {
        let before = list.len();
        Self {
            subject: subject.into(),
            list,
            before,
        }
    }

    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.list.push(RuleViolation::new(self.subject.clone(), field, message));
    }

    fn extend_validation(&mut self, prefix: &str, result: Result<(), ValidationErrors>) {
        let Err(errors) = result else {
            return;
        };
        let mut fields: Vec<(String, Vec<String>)> = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let messages = errs
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                (field.to_string(), messages)
            })
            .collect();
        fields.sort();
        for (field, messages) in fields {
            for message in messages {
                self.push(join_field(prefix, &field), message);
            }
        }
    }

    /// Whether anything was reported since this collector was created.
    fn any(&self) -> bool {
        self.list.len() > self.before
    }
}

fn join_field(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn compile_document(
    registry: &ModelRegistry,
    document: RuleDocument,
    mut violations: Vec<RuleViolation>,
) -> CatalogResult<RuleSet> {
    let mut profiles = BTreeMap::new();
    for (name, spec) in &document.calibration_profiles {
        let mut v = Violations::new(format!("calibration_profiles.{name}"), &mut violations);
        v.extend_validation("", spec.validate());
        match CalibrationProfile::compile(name, spec) {
            Ok(profile) => {
                profiles.insert(name.clone(), Arc::new(profile));
            }
            Err(issues) => {
                for issue in issues {
                    v.push(issue.field, issue.message);
                }
            }
        }
    }

    let default_profile = match &document.calibration_profile {
        Some(name) => match profiles.get(name) {
            Some(profile) => Arc::clone(profile),
            None => {
                if !document.calibration_profiles.contains_key(name) {
                    violations.push(RuleViolation::new(
                        DOCUMENT,
                        "calibration_profile",
                        format!("selects unknown calibration profile '{name}'"),
                    ));
                }
                Arc::new(CalibrationProfile::empty())
            }
        },
        None if document.calibration_profiles.len() > 1 => {
            violations.push(RuleViolation::new(
                DOCUMENT,
                "calibration_profile",
                "is required when several calibration profiles are defined",
            ));
            Arc::new(CalibrationProfile::empty())
        }
        None => profiles
            .values()
            .next()
            .cloned()
            .unwrap_or_else(|| Arc::new(CalibrationProfile::empty())),
    };

    // Postures any selectable profile can produce.
    let declared: HashSet<String> = document
        .calibration_profiles
        .values()
        .flat_map(|p| p.postures.keys().cloned())
        .collect();

    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(document.rules.len());
    for (i, spec) in document.rules.iter().enumerate() {
        let subject = if spec.id.is_empty() {
            format!("rules[{i}]")
        } else {
            spec.id.clone()
        };
        if !spec.id.is_empty() && !seen.insert(spec.id.clone()) {
            violations.push(RuleViolation::new(&subject, "id", "duplicate rule id"));
        }
        if let Some(rule) = compile_rule(registry, &declared, spec, Violations::new(subject, &mut violations)) {
            rules.push(Arc::new(rule));
        }
    }

    if !violations.is_empty() {
        return Err(CatalogError::validation(violations));
    }

    let index = rules
        .iter()
        .enumerate()
        .map(|(i, r): (usize, &Arc<Rule>)| (r.id.clone(), i))
        .collect();

    Ok(RuleSet {
        generation: 0,
        rules,
        index,
        profiles,
        default_profile,
        document,
    })
}

fn compile_rule(
    registry: &ModelRegistry,
    declared_postures: &HashSet<String>,
    spec: &RuleSpec,
    mut v: Violations<'_>,
) -> Option<Rule> {
    v.extend_validation("", spec.validate());

    let mut capabilities = HashSet::new();
    let mut models_known = true;
    if spec.required_models.is_empty() {
        v.push("required_models", "at least one model is required");
    }
    for (i, model) in spec.required_models.iter().enumerate() {
        match registry.capability(model) {
            Some(capability) => {
                capabilities.insert(capability);
            }
            None => {
                models_known = false;
                v.push(format!("required_models[{i}]"), format!("unknown model '{model}'"));
            }
        }
    }

    let kind = match spec.predicate.kind.parse::<PredicateKind>() {
        Ok(kind) => Some(kind),
        Err(message) => {
            v.push("predicate.kind", message);
            None
        }
    };

    let predicate = kind.and_then(|kind| compile_predicate(kind, &spec.predicate, declared_postures, &mut v));

    if let Some(predicate) = &predicate {
        if models_known && !spec.required_models.is_empty() {
            let (needs_objects, needs_pose) = match predicate {
                Predicate::Ratio { matcher } | Predicate::Count { matcher } => {
                    (!matcher.objects.is_empty(), matcher.posture.is_some())
                }
                Predicate::MultiRole { .. } | Predicate::KeypointAbsence { .. } => (false, true),
            };
            if needs_objects && !capabilities.contains(&ModelCapability::ObjectDetection) {
                v.push(
                    "required_models",
                    "object matching needs an object_detection model",
                );
            }
            if needs_pose && !capabilities.contains(&ModelCapability::PoseEstimation) {
                v.push("required_models", "posture and keypoint predicates need a pose_estimation model");
            }
        }
    }

    let params = kind.and_then(|kind| compile_thresholds(kind, &spec.detection_params, "detection_params", &mut v));

    let mut tier_overrides = HashMap::new();
    if let Some(kind) = kind {
        let mut tiers: Vec<_> = spec.tier_overrides.iter().collect();
        tiers.sort_by_key(|(tier, _)| tier.as_str());
        for (tier, params) in tiers {
            let prefix = format!("tier_overrides.{tier}");
            if let Some(thresholds) = compile_thresholds(kind, params, &prefix, &mut v) {
                tier_overrides.insert(*tier, thresholds);
            }
        }
    }

    v.extend_validation("cooldown", spec.cooldown.validate());
    if spec.cooldown.duration_secs.is_none() && spec.cooldown.quiet_evaluations.is_none() {
        v.push("cooldown", "must define duration_secs or quiet_evaluations");
    }
    let cooldown = Cooldown {
        duration: spec.cooldown.duration_secs.and_then(|s| Duration::try_from_secs_f64(s).ok()),
        quiet_evaluations: spec.cooldown.quiet_evaluations,
    };

    let mut output = Vec::with_capacity(spec.output_schema.fields.len());
    for (name, declared) in &spec.output_schema.fields {
        let field = format!("output_schema.fields.{name}");
        match name.parse::<PayloadField>() {
            Ok(payload) if payload.accepts_type(declared) => output.push(OutputField {
                name: name.clone(),
                field: payload,
            }),
            Ok(payload) => v.push(
                field,
                format!("declared as '{declared}' but {name} is {}", payload.json_type()),
            ),
            Err(message) => v.push(field, message),
        }
    }

    if v.any() {
        return None;
    }

    Some(Rule {
        id: RuleId::from(spec.id.as_str()),
        name: spec.name.clone().unwrap_or_else(|| spec.id.clone()),
        category: spec.category.clone(),
        enabled: spec.enabled,
        severity: spec.severity,
        required_models: spec.required_models.clone(),
        predicate: predicate?,
        params: params?,
        tier_overrides,
        cooldown,
        output,
        fingerprint: fingerprint(spec),
    })
}

fn compile_posture(
    label: &str,
    field: &str,
    declared: &HashSet<String>,
    v: &mut Violations<'_>,
) -> Option<PostureLabel> {
    let label = PostureLabel::from(label);
    if let PostureLabel::Named(name) = &label {
        if !declared.contains(name) {
            v.push(field, format!("posture '{name}' is not declared by any calibration profile"));
            return None;
        }
    }
    Some(label)
}

fn compile_predicate(
    kind: PredicateKind,
    spec: &PredicateSpec,
    declared: &HashSet<String>,
    v: &mut Violations<'_>,
) -> Option<Predicate> {
    match kind {
        PredicateKind::Ratio | PredicateKind::Count => {
            let m = &spec.matcher;
            if m.is_empty() {
                v.push("predicate.match", "needs at least one condition");
                return None;
            }
            if let (Some(min), Some(max)) = (m.min_persons, m.max_persons) {
                if min > max {
                    v.push("predicate.match.min_persons", "is greater than max_persons");
                }
            }
            let posture = match &m.posture {
                Some(p) => Some(compile_posture(p, "predicate.match.posture", declared, v)?),
                None => None,
            };
            let matcher = ObservationMatcher {
                objects: m.objects.clone(),
                posture,
                min_persons: m.min_persons.map(|n| n as usize),
                max_persons: m.max_persons.map(|n| n as usize),
            };
            Some(if kind == PredicateKind::Ratio {
                Predicate::Ratio { matcher }
            } else {
                Predicate::Count { matcher }
            })
        }
        PredicateKind::MultiRole => {
            let mut ok = true;
            if spec.roles.is_empty() {
                v.push("predicate.roles", "at least one role is required");
                ok = false;
            }
            let mode = match spec.mode.as_deref() {
                None => PersonMode::Exactly,
                Some(mode) => match mode.parse::<PersonMode>() {
                    Ok(mode) => mode,
                    Err(message) => {
                        v.push("predicate.mode", message);
                        ok = false;
                        PersonMode::Exactly
                    }
                },
            };
            let persons = match spec.persons {
                Some(0) => {
                    v.push("predicate.persons", "must be at least 1");
                    ok = false;
                    0
                }
                Some(n) => n as usize,
                None => {
                    v.push("predicate.persons", "is required");
                    ok = false;
                    0
                }
            };
            if persons > 0 && spec.roles.len() > persons {
                v.push(
                    "predicate.roles",
                    format!("{} roles cannot be filled by {persons} person(s)", spec.roles.len()),
                );
                ok = false;
            }
            let mut roles = Vec::with_capacity(spec.roles.len());
            for (i, role) in spec.roles.iter().enumerate() {
                let mut postures = Vec::new();
                for (j, p) in role.postures.iter().enumerate() {
                    match compile_posture(p, &format!("predicate.roles[{i}].postures[{j}]"), declared, v) {
                        Some(label) => postures.push(label),
                        None => ok = false,
                    }
                }
                roles.push(RoleConstraint {
                    name: if role.name.is_empty() {
                        format!("role_{i}")
                    } else {
                        role.name.clone()
                    },
                    postures,
                });
            }
            ok.then_some(Predicate::MultiRole { roles, persons, mode })
        }
        PredicateKind::KeypointAbsence => {
            if spec.joints.is_empty() {
                v.push("predicate.joints", "at least one joint is required");
                return None;
            }
            let mut joints = Vec::with_capacity(spec.joints.len());
            let mut ok = true;
            for (i, name) in spec.joints.iter().enumerate() {
                match name.parse::<Joint>() {
                    Ok(joint) => joints.push(joint),
                    Err(e) => {
                        v.push(format!("predicate.joints[{i}]"), e.to_string());
                        ok = false;
                    }
                }
            }
            ok.then_some(Predicate::KeypointAbsence { joints })
        }
    }
}

/// Resolve one complete parameter set for `kind`.
fn compile_thresholds(
    kind: PredicateKind,
    params: &DetectionParams,
    prefix: &str,
    v: &mut Violations<'_>,
) -> Option<Thresholds> {
    let before = v.list.len();
    v.extend_validation(prefix, params.validate());

    let window = required(params.analysis_window_secs, prefix, "analysis_window_secs", v);
    let criterion = match kind {
        PredicateKind::Ratio | PredicateKind::MultiRole => {
            required(params.min_ratio, prefix, "min_ratio", v).map(|min_ratio| Criterion::Ratio {
                min_ratio,
                min_samples: params.min_samples.map(|n| n as usize),
            })
        }
        PredicateKind::Count => required(params.min_hits, prefix, "min_hits", v).map(|min_hits| Criterion::Count {
            min_hits: min_hits as usize,
        }),
        PredicateKind::KeypointAbsence => {
            required(params.max_appearances, prefix, "max_appearances", v).map(|max| Criterion::Absence {
                max_appearances: max as usize,
            })
        }
    };

    if v.list.len() > before {
        return None;
    }

    let analysis_window = duration(window?, prefix, "analysis_window_secs", v)?;
    let frame_interval = match params.frame_interval_secs {
        Some(secs) => Some(duration(secs, prefix, "frame_interval_secs", v)?),
        None => None,
    };

    // A fixed sampling interval pins the window size, so it can be checked here.
    // Otherwise it follows the stream and is clamped at runtime.
    if let Some(interval) = frame_interval {
        match TemporalWindow::<()>::checked_capacity(analysis_window, interval) {
            None => {
                v.push(
                    join_field(prefix, "analysis_window_secs"),
                    format!("window holds more than {MAX_WINDOW_CAPACITY} samples at frame_interval_secs"),
                );
                return None;
            }
            Some(capacity) => {
                if let Some(min_samples) = params.min_samples.filter(|&n| n as usize > capacity) {
                    v.push(
                        join_field(prefix, "min_samples"),
                        format!("{min_samples} exceeds the window capacity of {capacity}"),
                    );
                    return None;
                }
            }
        }
    }

    Some(Thresholds {
        analysis_window,
        frame_interval,
        min_confidence: params.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
        criterion: criterion?,
    })
}

fn required<T>(value: Option<T>, prefix: &str, name: &str, v: &mut Violations<'_>) -> Option<T> {
    if value.is_none() {
        v.push(join_field(prefix, name), "is required");
    }
    value
}

fn duration(secs: f64, prefix: &str, name: &str, v: &mut Violations<'_>) -> Option<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) => Some(d),
        Err(_) => {
            v.push(join_field(prefix, name), "is out of range");
            None
        }
    }
}

/// Stable hash of the rule's canonical JSON (object keys sorted).
fn fingerprint(spec: &RuleSpec) -> u64 {
    let canonical = serde_json::to_value(spec)
        .map(|value| canonical_json(&value))
        .unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    hasher.finish()
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vigil_models::RiskTier;

    fn registry() -> ModelRegistry {
        ModelRegistry::new()
            .with_model("detector", ModelCapability::ObjectDetection)
            .with_model("pose", ModelCapability::PoseEstimation)
    }

    const VALID: &str = r#"{
        "version": "2024-06",
        "calibration_profile": "ward",
        "calibration_profiles": {
            "ward": {
                "postures": {
                    "lying": {"bounds": {"height_ratio": {"max": 0.4}}},
                    "standing": {"bounds": {"height_ratio": {"min": 0.8}}}
                }
            }
        },
        "rules": [
            {
                "id": "phone",
                "category": "violation",
                "required_models": ["detector"],
                "predicate": {"kind": "count", "match": {"objects": ["cell phone"]}},
                "detection_params": {"analysis_window_secs": 300, "frame_interval_secs": 2, "min_hits": 8},
                "output_schema": {"fields": {"hits": "integer", "matched_objects": "array"}}
            },
            {
                "id": "fall",
                "category": "safety",
                "severity": "critical",
                "required_models": ["pose"],
                "predicate": {"kind": "ratio", "match": {"posture": "lying"}},
                "detection_params": {"analysis_window_secs": 120, "min_ratio": 0.8},
                "tier_overrides": {"high": {"analysis_window_secs": 30, "min_ratio": 0.6}},
                "cooldown": {"duration_secs": 300}
            },
            {
                "id": "lone_care",
                "category": "care",
                "required_models": ["pose"],
                "predicate": {
                    "kind": "multi_role",
                    "persons": 2,
                    "mode": "exactly",
                    "roles": [{"name": "caregiver", "postures": ["standing"]}, {"name": "resident"}]
                },
                "detection_params": {"analysis_window_secs": 60, "min_ratio": 0.9}
            },
            {
                "id": "face_cover",
                "category": "security",
                "enabled": false,
                "required_models": ["pose"],
                "predicate": {"kind": "keypoint_absence", "joints": ["nose", "left_eye"]},
                "detection_params": {"analysis_window_secs": 20, "max_appearances": 5, "min_confidence": 0.3}
            }
        ]
    }"#;

    #[test]
    fn test_load_compiles_every_predicate_kind() {
        let catalog = RuleCatalog::new(registry());
        let set = catalog.load(RuleSource::Json(VALID.to_string())).unwrap();

        assert_eq!(set.len(), 4);
        assert_eq!(set.enabled_count(), 3);
        assert_eq!(set.version(), Some("2024-06"));
        assert_eq!(set.default_profile().name, "ward");

        let phone = set.get(&RuleId::from("phone")).unwrap();
        assert!(matches!(phone.predicate, Predicate::Count { .. }));
        assert_eq!(phone.params.criterion, Criterion::Count { min_hits: 8 });
        assert_eq!(phone.params.capacity(Duration::from_secs(5)), 150);
        assert_eq!(phone.output.len(), 2);
        // Default cool-down re-arms after one quiet evaluation.
        assert_eq!(phone.cooldown.quiet_evaluations, Some(1));

        let fall = set.get(&RuleId::from("fall")).unwrap();
        assert_eq!(fall.thresholds(RiskTier::High).analysis_window, Duration::from_secs(30));
        assert_eq!(fall.thresholds(RiskTier::Medium).analysis_window, Duration::from_secs(120));
        assert_eq!(fall.cooldown.duration, Some(Duration::from_secs(300)));
        assert_eq!(fall.cooldown.quiet_evaluations, None);

        let care = set.get(&RuleId::from("lone_care")).unwrap();
        match &care.predicate {
            Predicate::MultiRole { roles, persons, mode } => {
                assert_eq!(roles.len(), 2);
                assert_eq!(*persons, 2);
                assert_eq!(*mode, PersonMode::Exactly);
                assert!(roles[1].postures.is_empty());
            }
            other => panic!("unexpected predicate {other:?}"),
        }
    }

    #[test]
    fn test_validation_enumerates_all_offending_rules() {
        let doc = r#"{
            "rules": [
                {
                    "id": "no_ratio", "category": "safety", "required_models": ["detector"],
                    "predicate": {"kind": "ratio", "match": {"objects": ["knife"]}},
                    "detection_params": {"analysis_window_secs": 60}
                },
                {
                    "id": "bad_model", "category": "safety", "required_models": ["yolo9000"],
                    "predicate": {"kind": "count", "match": {"objects": ["knife"]}},
                    "detection_params": {"analysis_window_secs": 60, "min_hits": 3}
                },
                {
                    "id": "bad_ranges", "category": "safety", "required_models": ["detector"],
                    "predicate": {"kind": "ratio", "match": {"objects": ["knife"]}},
                    "detection_params": {"analysis_window_secs": -5, "min_ratio": 1.5},
                    "cooldown": {}
                },
                {
                    "id": "ok", "category": "safety", "required_models": ["detector"],
                    "predicate": {"kind": "count", "match": {"objects": ["knife"]}},
                    "detection_params": {"analysis_window_secs": 60, "min_hits": 3}
                }
            ]
        }"#;

        let err = RuleCatalog::new(registry())
            .load(RuleSource::Json(doc.to_string()))
            .unwrap_err();
        assert_eq!(err.offending_rules(), vec!["no_ratio", "bad_model", "bad_ranges"]);

        let fields: Vec<String> = err
            .violations()
            .iter()
            .map(|v| format!("{}.{}", v.rule_id, v.field))
            .collect();
        assert!(fields.contains(&"no_ratio.detection_params.min_ratio".to_string()));
        assert!(fields.contains(&"bad_model.required_models[0]".to_string()));
        assert!(fields.contains(&"bad_ranges.detection_params.analysis_window_secs".to_string()));
        assert!(fields.contains(&"bad_ranges.detection_params.min_ratio".to_string()));
        assert!(fields.contains(&"bad_ranges.cooldown".to_string()));
    }

    #[test]
    fn test_override_must_be_complete() {
        let doc = r#"{"rules": [{
            "id": "knife", "category": "safety", "required_models": ["detector"],
            "predicate": {"kind": "ratio", "match": {"objects": ["knife"]}},
            "detection_params": {"analysis_window_secs": 60, "min_ratio": 0.5},
            "tier_overrides": {"high": {"min_ratio": 0.3}}
        }]}"#;
        let err = RuleCatalog::new(registry())
            .load(RuleSource::Json(doc.to_string()))
            .unwrap_err();
        assert_eq!(err.violations().len(), 1);
        assert_eq!(err.violations()[0].field, "tier_overrides.high.analysis_window_secs");
    }

    #[test]
    fn test_capability_and_posture_checks() {
        let doc = r#"{"rules": [
            {
                "id": "phone_pose", "category": "v", "required_models": ["pose"],
                "predicate": {"kind": "count", "match": {"objects": ["cell phone"]}},
                "detection_params": {"analysis_window_secs": 60, "min_hits": 3}
            },
            {
                "id": "ghost", "category": "v", "required_models": ["pose"],
                "predicate": {"kind": "ratio", "match": {"posture": "levitating"}},
                "detection_params": {"analysis_window_secs": 60, "min_ratio": 0.5}
            },
            {
                "id": "crowded_roles", "category": "v", "required_models": ["pose"],
                "predicate": {"kind": "multi_role", "persons": 1, "roles": [{"name": "a"}, {"name": "b"}]},
                "detection_params": {"analysis_window_secs": 60, "min_ratio": 0.5}
            }
        ]}"#;
        let err = RuleCatalog::new(registry())
            .load(RuleSource::Json(doc.to_string()))
            .unwrap_err();
        assert_eq!(err.offending_rules(), vec!["phone_pose", "ghost", "crowded_roles"]);
    }

    #[test]
    fn test_unknown_fields_tolerated_but_bad_types_named() {
        let doc = r#"{"owner": "ops", "rules": [
            {
                "id": "phone", "category": "v", "required_models": ["detector"], "notes": "legacy",
                "predicate": {"kind": "count", "match": {"objects": ["cell phone"]}},
                "detection_params": {"analysis_window_secs": 60, "min_hits": "eight"}
            }
        ]}"#;
        let err = RuleCatalog::new(registry())
            .load(RuleSource::Json(doc.to_string()))
            .unwrap_err();
        assert_eq!(err.offending_rules(), vec!["phone"]);
    }

    #[test]
    fn test_failed_reload_keeps_previous_snapshot() {
        let catalog = RuleCatalog::from_source(registry(), RuleSource::Json(VALID.to_string())).unwrap();
        let before = catalog.snapshot();
        assert_eq!(before.generation(), 1);

        let err = catalog.reload(RuleSource::Json(r#"{"rules": [{"id": "x"}]}"#.to_string()));
        assert!(err.is_err());

        let after = catalog.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_reload_swaps_snapshot_and_keeps_unchanged_fingerprints() {
        let catalog = RuleCatalog::from_source(registry(), RuleSource::Json(VALID.to_string())).unwrap();
        let old = catalog.snapshot();

        let mut doc: serde_json::Value = serde_json::from_str(VALID).unwrap();
        doc["rules"][0]["detection_params"]["min_hits"] = serde_json::json!(10);
        let new = catalog.reload(RuleSource::Json(doc.to_string())).unwrap();

        // Readers holding the old snapshot still see the old rules.
        let phone = RuleId::from("phone");
        assert_eq!(old.get(&phone).unwrap().params.criterion, Criterion::Count { min_hits: 8 });
        assert_eq!(new.get(&phone).unwrap().params.criterion, Criterion::Count { min_hits: 10 });
        assert_eq!(new.generation(), 2);

        let fall = RuleId::from("fall");
        assert_eq!(old.get(&fall).unwrap().fingerprint, new.get(&fall).unwrap().fingerprint);
        assert_ne!(old.get(&phone).unwrap().fingerprint, new.get(&phone).unwrap().fingerprint);
    }

    #[test]
    fn test_reload_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();

        let catalog = RuleCatalog::new(registry());
        let set = catalog.reload(RuleSource::file(file.path())).unwrap();
        assert_eq!(set.len(), 4);

        let missing = catalog.reload(RuleSource::file("/nonexistent/rules.json"));
        assert!(matches!(missing, Err(CatalogError::Io(_))));
        assert_eq!(catalog.snapshot().generation(), 1);
    }

    #[test]
    fn test_profile_selection() {
        let doc = r#"{
            "calibration_profiles": {"a": {}, "b": {}},
            "rules": []
        }"#;
        let err = RuleCatalog::new(registry())
            .load(RuleSource::Json(doc.to_string()))
            .unwrap_err();
        assert_eq!(err.violations()[0].field, "calibration_profile");

        let doc = r#"{"calibration_profile": "b", "calibration_profiles": {"a": {}, "b": {}}, "rules": []}"#;
        let set = RuleCatalog::new(registry())
            .load(RuleSource::Json(doc.to_string()))
            .unwrap();
        assert_eq!(set.default_profile().name, "b");
        assert_eq!(set.resolve_profile(Some("a")).unwrap().name, "a");
        assert!(matches!(
            set.resolve_profile(Some("c")),
            Err(EngineError::UnknownProfile(_))
        ));
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        let doc = r#"{"rules": [{
            "id": "phone", "category": "v", "required_models": ["detector"],
            "predicate": {"kind": "count", "match": {"objects": ["cell phone"]}},
            "detection_params": {"analysis_window_secs": 1e15, "frame_interval_secs": 1e-6, "min_hits": 3}
        }]}"#;
        let err = RuleCatalog::new(registry())
            .load(RuleSource::Json(doc.to_string()))
            .unwrap_err();
        assert_eq!(err.violations().len(), 1);
        assert_eq!(err.violations()[0].field, "detection_params.analysis_window_secs");

        // Same window on a stream-paced rule compiles; the runtime clamp applies.
        let doc = doc.replace(r#""frame_interval_secs": 1e-6, "#, "");
        let set = RuleCatalog::new(registry())
            .load(RuleSource::Json(doc))
            .unwrap();
        let phone = set.get(&RuleId::from("phone")).unwrap();
        assert_eq!(phone.params.capacity(Duration::from_micros(1)), MAX_WINDOW_CAPACITY);
    }

    #[test]
    fn test_min_samples_above_capacity_is_rejected() {
        let doc = r#"{"rules": [{
            "id": "knife", "category": "safety", "required_models": ["detector"],
            "predicate": {"kind": "ratio", "match": {"objects": ["knife"]}},
            "detection_params": {"analysis_window_secs": 10, "frame_interval_secs": 2, "min_ratio": 0.5, "min_samples": 6}
        }]}"#;
        let err = RuleCatalog::new(registry())
            .load(RuleSource::Json(doc.to_string()))
            .unwrap_err();
        assert_eq!(err.offending_rules(), vec!["knife"]);
        assert_eq!(err.violations()[0].field, "detection_params.min_samples");
        assert!(err.violations()[0].message.contains("capacity of 5"));

        // Exactly filling the window is allowed.
        let ok = doc.replace(r#""min_samples": 6"#, r#""min_samples": 5"#);
        assert!(RuleCatalog::new(registry()).load(RuleSource::Json(ok)).is_ok());
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b": 1, "a": {"d": [1, 2], "c": null}}"#).unwrap();
        assert_eq!(canonical_json(&a), r#"{"a":{"c":null,"d":[1,2]},"b":1}"#);
    }
}
