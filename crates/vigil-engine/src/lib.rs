//! Streaming event-detection core.
//!
//! This crate provides:
//! - [`RuleCatalog`]: validated, hot-reloadable rule sets
//! - [`ActionClassifier`]: debounced per-person posture labels
//! - [`ThresholdCalibrator`]: online recalibration of posture bounds
//! - [`EventEvaluator`]: per-(stream, rule) sliding windows and cool-down
//! - [`RiskScheduler`]: drift-free, risk-adaptive sampling
//!
//! Everything here is synchronous and owned per stream; time is passed in
//! explicitly so callers control the clock.

pub mod calibrator;
pub mod catalog;
pub mod classifier;
pub mod error;
pub mod evaluator;
pub mod geometry;
pub mod observation;
pub mod registry;
pub mod rule;
pub mod scheduler;
pub mod window;

pub use calibrator::{CalibrationRound, CalibratorConfig, ThresholdCalibrator};
pub use catalog::{RuleCatalog, RuleSet, RuleSource};
pub use classifier::{ActionClassifier, CalibrationProfile, PostureReading, ProfileIssue};
pub use error::{CatalogError, CatalogResult, EngineError, EngineResult, RuleViolation};
pub use evaluator::{EvalContext, EvaluatorConfig, EventEvaluator, RuleStateView, SkipReason, TickOutcome};
pub use geometry::{Feature, FeatureVector};
pub use observation::{Observation, TrackedPerson, PERSON_CLASS};
pub use registry::{ModelRegistry, RegistryParseError};
pub use rule::{Criterion, Predicate, PredicateKind, Rule, Thresholds};
pub use scheduler::{PressureGauge, RiskScheduler, SchedulerConfig, StreamSchedule};
pub use window::{TemporalWindow, MAX_WINDOW_CAPACITY};
