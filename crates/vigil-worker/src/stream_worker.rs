//! Per-stream pipeline worker.
//!
//! A worker exclusively owns its stream's schedule, classifier and
//! evaluator state. It sleeps until the scheduler's next slot, samples the
//! newest frame, runs it through the batcher, classifier and evaluator,
//! and hands events to the sink. Administrative commands arrive on an
//! mpsc channel and are applied between ticks.

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use vigil_engine::{
    ActionClassifier, CalibrationRound, EvalContext, EvaluatorConfig, EventEvaluator, Observation, PostureReading,
    RiskScheduler, RuleCatalog, RuleSet, SkipReason, StreamSchedule, ThresholdCalibrator, TickOutcome, TrackedPerson,
};
use vigil_inference::{InferenceBatcher, InferenceError, InferenceResult};
use vigil_models::{Frame, InferenceOutput, ModelCapability, ModelId, RiskTier, StreamId};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::StreamLogger;
use crate::metrics::{
    record_calibration_round, record_degraded, record_event, record_frame, record_missed_slots, record_skipped_tick,
    record_stream_error,
};
use crate::retry::{retry_async, FailureTracker, RetryConfig};
use crate::sink::EventSink;
use crate::source::FrameSource;
use crate::status::{LastError, StatusBoard, StreamState, StreamStatus};

/// Failure log lines per stream before suppression.
const MAX_LOGGED_FAILURES: u32 = 5;

/// Request to start a stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamSpec {
    pub stream_id: StreamId,
    /// Tier the stream decays back to; the scheduler default when absent.
    #[serde(default)]
    pub tier: Option<RiskTier>,
    /// Calibration profile; the rule document's selection when absent.
    #[serde(default)]
    pub profile: Option<String>,
    /// Restrict the models this stream is analyzed with.
    #[serde(default)]
    pub models: Option<Vec<ModelId>>,
}

impl StreamSpec {
    pub fn new(stream_id: impl Into<StreamId>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tier: None,
            profile: None,
            models: None,
        }
    }

    pub fn with_tier(mut self, tier: RiskTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }
}

/// Administrative command for a running worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Pause,
    Resume,
    /// Force `tier` for `hold`, or until cleared.
    ForceTier { tier: RiskTier, hold: Option<Duration> },
    ClearTier,
    Stop,
}

/// A command together with the channel its resulting status is sent on.
#[derive(Debug)]
pub(crate) struct Command {
    pub control: Control,
    pub ack: oneshot::Sender<StreamStatus>,
}

/// Shared collaborators of every worker.
#[derive(Clone)]
pub(crate) struct WorkerDeps {
    pub config: Arc<WorkerConfig>,
    pub catalog: Arc<RuleCatalog>,
    pub scheduler: Arc<RiskScheduler>,
    pub batcher: InferenceBatcher,
    pub sink: Arc<dyn EventSink>,
    pub status: StatusBoard,
}

fn round_outcome(round: &CalibrationRound) -> &'static str {
    if round.rolled_back {
        "rolled_back"
    } else if round.updated.is_empty() {
        "unchanged"
    } else {
        "updated"
    }
}

/// Monotonic now on tokio's clock, so paused-time tests drive the schedule.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub(crate) struct StreamWorker {
    spec: StreamSpec,
    deps: WorkerDeps,
    source: Arc<dyn FrameSource>,
    schedule: StreamSchedule,
    classifier: ActionClassifier,
    calibrator: Option<ThresholdCalibrator>,
    evaluator: EventEvaluator,
    retry: RetryConfig,
    last_sequence: u64,
    paused: bool,
    failures: FailureTracker,
    logger: StreamLogger,
    status: StreamStatus,
}

impl StreamWorker {
    /// Build a worker for `spec`. Fails if the requested profile does not exist.
    pub fn new(spec: StreamSpec, deps: WorkerDeps, source: Arc<dyn FrameSource>) -> WorkerResult<Self> {
        let rules = deps.catalog.snapshot();
        let profile = rules.resolve_profile(spec.profile.as_deref())?;
        let schedule = deps.scheduler.schedule(spec.tier, now());
        let logger = StreamLogger::new(&spec.stream_id, &profile.name);

        let mut status = StreamStatus::new(spec.stream_id.clone(), schedule.default_tier(), profile.name.clone());
        status.interval_ms = schedule.interval().as_millis() as u64;
        status.rules_generation = rules.generation();

        Ok(Self {
            evaluator: EventEvaluator::new(EvaluatorConfig {
                suspend_after_misses: deps.config.suspend_after_misses,
            }),
            retry: deps.config.inference_retry(),
            failures: FailureTracker::new(MAX_LOGGED_FAILURES, deps.config.auto_pause_after),
            calibrator: deps
                .config
                .calibration
                .clone()
                .map(|config| ThresholdCalibrator::new(config, Arc::clone(&profile))),
            classifier: ActionClassifier::new(profile),
            spec,
            deps,
            source,
            schedule,
            last_sequence: 0,
            paused: false,
            logger,
            status,
        })
    }

    /// Feed the calibrator and adopt its profile when a round moved a bound.
    fn recalibrate(&mut self, readings: &[PostureReading], at: Instant) {
        let Some(calibrator) = self.calibrator.as_mut() else {
            return;
        };
        calibrator.observe(readings);
        let Some(round) = calibrator.maybe_recalibrate(at) else {
            return;
        };
        record_calibration_round(round_outcome(&round));
        if round.rolled_back {
            self.logger.log_warning("calibration rolled back to the rule document bounds");
        } else if !round.updated.is_empty() {
            self.logger.log_state(&format!("calibrated {}", round.updated.join(", ")));
        }
        if round.changed() {
            self.classifier.set_profile(Arc::clone(calibrator.profile()));
        }
    }

    pub fn status(&self) -> &StreamStatus {
        &self.status
    }

    pub fn logger(&self) -> &StreamLogger {
        &self.logger
    }

    /// Run until stopped or failed.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> StreamState {
        self.logger.log_start(&format!(
            "tier={} interval_ms={}",
            self.schedule.default_tier(),
            self.status.interval_ms
        ));

        loop {
            let due = (!self.paused).then(|| self.deps.scheduler.next_due(&mut self.schedule, now()));

            tokio::select! {
                command = commands.recv() => {
                    let Some(Command { control, ack }) = command else {
                        return self.finish(StreamState::Stopped, "control channel closed").await;
                    };
                    if control == Control::Stop {
                        let state = self.finish(StreamState::Stopped, "stop requested").await;
                        let _ = ack.send(self.status.clone());
                        return state;
                    }
                    self.apply(control).await;
                    let _ = ack.send(self.status.clone());
                }
                _ = sleep_until(due) => {
                    if let Err(e) = self.tick().await {
                        if e.is_fatal() {
                            self.note_error(&e);
                            return self.finish(StreamState::Failed, &e.to_string()).await;
                        }
                        self.note_error(&e);
                        self.publish().await;
                    }
                }
            }
        }
    }

    async fn apply(&mut self, control: Control) {
        let at = now();
        match control {
            Control::Pause => {
                self.paused = true;
                self.status.state = StreamState::Paused;
                self.logger.log_state("paused");
            }
            Control::Resume => {
                if self.paused {
                    self.paused = false;
                    self.failures.record_success();
                    self.deps.scheduler.resume(&mut self.schedule, at);
                    self.status.state = StreamState::Running;
                    self.logger.log_state("resumed");
                }
            }
            Control::ForceTier { tier, hold } => {
                self.deps.scheduler.force_tier(&mut self.schedule, tier, hold, at);
                self.logger.log_state(&format!("tier forced to {tier}"));
            }
            Control::ClearTier => {
                self.deps.scheduler.clear_forced(&mut self.schedule);
                self.logger.log_state("forced tier cleared");
            }
            Control::Stop => {}
        }
        self.publish().await;
    }

    /// Serve one due slot.
    async fn tick(&mut self) -> WorkerResult<()> {
        let started = tokio::time::Instant::now();
        let at = started.into_std();

        let frame = match self.source.latest() {
            Some(frame) if frame.sequence > self.last_sequence => frame,
            Some(_) => {
                self.skip_slot("stale", at).await;
                return Ok(());
            }
            None => {
                self.skip_slot("no_frame", at).await;
                return Ok(());
            }
        };
        self.last_sequence = frame.sequence;

        let rules = self.deps.catalog.snapshot();
        if rules.generation() != self.status.rules_generation {
            self.status.rules_generation = rules.generation();
            match rules.resolve_profile(self.spec.profile.as_deref()) {
                Ok(profile) => match self.calibrator.as_mut() {
                    Some(calibrator) => {
                        calibrator.rebase(profile);
                        self.classifier.set_profile(Arc::clone(calibrator.profile()));
                    }
                    None => self.classifier.set_profile(profile),
                },
                Err(e) => self.note_error(&WorkerError::from(e)),
            }
        }

        let models = self.models_for(&rules);
        let results = join_all(
            models
                .iter()
                .map(|model| infer_with_retry(&self.deps.batcher, &self.retry, model, &frame)),
        )
        .await;

        let mut observation = Observation::new(frame.sequence, at, frame.captured_at);
        let mut poses = Vec::new();
        let mut saw_poses = false;
        let mut failures = Vec::new();
        for (model, result) in models.iter().zip(results) {
            match result {
                Ok(output) => {
                    if self.deps.catalog.registry().capability(model) == Some(ModelCapability::PoseEstimation) {
                        saw_poses = true;
                    }
                    observation.models.insert(model.clone());
                    observation.detections.extend(output.detections);
                    poses.extend(output.poses);
                }
                Err(e) => failures.push((model.clone(), e)),
            }
        }

        if saw_poses {
            let readings = self.classifier.classify(&poses, at);
            self.recalibrate(&readings, at);
            observation.persons = poses
                .into_iter()
                .zip(readings)
                .map(|(pose, reading)| TrackedPerson {
                    track_id: reading.track_id,
                    label: reading.label,
                    pose,
                })
                .collect();
        }

        let tier = self.deps.scheduler.tier(&self.schedule, at);
        let interval = self.schedule.interval();
        let all_failed = !models.is_empty() && failures.len() == models.len();

        let outcome = if all_failed {
            self.evaluator.record_missing(&rules, &self.spec.stream_id, interval)
        } else {
            let ctx = EvalContext {
                stream_id: &self.spec.stream_id,
                tier,
                stream_interval: interval,
            };
            self.evaluator.evaluate(&rules, ctx, Arc::new(observation))?
        };

        self.record_failures(failures, all_failed);
        self.record_outcome(&outcome);
        self.emit(outcome, at).await;

        if !all_failed {
            self.status.frames_processed += 1;
        }
        self.status.last_tick_at = Some(Utc::now());

        let skipped = self.deps.scheduler.complete(&mut self.schedule, at);
        record_missed_slots(skipped);
        record_frame(self.logger.stream_id(), started.elapsed().as_secs_f64());

        if self.failures.exhausted() && !self.paused {
            self.paused = true;
            self.status.state = StreamState::Paused;
            self.logger.log_warning(&format!(
                "auto-paused after {} consecutive failed ticks",
                self.failures.failure_count()
            ));
        }

        self.publish().await;
        Ok(())
    }

    /// Models to request: every enabled rule's inputs, limited to the
    /// stream's allow-list.
    fn models_for(&self, rules: &RuleSet) -> Vec<ModelId> {
        let mut models = BTreeSet::new();
        for rule in rules.rules().iter().filter(|r| r.enabled) {
            for model in &rule.required_models {
                let allowed = self.spec.models.as_ref().map_or(true, |list| list.contains(model));
                if allowed {
                    models.insert(model.clone());
                }
            }
        }
        models.into_iter().collect()
    }

    fn record_failures(&mut self, failures: Vec<(ModelId, InferenceError)>, all_failed: bool) {
        if failures.is_empty() {
            self.failures.record_success();
            return;
        }

        let should_log = if all_failed {
            self.failures.record_failure()
        } else {
            self.failures.record_success();
            true
        };

        for (model, error) in failures {
            let error = WorkerError::from(error);
            if should_log {
                self.logger.log_warning(&format!("model {model} unavailable: {error}"));
            }
            self.note_error(&error);
        }
        if all_failed {
            record_skipped_tick("inference");
            self.status.frames_skipped += 1;
        }
    }

    fn record_outcome(&mut self, outcome: &TickOutcome) {
        if outcome.missing_input_count() > 0 {
            self.status.degraded_ticks += 1;
        }
        for (rule_id, reason) in &outcome.skipped {
            if *reason == SkipReason::MissingInput {
                record_degraded(rule_id.as_str());
            }
        }
        for rule_id in &outcome.suspended {
            self.logger.log_warning(&format!("rule {rule_id} suspended after missing input"));
        }
        for rule_id in &outcome.resumed {
            self.logger.log_state(&format!("rule {rule_id} resumed"));
        }
    }

    async fn emit(&mut self, outcome: TickOutcome, at: Instant) {
        for event in outcome.events {
            let severity = event.severity;
            record_event(event.rule_id.as_str(), severity.as_str());
            if self.deps.scheduler.observe_event(&mut self.schedule, severity, at) {
                self.logger.log_state(&format!("escalated by rule {}", event.rule_id));
            }
            self.status.events_emitted += 1;
            if let Err(e) = self.deps.sink.emit(event).await {
                self.note_error(&e);
            }
        }
    }

    async fn skip_slot(&mut self, reason: &'static str, at: Instant) {
        record_skipped_tick(reason);
        self.status.frames_skipped += 1;
        let skipped = self.deps.scheduler.complete(&mut self.schedule, at);
        record_missed_slots(skipped);
        self.publish().await;
    }

    fn note_error(&mut self, error: &WorkerError) {
        let class = error.class();
        record_stream_error(class.as_str());
        self.status.last_error = Some(LastError {
            class,
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    async fn publish(&mut self) {
        let at = now();
        let tier = self.deps.scheduler.tier(&self.schedule, at);
        self.status.tier = tier;
        self.status.default_tier = self.schedule.default_tier();
        self.status.forced = self.schedule.is_forced();
        self.status.interval_ms = self.deps.scheduler.effective_interval(tier).as_millis() as u64;
        self.status.missed_slots = self.schedule.missed_slots();
        self.status.suspended_rules = self.evaluator.suspended_rules(&self.spec.stream_id);
        self.status.profile = self.classifier.profile().name.clone();
        self.deps.status.publish(self.status.clone()).await;
    }

    async fn finish(&mut self, state: StreamState, reason: &str) -> StreamState {
        self.status.state = state;
        self.evaluator.remove_stream(&self.spec.stream_id);
        self.publish().await;
        match state {
            StreamState::Failed => self.logger.log_error(reason),
            _ => self.logger.log_stop(reason),
        }
        state
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(tokio::time::Instant::from_std(due)).await,
        None => std::future::pending().await,
    }
}

async fn infer_with_retry(
    batcher: &InferenceBatcher,
    retry: &RetryConfig,
    model: &ModelId,
    frame: &Frame,
) -> InferenceResult<InferenceOutput> {
    retry_async(retry, || batcher.submit(model, frame.clone()), InferenceError::is_retryable)
        .await
        .into_result()
}
