//! End-to-end pipeline tests: coordinator, worker, batcher and engine
//! wired together over a fake perception backend.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vigil_engine::{ModelRegistry, PressureGauge, RiskScheduler, RuleCatalog, RuleSource, SchedulerConfig};
use vigil_inference::{BatcherConfig, InferenceBatcher, InferenceError, InferenceResult, PerceptionBackend};
use vigil_models::{
    BoundingBox, Detection, Frame, FrameData, InferenceOutput, ModelCapability, ModelId, RiskTier, Severity, StreamId,
};
use vigil_worker::{ChannelSink, Coordinator, StreamSpec, StreamState, StreamStatus, WorkerConfig, WorkerError};

const PHONE_RULES: &str = r#"{"rules": [{
    "id": "phone", "category": "violation", "severity": "critical",
    "required_models": ["detector"],
    "predicate": {"kind": "count", "match": {"objects": ["cell phone"]}},
    "detection_params": {"analysis_window_secs": 20, "frame_interval_secs": 2, "min_hits": 2},
    "cooldown": {"quiet_evaluations": 3},
    "output_schema": {"fields": {"hits": "integer", "frame_sequence": "integer"}}
}]}"#;

struct FakeBackend {
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeBackend {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(fail),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PerceptionBackend for FakeBackend {
    async fn infer_batch(&self, _model: &ModelId, _device: &str, frames: &[Frame]) -> InferenceResult<Vec<InferenceOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(InferenceError::from_http_status(400, "bad frame"));
        }
        Ok(frames
            .iter()
            .map(|_| InferenceOutput {
                detections: vec![Detection {
                    class_name: "cell phone".to_string(),
                    confidence: 0.9,
                    bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 4.0, y2: 8.0 },
                }],
                ..InferenceOutput::default()
            })
            .collect())
    }
}

struct Harness {
    coordinator: Coordinator,
    events: tokio::sync::mpsc::Receiver<vigil_models::Event>,
}

fn harness(backend: Arc<FakeBackend>, config: WorkerConfig) -> Harness {
    let registry = ModelRegistry::new().with_model("detector", ModelCapability::ObjectDetection);
    let catalog = Arc::new(RuleCatalog::from_source(registry, RuleSource::Json(PHONE_RULES.to_string())).unwrap());

    let pressure = Arc::new(PressureGauge::new());
    let scheduler = Arc::new(RiskScheduler::with_gauge(
        SchedulerConfig {
            escalate_on: Severity::Critical,
            escalation_hold: Duration::from_secs(60),
            ..SchedulerConfig::default()
        },
        Arc::clone(&pressure),
    ));
    let batcher = InferenceBatcher::start(
        BatcherConfig {
            batch_timeout: Duration::from_millis(10),
            ..BatcherConfig::default()
        },
        [ModelId::from("detector")],
        backend,
        pressure,
    );
    let (sink, events) = ChannelSink::new(16);

    Harness {
        coordinator: Coordinator::new(config, catalog, scheduler, batcher, Arc::new(sink)),
        events,
    }
}

/// Publish a fresh frame every second, offset from the tick grid.
async fn feed_frames(coordinator: &Coordinator, stream: &StreamId) -> tokio::task::JoinHandle<()> {
    let source = coordinator.frame_source(stream).await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        loop {
            source.publish(FrameData::jpeg(vec![0xff, 0xd8]));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}

async fn wait_for<F>(coordinator: &Coordinator, stream: &StreamId, pred: F) -> StreamStatus
where
    F: Fn(&StreamStatus) -> bool,
{
    for _ in 0..120 {
        if let Ok(status) = coordinator.status(stream).await {
            if pred(&status) {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("status condition not reached for {stream}");
}

#[tokio::test(start_paused = true)]
async fn test_event_reaches_sink_and_escalates_stream() {
    let backend = FakeBackend::new(false);
    let mut h = harness(Arc::clone(&backend), WorkerConfig::default());
    let stream = StreamId::from("cam-1");

    let started = h.coordinator.start_stream(StreamSpec::new("cam-1")).await.unwrap();
    assert_eq!(started.state, StreamState::Running);
    assert_eq!(started.tier, RiskTier::Medium);
    assert_eq!(started.interval_ms, 2000);

    let feeder = feed_frames(&h.coordinator, &stream).await;

    let event = tokio::time::timeout(Duration::from_secs(30), h.events.recv())
        .await
        .expect("event within 30s")
        .expect("sink open");
    assert_eq!(event.rule_id.as_str(), "phone");
    assert_eq!(event.stream_id, stream);
    assert_eq!(event.payload["hits"], 2);

    let status = wait_for(&h.coordinator, &stream, |s| s.events_emitted == 1).await;
    assert_eq!(status.tier, RiskTier::High);
    assert_eq!(status.default_tier, RiskTier::Medium);
    assert_eq!(status.interval_ms, 1000);
    assert!(status.frames_processed >= 2);
    assert!(backend.calls.load(Ordering::SeqCst) >= 2);

    feeder.abort();
    let stopped = h.coordinator.stop_stream(&stream).await.unwrap();
    assert_eq!(stopped.state, StreamState::Stopped);
    h.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_admin_controls_update_status() {
    let mut h = harness(FakeBackend::new(false), WorkerConfig::default());
    let stream = StreamId::from("cam-2");
    h.coordinator
        .start_stream(StreamSpec::new("cam-2").with_tier(RiskTier::Medium))
        .await
        .unwrap();

    let paused = h.coordinator.pause(&stream).await.unwrap();
    assert_eq!(paused.state, StreamState::Paused);

    let forced = h.coordinator.force_tier(&stream, RiskTier::Low, None).await.unwrap();
    assert!(forced.forced);
    assert_eq!(forced.tier, RiskTier::Low);
    assert_eq!(forced.interval_ms, 5000);

    let cleared = h.coordinator.clear_tier(&stream).await.unwrap();
    assert!(!cleared.forced);
    assert_eq!(cleared.tier, RiskTier::Medium);

    let resumed = h.coordinator.resume(&stream).await.unwrap();
    assert_eq!(resumed.state, StreamState::Running);

    let stopped = h.coordinator.stop_stream(&stream).await.unwrap();
    assert_eq!(stopped.state, StreamState::Stopped);
    assert!(matches!(
        h.coordinator.status(&stream).await,
        Err(WorkerError::StreamNotFound(_))
    ));
    assert!(matches!(
        h.coordinator.pause(&stream).await,
        Err(WorkerError::StreamNotFound(_))
    ));
    assert!(h.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_start_stream_rejections() {
    let config = WorkerConfig {
        max_streams: 1,
        ..WorkerConfig::default()
    };
    let h = harness(FakeBackend::new(false), config);

    h.coordinator.start_stream(StreamSpec::new("a")).await.unwrap();
    assert!(matches!(
        h.coordinator.start_stream(StreamSpec::new("a")).await,
        Err(WorkerError::StreamExists(_))
    ));
    assert!(matches!(
        h.coordinator.start_stream(StreamSpec::new("b")).await,
        Err(WorkerError::CapacityExceeded(1))
    ));

    h.coordinator.stop_stream(&StreamId::from("a")).await.unwrap();
    assert!(matches!(
        h.coordinator.start_stream(StreamSpec::new("b").with_profile("night")).await,
        Err(WorkerError::Config(_))
    ));

    let mut spec = StreamSpec::new("c");
    spec.models = Some(vec![ModelId::from("thermal")]);
    assert!(matches!(h.coordinator.start_stream(spec).await, Err(WorkerError::Config(_))));
    assert_eq!(h.coordinator.active_streams().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_inference_suspends_rule_and_auto_pauses() {
    let config = WorkerConfig {
        suspend_after_misses: 2,
        auto_pause_after: 3,
        ..WorkerConfig::default()
    };
    let h = harness(FakeBackend::new(true), config);
    let stream = StreamId::from("cam-3");
    h.coordinator.start_stream(StreamSpec::new("cam-3")).await.unwrap();
    let feeder = feed_frames(&h.coordinator, &stream).await;

    let status = wait_for(&h.coordinator, &stream, |s| s.state == StreamState::Paused).await;
    assert_eq!(status.suspended_rules.len(), 1);
    assert_eq!(status.suspended_rules[0].as_str(), "phone");
    assert!(status.degraded_ticks >= 3);
    assert_eq!(status.events_emitted, 0);
    let last_error = status.last_error.expect("last error recorded");
    assert_eq!(last_error.class.as_str(), "inference_failure");

    feeder.abort();
    h.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reload_publishes_new_generation() {
    let h = harness(FakeBackend::new(false), WorkerConfig::default());
    let before = h.coordinator.rules().generation();

    let reloaded = h
        .coordinator
        .reload_rules(RuleSource::Json(PHONE_RULES.replace("\"min_hits\": 2", "\"min_hits\": 4")))
        .await
        .unwrap();
    assert_eq!(reloaded.generation(), before + 1);

    let rejected = h
        .coordinator
        .reload_rules(RuleSource::Json(PHONE_RULES.replace("\"min_hits\": 2", "\"min_hits\": 0")))
        .await;
    assert!(matches!(rejected, Err(WorkerError::Catalog(_))));
    assert_eq!(h.coordinator.rules().generation(), before + 1);

    assert!(matches!(
        h.coordinator.reload_from_config().await,
        Err(WorkerError::Config(_))
    ));
}
