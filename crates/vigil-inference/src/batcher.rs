//! Micro-batching admission layer.
//!
//! Requests are queued per model. A collector task per model closes a
//! batch when it reaches `max_batch_size` or when its oldest request has
//! waited `batch_timeout`, whichever comes first, and hands it to a free
//! device slot. A full queue refuses (or briefly delays) new submissions,
//! and the fill level is published to the scheduler's [`PressureGauge`].
//!
//! A closed batch may still wait for a device lease when every slot is
//! busy, so its requests can be older than `batch_timeout` at dispatch.
//! That wait is recorded per batch.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vigil_engine::PressureGauge;
use vigil_models::{Frame, InferenceOutput, ModelId, StreamId};

use crate::backend::PerceptionBackend;
use crate::config::{BatcherConfig, OverflowPolicy};
use crate::devices::{DeviceLease, DevicePool, DeviceUsage};
use crate::error::{InferenceError, InferenceResult};
use crate::metrics::{record_backpressure, record_batch, record_device_wait, record_failure, record_queue_depth};

type Reply = oneshot::Sender<InferenceResult<InferenceOutput>>;

/// A queued request. The admission permit is held until the request
/// leaves the queue.
struct Pending {
    frame: Frame,
    reply: Reply,
    submitted: Instant,
    _admission: OwnedSemaphorePermit,
}

/// Queue of one model.
struct Lane {
    model: ModelId,
    capacity: usize,
    pending: Mutex<VecDeque<Pending>>,
    admission: Arc<Semaphore>,
    notify: Notify,
    /// Microseconds the last closed batch waited for a device.
    device_wait_us: AtomicU64,
}

impl Lane {
    fn new(model: ModelId, capacity: usize) -> Self {
        Self {
            model,
            capacity,
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            admission: Arc::new(Semaphore::new(capacity)),
            notify: Notify::new(),
            device_wait_us: AtomicU64::new(0),
        }
    }

    fn set_device_wait(&self, wait: Duration) {
        self.device_wait_us
            .store(u64::try_from(wait.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
        record_device_wait(self.model.as_str(), wait);
    }

    fn device_wait(&self) -> Duration {
        Duration::from_micros(self.device_wait_us.load(Ordering::Relaxed))
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn depth(&self) -> usize {
        self.queue().len()
    }

    fn oldest(&self) -> Option<Instant> {
        self.queue().front().map(|p| p.submitted)
    }

    fn push(&self, pending: Pending) {
        let depth = {
            let mut queue = self.queue();
            queue.push_back(pending);
            queue.len()
        };
        record_queue_depth(self.model.as_str(), depth);
        self.notify.notify_one();
    }

    /// Take up to `max` live requests. Requests whose caller went away are dropped.
    fn drain(&self, max: usize) -> Vec<Pending> {
        let mut batch = Vec::with_capacity(max);
        let depth = {
            let mut queue = self.queue();
            while batch.len() < max {
                let Some(pending) = queue.pop_front() else { break };
                if pending.reply.is_closed() {
                    continue;
                }
                batch.push(pending);
            }
            queue.len()
        };
        record_queue_depth(self.model.as_str(), depth);
        batch
    }

    fn remove_stream(&self, stream_id: &StreamId) -> Vec<Pending> {
        let mut queue = self.queue();
        let (removed, kept): (VecDeque<Pending>, VecDeque<Pending>) =
            queue.drain(..).partition(|p| &p.frame.stream_id == stream_id);
        *queue = kept;
        removed.into()
    }

    fn fail_all(&self, err: InferenceError) {
        let drained: Vec<Pending> = self.queue().drain(..).collect();
        for pending in drained {
            let _ = pending.reply.send(Err(err.clone()));
        }
    }
}

/// Queue statistics of one model.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LaneStats {
    pub model: String,
    pub pending: usize,
    pub capacity: usize,
    /// How long the most recent batch waited for a device lease.
    pub last_device_wait_ms: f64,
}

struct Shared {
    config: BatcherConfig,
    lanes: HashMap<ModelId, Arc<Lane>>,
    devices: DevicePool,
    backend: Arc<dyn PerceptionBackend>,
    pressure: Arc<PressureGauge>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn publish_pressure(&self) {
        let fill = self
            .lanes
            .values()
            .map(|lane| lane.depth() as f64 / lane.capacity.max(1) as f64)
            .fold(0.0, f64::max);
        self.pressure.publish_fill(fill);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Shared front door to the perception backend.
#[derive(Clone)]
pub struct InferenceBatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InferenceBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceBatcher")
            .field("models", &self.shared.lanes.keys().collect::<Vec<_>>())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl InferenceBatcher {
    /// Create a lane per model and spawn its collector.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: BatcherConfig,
        models: impl IntoIterator<Item = ModelId>,
        backend: Arc<dyn PerceptionBackend>,
        pressure: Arc<PressureGauge>,
    ) -> Self {
        let lanes: HashMap<ModelId, Arc<Lane>> = models
            .into_iter()
            .map(|model| (model.clone(), Arc::new(Lane::new(model, config.queue_size.max(1)))))
            .collect();
        let devices = DevicePool::new(&config.devices, config.max_batches_per_device);
        let (shutdown, _) = watch::channel(false);

        info!(
            models = lanes.len(),
            max_batch_size = config.max_batch_size,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            queue_size = config.queue_size,
            device_slots = devices.capacity(),
            overflow = %config.overflow,
            "Starting inference batcher"
        );

        let shared = Arc::new(Shared {
            config,
            lanes,
            devices,
            backend,
            pressure,
            shutdown,
        });

        for lane in shared.lanes.values() {
            tokio::spawn(run_collector(Arc::clone(lane), Arc::clone(&shared)));
        }

        Self { shared }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.shared.config
    }

    pub fn pressure(&self) -> &Arc<PressureGauge> {
        &self.shared.pressure
    }

    /// Run `model` on `frame`, sharing a batch with other callers.
    pub async fn submit(&self, model: &ModelId, frame: Frame) -> InferenceResult<InferenceOutput> {
        let shared = &self.shared;
        let lane = shared
            .lanes
            .get(model)
            .ok_or_else(|| InferenceError::UnknownModel(model.to_string()))?;
        if shared.is_shutting_down() {
            return Err(InferenceError::ShuttingDown);
        }

        let admission = match shared.config.overflow {
            OverflowPolicy::Reject => Arc::clone(&lane.admission).try_acquire_owned().ok(),
            OverflowPolicy::Wait => {
                match tokio::time::timeout(shared.config.max_wait, Arc::clone(&lane.admission).acquire_owned()).await {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => return Err(InferenceError::ShuttingDown),
                    Err(_) => None,
                }
            }
        };
        let Some(admission) = admission else {
            record_backpressure(model.as_str());
            shared.publish_pressure();
            return Err(InferenceError::backpressure(model.as_str(), lane.depth()));
        };

        let (reply, rx) = oneshot::channel();
        lane.push(Pending {
            frame,
            reply,
            submitted: Instant::now(),
            _admission: admission,
        });
        shared.publish_pressure();

        let deadline = shared.config.result_deadline;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(InferenceError::retryable("batch dropped before completion")),
            Err(_) => Err(InferenceError::DeadlineExceeded(deadline)),
        }
    }

    /// Discard queued requests of a stopped stream. Returns how many.
    pub fn cancel_stream(&self, stream_id: &StreamId) -> usize {
        let mut cancelled = 0;
        for lane in self.shared.lanes.values() {
            for pending in lane.remove_stream(stream_id) {
                let _ = pending.reply.send(Err(InferenceError::Cancelled(stream_id.to_string())));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(stream_id = %stream_id, cancelled, "Discarded queued inference requests");
            self.shared.publish_pressure();
        }
        cancelled
    }

    pub fn queue_depth(&self, model: &ModelId) -> Option<usize> {
        self.shared.lanes.get(model).map(|lane| lane.depth())
    }

    pub fn lane_stats(&self) -> Vec<LaneStats> {
        let mut stats: Vec<LaneStats> = self
            .shared
            .lanes
            .values()
            .map(|lane| LaneStats {
                model: lane.model.to_string(),
                pending: lane.depth(),
                capacity: lane.capacity,
                last_device_wait_ms: lane.device_wait().as_secs_f64() * 1000.0,
            })
            .collect();
        stats.sort_by(|a, b| a.model.cmp(&b.model));
        stats
    }

    pub fn device_usage(&self) -> Vec<DeviceUsage> {
        self.shared.devices.usage()
    }

    /// Stop collectors and fail everything still queued.
    pub fn shutdown(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down inference batcher");
        self.shared.devices.close();
        for lane in self.shared.lanes.values() {
            lane.fail_all(InferenceError::ShuttingDown);
        }
    }
}

async fn run_collector(lane: Arc<Lane>, shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let max_batch = shared.config.max_batch_size.max(1);

    loop {
        let oldest = loop {
            if *shutdown.borrow() {
                lane.fail_all(InferenceError::ShuttingDown);
                return;
            }
            if let Some(oldest) = lane.oldest() {
                break oldest;
            }
            tokio::select! {
                _ = lane.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
        };

        let close_at = oldest + shared.config.batch_timeout;
        while lane.depth() < max_batch {
            tokio::select! {
                _ = tokio::time::sleep_until(close_at) => break,
                _ = lane.notify.notified() => {}
                _ = shutdown.changed() => break,
            }
        }

        let batch = lane.drain(max_batch);
        shared.publish_pressure();
        if batch.is_empty() {
            continue;
        }

        let waiting = Instant::now();
        let lease = tokio::select! {
            lease = shared.devices.acquire() => lease,
            _ = shutdown.changed() => None,
        };
        lane.set_device_wait(waiting.elapsed());
        let Some(lease) = lease else {
            for pending in batch {
                let _ = pending.reply.send(Err(InferenceError::ShuttingDown));
            }
            continue;
        };

        tokio::spawn(dispatch(Arc::clone(&shared), lane.model.clone(), lease, batch));
    }
}

async fn dispatch(shared: Arc<Shared>, model: ModelId, lease: DeviceLease, batch: Vec<Pending>) {
    let (frames, replies): (Vec<Frame>, Vec<Reply>) = batch.into_iter().map(|p| (p.frame, p.reply)).unzip();
    let size = frames.len();
    let started = Instant::now();

    let result = shared.backend.infer_batch(&model, lease.device(), &frames).await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    let device = lease.device().to_string();
    drop(lease);

    let outputs = match result {
        Ok(outputs) if outputs.len() == size => outputs,
        Ok(outputs) => {
            let err = InferenceError::retryable(format!(
                "backend returned {} results for {} frames",
                outputs.len(),
                size
            ));
            fail_batch(&model, &device, replies, err);
            return;
        }
        Err(err) => {
            fail_batch(&model, &device, replies, err);
            return;
        }
    };

    record_batch(model.as_str(), &device, size, latency_ms);
    debug!(model = %model, device = %device, size, latency_ms, "Batch complete");
    for (reply, output) in replies.into_iter().zip(outputs) {
        let _ = reply.send(Ok(output));
    }
}

fn fail_batch(model: &ModelId, device: &str, replies: Vec<Reply>, err: InferenceError) {
    warn!(model = %model, device = %device, size = replies.len(), error = %err, "Inference batch failed");
    record_failure(model.as_str(), err.kind());
    for reply in replies {
        let _ = reply.send(Err(err.clone()));
    }
}
