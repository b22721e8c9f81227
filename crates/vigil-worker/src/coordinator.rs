//! Pipeline coordinator.
//!
//! Owns one worker task per active stream and routes administrative
//! operations to it. Workers never share state with each other; the
//! coordinator only holds their control channels and frame sources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use vigil_engine::{RiskScheduler, RuleCatalog, RuleSet, RuleSource};
use vigil_inference::InferenceBatcher;
use vigil_models::{FrameData, RiskTier, StreamId};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::metrics::{set_active_streams, set_rules_generation};
use crate::sink::EventSink;
use crate::source::{FrameSource, LatestFrameSource};
use crate::status::{StatusBoard, StreamState, StreamStatus};
use crate::stream_worker::{Command, Control, StreamSpec, StreamWorker, WorkerDeps};

struct StreamHandle {
    commands: mpsc::Sender<Command>,
    source: Arc<LatestFrameSource>,
    task: JoinHandle<StreamState>,
}

/// Starts, stops and steers stream workers.
pub struct Coordinator {
    deps: WorkerDeps,
    streams: Mutex<HashMap<StreamId, StreamHandle>>,
}

impl Coordinator {
    pub fn new(
        config: WorkerConfig,
        catalog: Arc<RuleCatalog>,
        scheduler: Arc<RiskScheduler>,
        batcher: InferenceBatcher,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        set_rules_generation(catalog.snapshot().generation());
        Self {
            deps: WorkerDeps {
                config: Arc::new(config),
                catalog,
                scheduler,
                batcher,
                sink,
                status: StatusBoard::new(),
            },
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.deps.config
    }

    pub fn catalog(&self) -> &Arc<RuleCatalog> {
        &self.deps.catalog
    }

    pub fn scheduler(&self) -> &Arc<RiskScheduler> {
        &self.deps.scheduler
    }

    pub fn batcher(&self) -> &InferenceBatcher {
        &self.deps.batcher
    }

    pub fn status_board(&self) -> &StatusBoard {
        &self.deps.status
    }

    /// Start a worker for `spec`.
    pub async fn start_stream(&self, spec: StreamSpec) -> WorkerResult<StreamStatus> {
        let mut streams = self.streams.lock().await;

        if let Some(existing) = streams.get(&spec.stream_id) {
            if !existing.task.is_finished() {
                return Err(WorkerError::StreamExists(spec.stream_id.to_string()));
            }
            streams.remove(&spec.stream_id);
        }
        if streams.len() >= self.deps.config.max_streams {
            return Err(WorkerError::CapacityExceeded(streams.len()));
        }
        if let Some(models) = &spec.models {
            let registry = self.deps.catalog.registry();
            if let Some(unknown) = models.iter().find(|m| !registry.contains(m)) {
                return Err(WorkerError::config_error(format!("unknown model '{unknown}'")));
            }
        }

        let stream_id = spec.stream_id.clone();
        let source = Arc::new(LatestFrameSource::new(stream_id.clone()));
        let worker = StreamWorker::new(spec, self.deps.clone(), Arc::clone(&source) as Arc<dyn FrameSource>)?;
        let status = worker.status().clone();
        let span = worker.logger().create_span();
        self.deps.status.publish(status.clone()).await;

        let (tx, rx) = mpsc::channel(self.deps.config.control_buffer.max(1));
        let task = tokio::spawn(worker.run(rx).instrument(span));

        streams.insert(
            stream_id.clone(),
            StreamHandle {
                commands: tx,
                source,
                task,
            },
        );
        set_active_streams(streams.len());
        info!(stream_id = %stream_id, active = streams.len(), "Stream started");

        Ok(status)
    }

    /// Stop a stream, discard its queued inference requests and drop its status.
    pub async fn stop_stream(&self, stream_id: &StreamId) -> WorkerResult<StreamStatus> {
        let handle = {
            let mut streams = self.streams.lock().await;
            let handle = streams
                .remove(stream_id)
                .ok_or_else(|| WorkerError::stream_not_found(stream_id))?;
            set_active_streams(streams.len());
            handle
        };

        let final_status = self.stop_handle(stream_id, handle).await;
        let cancelled = self.deps.batcher.cancel_stream(stream_id);
        let last = self.deps.status.remove(stream_id).await;
        info!(stream_id = %stream_id, cancelled, "Stream stopped");

        final_status
            .or(last)
            .ok_or_else(|| WorkerError::stream_not_found(stream_id))
    }

    async fn stop_handle(&self, stream_id: &StreamId, mut handle: StreamHandle) -> Option<StreamStatus> {
        let (ack, ack_rx) = oneshot::channel();
        let sent = handle
            .commands
            .send(Command {
                control: Control::Stop,
                ack,
            })
            .await
            .is_ok();
        let acked = if sent { ack_rx.await.ok() } else { None };

        match tokio::time::timeout(self.deps.config.stop_timeout, &mut handle.task).await {
            Ok(_) => {}
            Err(_) => {
                warn!(stream_id = %stream_id, "Worker did not stop in time, aborting");
                handle.task.abort();
            }
        }
        acked
    }

    pub async fn pause(&self, stream_id: &StreamId) -> WorkerResult<StreamStatus> {
        self.send(stream_id, Control::Pause).await
    }

    pub async fn resume(&self, stream_id: &StreamId) -> WorkerResult<StreamStatus> {
        self.send(stream_id, Control::Resume).await
    }

    /// Force a stream's tier for `hold`, or until cleared.
    pub async fn force_tier(
        &self,
        stream_id: &StreamId,
        tier: RiskTier,
        hold: Option<Duration>,
    ) -> WorkerResult<StreamStatus> {
        self.send(stream_id, Control::ForceTier { tier, hold }).await
    }

    pub async fn clear_tier(&self, stream_id: &StreamId) -> WorkerResult<StreamStatus> {
        self.send(stream_id, Control::ClearTier).await
    }

    async fn send(&self, stream_id: &StreamId, control: Control) -> WorkerResult<StreamStatus> {
        let commands = {
            let streams = self.streams.lock().await;
            streams
                .get(stream_id)
                .map(|h| h.commands.clone())
                .ok_or_else(|| WorkerError::stream_not_found(stream_id))?
        };

        let (ack, ack_rx) = oneshot::channel();
        commands
            .send(Command { control, ack })
            .await
            .map_err(|_| WorkerError::StreamStopped(stream_id.to_string()))?;
        ack_rx
            .await
            .map_err(|_| WorkerError::StreamStopped(stream_id.to_string()))
    }

    /// Publish a captured frame. Returns its sequence number.
    pub async fn push_frame(&self, stream_id: &StreamId, image: FrameData) -> WorkerResult<u64> {
        let streams = self.streams.lock().await;
        let handle = streams
            .get(stream_id)
            .ok_or_else(|| WorkerError::stream_not_found(stream_id))?;
        Ok(handle.source.publish(image))
    }

    /// Frame source of a running stream, for in-process capture.
    pub async fn frame_source(&self, stream_id: &StreamId) -> WorkerResult<Arc<LatestFrameSource>> {
        let streams = self.streams.lock().await;
        streams
            .get(stream_id)
            .map(|h| Arc::clone(&h.source))
            .ok_or_else(|| WorkerError::stream_not_found(stream_id))
    }

    /// Validate and publish a new rule set. Running workers pick it up on
    /// their next tick; a failed reload leaves the current set in place.
    pub async fn reload_rules(&self, source: RuleSource) -> WorkerResult<Arc<RuleSet>> {
        match self.deps.catalog.reload(source) {
            Ok(rules) => {
                set_rules_generation(rules.generation());
                info!(
                    generation = rules.generation(),
                    rules = rules.len(),
                    enabled = rules.enabled_count(),
                    "Rule set reloaded"
                );
                Ok(rules)
            }
            Err(e) => {
                warn!(error = %e, "Rule reload rejected");
                Err(e.into())
            }
        }
    }

    /// Reload from the configured rules file.
    pub async fn reload_from_config(&self) -> WorkerResult<Arc<RuleSet>> {
        let path = self
            .deps
            .config
            .rules_path
            .clone()
            .ok_or_else(|| WorkerError::config_error("no rules path configured"))?;
        self.reload_rules(RuleSource::file(path)).await
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.deps.catalog.snapshot()
    }

    pub async fn status(&self, stream_id: &StreamId) -> WorkerResult<StreamStatus> {
        self.deps
            .status
            .get(stream_id)
            .await
            .ok_or_else(|| WorkerError::stream_not_found(stream_id))
    }

    pub async fn list(&self) -> Vec<StreamStatus> {
        self.deps.status.list().await
    }

    pub async fn active_streams(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Stop every stream and the batcher.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut streams = self.streams.lock().await;
            streams.drain().collect()
        };
        info!(streams = handles.len(), "Stopping all streams");

        for (stream_id, handle) in handles {
            self.stop_handle(&stream_id, handle).await;
            self.deps.batcher.cancel_stream(&stream_id);
            self.deps.status.remove(&stream_id).await;
        }
        set_active_streams(0);
        self.deps.batcher.shutdown();
    }
}
