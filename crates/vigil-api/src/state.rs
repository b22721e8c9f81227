//! Application state.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use vigil_engine::{PressureGauge, RiskScheduler, RuleCatalog, RuleSource, SchedulerConfig};
use vigil_inference::{BatcherConfig, HttpPerceptionClient, InferenceBatcher};
use vigil_worker::{Coordinator, TracingSink, WorkerConfig};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub coordinator: Arc<Coordinator>,
    /// One permit per frame push in flight.
    pub frame_admission: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: ApiConfig, coordinator: Arc<Coordinator>) -> Self {
        let frame_admission = Arc::new(Semaphore::new(config.max_inflight_frames.max(1)));
        Self {
            config,
            coordinator,
            frame_admission,
        }
    }

    /// Build the whole pipeline from environment configuration.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_env(config: ApiConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut worker_config = WorkerConfig::from_env()?;
        worker_config.max_streams = config.max_streams;
        worker_config.rules_path = Some(config.rules_path.clone());
        let batcher_config = BatcherConfig::from_env()?;
        let scheduler_config = SchedulerConfig::from_env();

        let registry = worker_config.models.clone();
        let catalog = match config.startup_rules() {
            Some(path) => RuleCatalog::from_source(registry.clone(), RuleSource::file(path))?,
            None => {
                warn!(path = %config.rules_path.display(), "No rules file, starting with an empty rule set");
                RuleCatalog::new(registry.clone())
            }
        };
        info!(
            models = registry.len(),
            max_streams = worker_config.max_streams,
            rules = catalog.snapshot().len(),
            "Rule catalog ready"
        );

        let pressure = Arc::new(PressureGauge::new());
        let scheduler = RiskScheduler::with_gauge(scheduler_config, Arc::clone(&pressure));

        let backend = Arc::new(HttpPerceptionClient::from_env()?);
        let batcher = InferenceBatcher::start(
            batcher_config,
            registry.iter().map(|(id, _)| id.clone()),
            backend,
            pressure,
        );

        let coordinator = Coordinator::new(
            worker_config,
            Arc::new(catalog),
            Arc::new(scheduler),
            batcher,
            Arc::new(TracingSink),
        );

        Ok(Self::new(config, Arc::new(coordinator)))
    }
}
