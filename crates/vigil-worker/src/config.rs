//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use vigil_engine::{CalibratorConfig, ModelRegistry};

use crate::error::{WorkerError, WorkerResult};
use crate::retry::RetryConfig;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrently running streams
    pub max_streams: usize,
    /// Rule document loaded at startup and on reload
    pub rules_path: Option<PathBuf>,
    /// Registered perception models
    pub models: ModelRegistry,
    /// Consecutive missing-input ticks before a rule is suspended
    pub suspend_after_misses: u32,
    /// Retries for a retryable inference failure
    pub inference_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Consecutive failed ticks before a stream pauses itself (0 disables)
    pub auto_pause_after: u32,
    /// Buffer of each stream's control channel
    pub control_buffer: usize,
    /// How long `stop_stream` waits for a worker to exit
    pub stop_timeout: Duration,
    /// Online posture recalibration; off when `None`
    pub calibration: Option<CalibratorConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_streams: 64,
            rules_path: None,
            models: ModelRegistry::new(),
            suspend_after_misses: 5,
            inference_retries: 2,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_millis(500),
            auto_pause_after: 20,
            control_buffer: 16,
            stop_timeout: Duration::from_secs(5),
            calibration: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> WorkerResult<Self> {
        let models = match std::env::var("VIGIL_MODELS") {
            Ok(list) => ModelRegistry::parse_list(&list).map_err(|e| WorkerError::config_error(e.to_string()))?,
            Err(_) => ModelRegistry::new(),
        };

        Ok(Self {
            max_streams: std::env::var("VIGIL_MAX_STREAMS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(64),
            rules_path: std::env::var("VIGIL_RULES_PATH").ok().map(PathBuf::from),
            models,
            suspend_after_misses: std::env::var("WORKER_SUSPEND_AFTER_MISSES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            inference_retries: std::env::var("WORKER_INFERENCE_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            retry_base_delay: Duration::from_millis(
                std::env::var("WORKER_RETRY_BASE_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(50),
            ),
            retry_max_delay: Duration::from_millis(
                std::env::var("WORKER_RETRY_MAX_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            ),
            auto_pause_after: std::env::var("WORKER_AUTO_PAUSE_AFTER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),
            control_buffer: 16,
            stop_timeout: Duration::from_secs(
                std::env::var("WORKER_STOP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            calibration: std::env::var("CALIBRATION_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false)
                .then(CalibratorConfig::from_env),
        })
    }

    /// Retry policy for inference calls.
    pub fn inference_retry(&self) -> RetryConfig {
        RetryConfig::new("inference")
            .with_max_retries(self.inference_retries)
            .with_base_delay(self.retry_base_delay)
            .with_max_delay(self.retry_max_delay)
    }
}
