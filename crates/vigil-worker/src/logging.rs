//! Structured stream logging utilities.

use tracing::{error, info, warn, Span};
use vigil_models::StreamId;

/// Stream logger with consistent lifecycle lines.
#[derive(Debug, Clone)]
pub struct StreamLogger {
    stream_id: String,
    profile: String,
}

impl StreamLogger {
    pub fn new(stream_id: &StreamId, profile: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            profile: profile.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            stream_id = %self.stream_id,
            profile = %self.profile,
            "Stream started: {}", message
        );
    }

    pub fn log_state(&self, message: &str) {
        info!(
            stream_id = %self.stream_id,
            profile = %self.profile,
            "Stream state: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            stream_id = %self.stream_id,
            profile = %self.profile,
            "Stream warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            stream_id = %self.stream_id,
            profile = %self.profile,
            "Stream error: {}", message
        );
    }

    pub fn log_stop(&self, message: &str) {
        info!(
            stream_id = %self.stream_id,
            profile = %self.profile,
            "Stream stopped: {}", message
        );
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Span wrapping the worker task.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "stream",
            stream_id = %self.stream_id,
            profile = %self.profile
        )
    }
}
