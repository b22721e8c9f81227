//! Inference error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for inference operations.
pub type InferenceResult<T> = Result<T, InferenceError>;

/// Errors that can occur while submitting or running inference.
#[derive(Debug, Error, Clone)]
pub enum InferenceError {
    #[error("Backpressure: {model} queue is full ({queued} pending)")]
    Backpressure { model: String, queued: usize },

    #[error("Inference failed, retry later: {0}")]
    Retryable(String),

    #[error("No result within {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Request cancelled: stream {0} stopped")]
    Cancelled(String),

    #[error("Batcher is shutting down")]
    ShuttingDown,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Perception service error {0}: {1}")]
    ServerError(u16, String),

    #[error("Request rejected ({0}): {1}")]
    RequestFailed(u16, String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for InferenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl InferenceError {
    pub fn backpressure(model: impl Into<String>, queued: usize) -> Self {
        Self::Backpressure {
            model: model.into(),
            queued,
        }
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Map a non-success HTTP status from the perception service.
    pub fn from_http_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 | 500..=599 => Self::ServerError(status, body),
            _ => Self::RequestFailed(status, body),
        }
    }

    /// Check if a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Retryable(_) | InferenceError::Network(_) | InferenceError::ServerError(_, _)
        )
    }

    /// Caller should back off rather than retry immediately.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, InferenceError::Backpressure { .. })
    }

    /// Errors the worker records as a missing-input tick.
    pub fn is_missing_input(&self) -> bool {
        matches!(self, InferenceError::DeadlineExceeded(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Backpressure { .. } => "backpressure",
            InferenceError::Retryable(_) => "retryable",
            InferenceError::DeadlineExceeded(_) => "deadline",
            InferenceError::UnknownModel(_) => "unknown_model",
            InferenceError::Cancelled(_) => "cancelled",
            InferenceError::ShuttingDown => "shutting_down",
            InferenceError::Network(_) => "network",
            InferenceError::ServerError(_, _) => "server",
            InferenceError::RequestFailed(_, _) => "request",
            InferenceError::InvalidResponse(_) => "invalid_response",
            InferenceError::Json(_) => "json",
        }
    }
}
