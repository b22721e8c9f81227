//! Worker error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use vigil_engine::{CatalogError, EngineError};
use vigil_inference::InferenceError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Stream already running: {0}")]
    StreamExists(String),

    #[error("Stream is not running: {0}")]
    StreamStopped(String),

    #[error("Stream limit reached ({0} active)")]
    CapacityExceeded(usize),

    #[error("Rule catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Frame source error: {0}")]
    Source(String),

    #[error("Event sink error: {0}")]
    Sink(String),

    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<EngineError> for WorkerError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InternalInvariant(msg) => Self::InternalInvariant(msg),
            EngineError::UnknownProfile(name) => Self::Config(format!("unknown calibration profile '{name}'")),
        }
    }
}

impl WorkerError {
    pub fn stream_not_found(id: impl fmt::Display) -> Self {
        Self::StreamNotFound(id.to_string())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Inference(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Fatal errors stop the affected stream.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::InternalInvariant(_))
    }

    /// Classification shown in stream status.
    pub fn class(&self) -> ErrorClass {
        match self {
            WorkerError::Catalog(_) | WorkerError::Config(_) => ErrorClass::ConfigValidation,
            WorkerError::Inference(e) => ErrorClass::from(e),
            WorkerError::Source(_) => ErrorClass::MissingInput,
            WorkerError::InternalInvariant(_) => ErrorClass::InternalInvariant,
            WorkerError::StreamNotFound(_)
            | WorkerError::StreamExists(_)
            | WorkerError::StreamStopped(_)
            | WorkerError::CapacityExceeded(_)
            | WorkerError::Sink(_) => ErrorClass::Operational,
        }
    }
}

/// Coarse error taxonomy reported per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ConfigValidation,
    MissingInput,
    Backpressure,
    InferenceFailure,
    InternalInvariant,
    Operational,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::ConfigValidation => "config_validation",
            ErrorClass::MissingInput => "missing_input",
            ErrorClass::Backpressure => "backpressure",
            ErrorClass::InferenceFailure => "inference_failure",
            ErrorClass::InternalInvariant => "internal_invariant",
            ErrorClass::Operational => "operational",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&InferenceError> for ErrorClass {
    fn from(e: &InferenceError) -> Self {
        match e {
            InferenceError::Backpressure { .. } => ErrorClass::Backpressure,
            InferenceError::DeadlineExceeded(_) | InferenceError::Cancelled(_) => ErrorClass::MissingInput,
            InferenceError::UnknownModel(_) => ErrorClass::ConfigValidation,
            _ => ErrorClass::InferenceFailure,
        }
    }
}
