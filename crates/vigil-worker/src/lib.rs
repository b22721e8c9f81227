//! Stream workers and the pipeline coordinator.
//!
//! This crate provides:
//! - One worker task per active stream, driven by the risk scheduler
//! - Frame sources and event sinks
//! - A status board for the admin surface
//! - Retry with exponential backoff and failure tracking
//! - Structured stream logging and metrics

pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod sink;
pub mod source;
pub mod status;
pub mod stream_worker;

pub use config::WorkerConfig;
pub use coordinator::Coordinator;
pub use error::{ErrorClass, WorkerError, WorkerResult};
pub use logging::StreamLogger;
pub use retry::{retry_async, FailureTracker, RetryConfig, RetryResult};
pub use sink::{ChannelSink, EventSink, TracingSink};
pub use source::{FrameSource, LatestFrameSource};
pub use status::{LastError, StatusBoard, StreamState, StreamStatus};
pub use stream_worker::{Control, StreamSpec};
