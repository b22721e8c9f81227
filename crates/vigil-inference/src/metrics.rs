//! Batcher and perception-client metrics.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metric name constants for consistency.
pub mod names {
    /// Requests per dispatched batch, by model.
    pub const BATCH_SIZE: &str = "vigil_inference_batch_size";

    /// Pending requests, by model.
    pub const QUEUE_DEPTH: &str = "vigil_inference_queue_depth";

    /// Submissions refused because a queue was full, by model.
    pub const BACKPRESSURE_TOTAL: &str = "vigil_inference_backpressure_total";

    /// Batch latency in seconds, by model and device.
    pub const LATENCY_SECONDS: &str = "vigil_inference_latency_seconds";

    /// Time a closed batch waited for a device lease, by model.
    pub const DEVICE_WAIT_SECONDS: &str = "vigil_inference_device_wait_seconds";

    /// Failed batches, by model and error kind.
    pub const FAILURES_TOTAL: &str = "vigil_inference_failures_total";

    /// Perception service HTTP requests, by status.
    pub const REQUESTS_TOTAL: &str = "vigil_perception_requests_total";
}

pub fn record_batch(model: &str, device: &str, size: usize, latency_ms: f64) {
    histogram!(names::BATCH_SIZE, "model" => model.to_string()).record(size as f64);
    histogram!(
        names::LATENCY_SECONDS,
        "model" => model.to_string(),
        "device" => device.to_string()
    )
    .record(latency_ms / 1000.0);
}

pub fn record_device_wait(model: &str, wait: Duration) {
    histogram!(names::DEVICE_WAIT_SECONDS, "model" => model.to_string()).record(wait.as_secs_f64());
}

pub fn record_queue_depth(model: &str, depth: usize) {
    gauge!(names::QUEUE_DEPTH, "model" => model.to_string()).set(depth as f64);
}

pub fn record_backpressure(model: &str) {
    counter!(names::BACKPRESSURE_TOTAL, "model" => model.to_string()).increment(1);
}

pub fn record_failure(model: &str, kind: &str) {
    counter!(
        names::FAILURES_TOTAL,
        "model" => model.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_request(status: u16) {
    counter!(names::REQUESTS_TOTAL, "status" => status.to_string()).increment(1);
}
