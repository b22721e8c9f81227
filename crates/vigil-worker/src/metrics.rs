//! Pipeline metrics.

use metrics::{counter, gauge, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Frames analyzed, by stream.
    pub const FRAMES_PROCESSED_TOTAL: &str = "vigil_frames_processed_total";

    /// Due ticks without analysis, by reason (`no_frame`, `stale`, `inference`).
    pub const TICKS_SKIPPED_TOTAL: &str = "vigil_ticks_skipped_total";

    /// Slots skipped because a stream was served late.
    pub const MISSED_SLOTS_TOTAL: &str = "vigil_missed_slots_total";

    /// Events emitted, by rule and severity.
    pub const EVENTS_TOTAL: &str = "vigil_events_total";

    /// Events dropped by a full sink.
    pub const EVENTS_DROPPED_TOTAL: &str = "vigil_events_dropped_total";

    /// Rule evaluations skipped for missing model output, by rule.
    pub const DEGRADED_TICKS_TOTAL: &str = "vigil_degraded_ticks_total";

    /// Stream errors, by class.
    pub const STREAM_ERRORS_TOTAL: &str = "vigil_stream_errors_total";

    /// Tick duration in seconds.
    pub const TICK_DURATION_SECONDS: &str = "vigil_tick_duration_seconds";

    /// Running streams.
    pub const ACTIVE_STREAMS: &str = "vigil_active_streams";

    /// Posture recalibration rounds, by outcome (`updated`, `unchanged`, `rolled_back`).
    pub const CALIBRATION_ROUNDS_TOTAL: &str = "vigil_calibration_rounds_total";

    /// Current rule catalog generation.
    pub const RULES_GENERATION: &str = "vigil_rules_generation";
}

pub fn record_frame(stream_id: &str, duration_secs: f64) {
    counter!(names::FRAMES_PROCESSED_TOTAL, "stream" => stream_id.to_string()).increment(1);
    histogram!(names::TICK_DURATION_SECONDS).record(duration_secs);
}

pub fn record_skipped_tick(reason: &'static str) {
    counter!(names::TICKS_SKIPPED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_missed_slots(count: u64) {
    if count > 0 {
        counter!(names::MISSED_SLOTS_TOTAL).increment(count);
    }
}

pub fn record_event(rule_id: &str, severity: &'static str) {
    counter!(
        names::EVENTS_TOTAL,
        "rule" => rule_id.to_string(),
        "severity" => severity
    )
    .increment(1);
}

pub fn record_event_dropped() {
    counter!(names::EVENTS_DROPPED_TOTAL).increment(1);
}

pub fn record_degraded(rule_id: &str) {
    counter!(names::DEGRADED_TICKS_TOTAL, "rule" => rule_id.to_string()).increment(1);
}

pub fn record_stream_error(class: &'static str) {
    counter!(names::STREAM_ERRORS_TOTAL, "class" => class).increment(1);
}

pub fn record_calibration_round(outcome: &'static str) {
    counter!(names::CALIBRATION_ROUNDS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn set_active_streams(count: usize) {
    gauge!(names::ACTIVE_STREAMS).set(count as f64);
}

pub fn set_rules_generation(generation: u64) {
    gauge!(names::RULES_GENERATION).set(generation as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::FRAMES_PROCESSED_TOTAL.ends_with("_total"));
        assert!(names::EVENTS_TOTAL.starts_with("vigil_"));
        assert!(names::TICK_DURATION_SECONDS.contains("duration"));
        assert!(names::CALIBRATION_ROUNDS_TOTAL.ends_with("_total"));
    }
}
