//! Batcher configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What `submit` does when a model's pending queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Fail immediately with `Backpressure`.
    #[default]
    Reject,
    /// Wait up to `max_wait` for room, then fail with `Backpressure`.
    Wait,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::Reject => "reject",
            OverflowPolicy::Wait => "wait",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reject" | "fail" => Ok(OverflowPolicy::Reject),
            "wait" | "block" => Ok(OverflowPolicy::Wait),
            other => Err(format!("unknown overflow policy '{other}'")),
        }
    }
}

/// A compute device and its share of memory.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub name: String,
    pub memory_fraction: f64,
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, memory_fraction: f64) -> Self {
        Self {
            name: name.into(),
            memory_fraction,
        }
    }

    /// Concurrent batches this device may run.
    pub fn batch_budget(&self, max_batches_per_device: usize) -> usize {
        let share = (self.memory_fraction.clamp(0.0, 1.0) * max_batches_per_device as f64).floor();
        (share as usize).max(1)
    }

    /// Parse `name:fraction` entries, e.g. `cuda:0:0.8,cuda:1:0.5`.
    /// A fraction has a decimal point; a bare name gets the whole device.
    pub fn parse_list(list: &str) -> Result<Vec<Self>, String> {
        let mut devices = Vec::new();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let device = match entry.rsplit_once(':') {
                Some((name, fraction)) if fraction.contains('.') => match fraction.parse::<f64>() {
                    Ok(f) if f > 0.0 && f <= 1.0 && !name.is_empty() => DeviceSpec::new(name, f),
                    _ => return Err(format!("device '{entry}': memory fraction must be in (0, 1]")),
                },
                _ => DeviceSpec::new(entry, 1.0),
            };
            devices.push(device);
        }
        Ok(devices)
    }
}

/// InferenceBatcher configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// A batch closes once it holds this many requests.
    pub max_batch_size: usize,
    /// ...or once its oldest request has waited this long.
    ///
    /// This bounds batch closing, not dispatch. When every device slot is
    /// busy a closed batch waits for a lease on top of this, reported as
    /// `vigil_inference_device_wait_seconds` and `LaneStats::last_device_wait_ms`.
    pub batch_timeout: Duration,
    /// Pending requests per model before overflow.
    pub queue_size: usize,
    pub overflow: OverflowPolicy,
    /// Bound on the `Wait` overflow policy.
    pub max_wait: Duration,
    /// Deadline on every result, measured from submission.
    pub result_deadline: Duration,
    pub max_batches_per_device: usize,
    pub devices: Vec<DeviceSpec>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            batch_timeout: Duration::from_millis(100),
            queue_size: 64,
            overflow: OverflowPolicy::Reject,
            max_wait: Duration::from_millis(500),
            result_deadline: Duration::from_secs(5),
            max_batches_per_device: 2,
            devices: vec![DeviceSpec::new("cpu", 1.0)],
        }
    }
}

impl BatcherConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        let devices = match std::env::var("VIGIL_DEVICES") {
            Ok(list) if !list.trim().is_empty() => DeviceSpec::parse_list(&list)?,
            _ => defaults.devices,
        };

        Ok(Self {
            max_batch_size: std::env::var("BATCHER_MAX_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_batch_size)
                .max(1),
            batch_timeout: Duration::from_millis(
                std::env::var("BATCHER_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(100),
            ),
            queue_size: std::env::var("BATCHER_QUEUE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.queue_size)
                .max(1),
            overflow: match std::env::var("BATCHER_OVERFLOW") {
                Ok(s) => s.parse()?,
                Err(_) => defaults.overflow,
            },
            max_wait: Duration::from_millis(
                std::env::var("BATCHER_MAX_WAIT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            ),
            result_deadline: Duration::from_millis(
                std::env::var("BATCHER_RESULT_DEADLINE_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5000),
            ),
            max_batches_per_device: std::env::var("BATCHER_MAX_BATCHES_PER_DEVICE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_batches_per_device)
                .max(1),
            devices,
        })
    }
}
