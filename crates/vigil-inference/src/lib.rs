//! Shared access to the perception models.
//!
//! This crate provides:
//! - [`InferenceBatcher`]: per-model micro-batching with bounded queues
//! - [`DevicePool`]: round-robin dispatch within per-device budgets
//! - [`PerceptionBackend`]: the model contract, with [`HttpPerceptionClient`]
//!   as the production implementation

pub mod backend;
pub mod batcher;
pub mod client;
pub mod config;
pub mod devices;
pub mod error;
pub mod metrics;

pub use backend::PerceptionBackend;
pub use batcher::{InferenceBatcher, LaneStats};
pub use client::{HttpPerceptionClient, PerceptionClientConfig};
pub use config::{BatcherConfig, DeviceSpec, OverflowPolicy};
pub use devices::{DeviceLease, DevicePool, DeviceUsage};
pub use error::{InferenceError, InferenceResult};
