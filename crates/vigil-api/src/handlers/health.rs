//! Health check handler.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use vigil_inference::{DeviceUsage, LaneStats};

use crate::state::AppState;

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub active_streams: usize,
    pub rules_generation: u64,
    pub inference: InferenceHealth,
}

/// Batcher load as seen by the scheduler.
#[derive(Serialize)]
pub struct InferenceHealth {
    pub pressure_level: u8,
    pub queue_fill: f64,
    pub lanes: Vec<LaneStats>,
    pub devices: Vec<DeviceUsage>,
}

/// Liveness endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let coordinator = &state.coordinator;
    let pressure = coordinator.scheduler().pressure();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        active_streams: coordinator.active_streams().await,
        rules_generation: coordinator.rules().generation(),
        inference: InferenceHealth {
            pressure_level: pressure.level(),
            queue_fill: pressure.fill(),
            lanes: coordinator.batcher().lane_stats(),
            devices: coordinator.batcher().device_usage(),
        },
    })
}
