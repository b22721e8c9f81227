//! Admin HTTP API for the Vigil pipeline.
//!
//! This crate provides:
//! - Stream lifecycle, pause/resume and risk tier control
//! - Frame ingestion for push-based capture
//! - Rule set inspection and hot reload
//! - Health and Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
