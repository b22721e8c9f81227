//! API routes.

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::handlers::{
    clear_tier, force_tier, get_rules, get_rules_schema, get_stream, health, list_streams, pause_stream, push_frame, reload_rules,
    resume_stream, start_stream, stop_stream,
};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, frame_admission, request_id, request_logging};
use crate::state::AppState;

/// Create the server router.
///
/// Frame pushes get their own body limit, deadline and admission gate;
/// every other route shares the admin limits.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let config = &state.config;

    let frame_routes = Router::new()
        .route("/streams/:stream_id/frames", post(push_frame))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.frame_body_limit))
        .layer(TimeoutLayer::new(config.frame_timeout))
        .layer(middleware::from_fn_with_state(state.clone(), frame_admission));

    let stream_routes = Router::new()
        .route("/streams", get(list_streams).post(start_stream))
        .route("/streams/:stream_id", get(get_stream).delete(stop_stream))
        .route("/streams/:stream_id/pause", post(pause_stream))
        .route("/streams/:stream_id/resume", post(resume_stream))
        .route("/streams/:stream_id/tier", put(force_tier).delete(clear_tier));

    let rule_routes = Router::new()
        .route("/rules", get(get_rules))
        .route("/rules/schema", get(get_rules_schema))
        .route("/rules/reload", post(reload_rules));

    let health_routes = Router::new().route("/health", get(health));

    // Metrics endpoint (if enabled)
    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    let admin_routes = Router::new()
        .merge(stream_routes)
        .merge(rule_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.admin_body_limit))
        .layer(TimeoutLayer::new(config.admin_timeout));

    let cors = cors_layer(&config.cors_origins);
    Router::new()
        .merge(frame_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors)
        .with_state(state)
}
