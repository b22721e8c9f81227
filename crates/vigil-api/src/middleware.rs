//! Request middleware: CORS, frame admission, request ids and access logs.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, Method, Request, Response};
use axum::middleware::Next;
use axum::response::IntoResponse;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// CORS layer for the configured origins.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().max_age(Duration::from_secs(600));
    if origins.iter().any(|o| o == "*") {
        return layer.allow_methods(Any).allow_headers(Any).allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    layer
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, REQUEST_ID])
        .expose_headers([REQUEST_ID])
        .allow_origin(origins)
}

/// Refuse a frame push with 503 once `max_inflight_frames` are in flight.
///
/// Capture clients retry on their own cadence, so queueing here would only
/// hand the worker stale frames.
pub async fn frame_admission(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response<Body> {
    let Ok(_permit) = state.frame_admission.clone().try_acquire_owned() else {
        let stream_id = stream_id_of(request.uri().path()).unwrap_or_default();
        debug!(stream_id, "Frame push refused, too many in flight");
        return ApiError::Unavailable("too many frame pushes in flight".to_string()).into_response();
    };
    next.run(request).await
}

/// Attach a request id and run the request inside a span carrying it
/// and, on stream routes, the stream id.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response<Body> {
    let request_id = request
        .headers()
        .get(&REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = match stream_id_of(request.uri().path()) {
        Some(stream_id) => info_span!("request", request_id = %request_id, stream_id = %stream_id),
        None => info_span!("request", request_id = %request_id),
    };
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID, value);
    }
    response
}

/// Access log. Frame pushes and scrapes only log at debug unless they fail.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let duration_ms = start.elapsed().as_millis() as u64;
    if status.is_server_error() {
        warn!(%method, %path, status = status.as_u16(), duration_ms, "Request failed");
    } else if is_high_volume(&path) {
        debug!(%method, %path, status = status.as_u16(), duration_ms, "Request completed");
    } else {
        info!(%method, %path, status = status.as_u16(), duration_ms, "Request completed");
    }
    response
}

fn is_high_volume(path: &str) -> bool {
    path == "/health" || path == "/metrics" || path.ends_with("/frames")
}

/// The `:stream_id` segment of a `/streams/...` path.
pub(crate) fn stream_id_of(path: &str) -> Option<&str> {
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.next()) {
        (Some("streams"), Some(id)) if !id.is_empty() => Some(id),
        _ => None,
    }
}
