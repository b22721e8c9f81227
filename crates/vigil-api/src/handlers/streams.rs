//! Stream lifecycle and control handlers.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use vigil_models::{FrameData, RiskTier, StreamId};
use vigil_worker::{StreamSpec, StreamStatus};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// List every stream.
pub async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamStatus>> {
    Json(state.coordinator.list().await)
}

/// Start a stream.
pub async fn start_stream(
    State(state): State<AppState>,
    Json(spec): Json<StreamSpec>,
) -> ApiResult<(StatusCode, Json<StreamStatus>)> {
    if spec.stream_id.as_str().trim().is_empty() {
        return Err(ApiError::bad_request("stream_id must not be empty"));
    }
    let status = state.coordinator.start_stream(spec).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

pub async fn get_stream(State(state): State<AppState>, Path(stream_id): Path<String>) -> ApiResult<Json<StreamStatus>> {
    Ok(Json(state.coordinator.status(&StreamId::from(stream_id)).await?))
}

/// Stop a stream and return its final status.
pub async fn stop_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    Ok(Json(state.coordinator.stop_stream(&StreamId::from(stream_id)).await?))
}

pub async fn pause_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    Ok(Json(state.coordinator.pause(&StreamId::from(stream_id)).await?))
}

pub async fn resume_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    Ok(Json(state.coordinator.resume(&StreamId::from(stream_id)).await?))
}

/// Force tier request.
#[derive(Debug, Deserialize)]
pub struct ForceTierRequest {
    pub tier: RiskTier,
    /// Hold in seconds; the tier stays until cleared when absent.
    #[serde(default)]
    pub hold_secs: Option<u64>,
}

/// Force a stream's risk tier.
pub async fn force_tier(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    Json(request): Json<ForceTierRequest>,
) -> ApiResult<Json<StreamStatus>> {
    if request.hold_secs == Some(0) {
        return Err(ApiError::bad_request("hold_secs must be positive"));
    }
    let hold = request.hold_secs.map(Duration::from_secs);
    Ok(Json(
        state
            .coordinator
            .force_tier(&StreamId::from(stream_id), request.tier, hold)
            .await?,
    ))
}

/// Drop a forced tier.
pub async fn clear_tier(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    Ok(Json(state.coordinator.clear_tier(&StreamId::from(stream_id)).await?))
}

/// Accepted frame.
#[derive(Debug, Serialize)]
pub struct FrameAccepted {
    pub stream_id: StreamId,
    pub sequence: u64,
}

/// Publish a captured frame. The body is the encoded image.
pub async fn push_frame(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<FrameAccepted>)> {
    if body.is_empty() {
        return Err(ApiError::bad_request("empty frame body"));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/jpeg");

    let stream_id = StreamId::from(stream_id);
    let sequence = state
        .coordinator
        .push_frame(&stream_id, FrameData::new(content_type, body.to_vec()))
        .await?;

    Ok((StatusCode::ACCEPTED, Json(FrameAccepted { stream_id, sequence })))
}
