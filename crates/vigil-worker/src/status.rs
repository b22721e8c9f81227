//! Stream status board read by the admin surface.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use vigil_models::{RiskTier, RuleId, StreamId};

use crate::error::ErrorClass;

/// Lifecycle state of a stream worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Running,
    Paused,
    /// Stopped by an internal error; the worker has exited.
    Failed,
    Stopped,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Running => "running",
            StreamState::Paused => "paused",
            StreamState::Failed => "failed",
            StreamState::Stopped => "stopped",
        }
    }
}

/// Most recent error of a stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastError {
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of one stream, published by its worker after every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub stream_id: StreamId,
    pub state: StreamState,
    pub tier: RiskTier,
    pub default_tier: RiskTier,
    pub forced: bool,
    pub interval_ms: u64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub missed_slots: u64,
    pub events_emitted: u64,
    pub suspended_rules: Vec<RuleId>,
    pub degraded_ticks: u64,
    pub last_error: Option<LastError>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub rules_generation: u64,
    pub profile: String,
}

impl StreamStatus {
    pub fn new(stream_id: StreamId, tier: RiskTier, profile: impl Into<String>) -> Self {
        Self {
            stream_id,
            state: StreamState::Running,
            tier,
            default_tier: tier,
            forced: false,
            interval_ms: 0,
            frames_processed: 0,
            frames_skipped: 0,
            missed_slots: 0,
            events_emitted: 0,
            suspended_rules: Vec::new(),
            degraded_ticks: 0,
            last_error: None,
            last_tick_at: None,
            rules_generation: 0,
            profile: profile.into(),
        }
    }
}

/// Shared map of stream statuses.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<HashMap<StreamId, StreamStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, status: StreamStatus) {
        self.inner.write().await.insert(status.stream_id.clone(), status);
    }

    pub async fn get(&self, stream_id: &StreamId) -> Option<StreamStatus> {
        self.inner.read().await.get(stream_id).cloned()
    }

    /// All statuses ordered by stream id.
    pub async fn list(&self) -> Vec<StreamStatus> {
        let mut statuses: Vec<_> = self.inner.read().await.values().cloned().collect();
        statuses.sort_by(|a, b| a.stream_id.as_str().cmp(b.stream_id.as_str()));
        statuses
    }

    pub async fn remove(&self, stream_id: &StreamId) -> Option<StreamStatus> {
        self.inner.write().await.remove(stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_board_publish_and_list() {
        let board = StatusBoard::new();
        board
            .publish(StreamStatus::new(StreamId::from("b"), RiskTier::Low, "default"))
            .await;
        board
            .publish(StreamStatus::new(StreamId::from("a"), RiskTier::High, "default"))
            .await;

        let ids: Vec<_> = board.list().await.into_iter().map(|s| s.stream_id).collect();
        assert_eq!(ids, vec![StreamId::from("a"), StreamId::from("b")]);

        assert!(board.remove(&StreamId::from("a")).await.is_some());
        assert!(board.get(&StreamId::from("a")).await.is_none());
    }

    #[test]
    fn test_status_serializes_state_snake_case() {
        let status = StreamStatus::new(StreamId::from("cam"), RiskTier::Medium, "night");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["tier"], "medium");
        assert!(json["last_error"].is_null());
    }
}
