//! Event sinks.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use vigil_models::Event;

use crate::error::{WorkerError, WorkerResult};
use crate::metrics::record_event_dropped;

/// Destination of emitted events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event) -> WorkerResult<()>;
}

/// Writes one structured log line per event.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: Event) -> WorkerResult<()> {
        let payload = serde_json::Value::Object(event.payload.clone());
        info!(
            target: "vigil::events",
            event_id = %event.id,
            stream_id = %event.stream_id,
            rule_id = %event.rule_id,
            category = %event.category,
            severity = event.severity.as_str(),
            risk_tier = event.risk_tier.as_str(),
            confidence = event.confidence,
            payload = %payload,
            "{}", event.rule_name
        );
        Ok(())
    }
}

/// Forwards events into a bounded channel. A full channel drops the
/// event with a warning instead of stalling the stream.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: Event) -> WorkerResult<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    stream_id = %event.stream_id,
                    rule_id = %event.rule_id,
                    "Event channel full, dropping event"
                );
                record_event_dropped();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkerError::sink("event channel closed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_models::{RiskTier, RuleId, Severity, StreamId};

    fn event(rule: &str) -> Event {
        Event {
            id: Default::default(),
            rule_id: RuleId::from(rule),
            rule_name: rule.to_string(),
            category: "test".to_string(),
            stream_id: StreamId::from("cam-1"),
            severity: Severity::Warning,
            risk_tier: RiskTier::Medium,
            timestamp: Utc::now(),
            confidence: 1.0,
            payload: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        tokio_test::assert_ok!(sink.emit(event("a")).await);
        tokio_test::assert_ok!(sink.emit(event("b")).await);

        assert_eq!(rx.recv().await.unwrap().rule_id, RuleId::from("a"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_sink_errors_when_closed() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);
        let err = sink.emit(event("a")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Sink(_)));
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_events() {
        tokio_test::assert_ok!(TracingSink.emit(event("a")).await);
    }
}
