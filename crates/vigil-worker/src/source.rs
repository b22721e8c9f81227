//! Frame sources.
//!
//! Capture pushes frames as fast as it likes; the worker only ever samples
//! the newest one when its slot is due, so a watch channel is all the
//! buffering needed.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use vigil_models::{Frame, FrameData, StreamId};

/// Supplies the most recent frame of one stream.
pub trait FrameSource: Send + Sync {
    fn latest(&self) -> Option<Frame>;
}

/// Latest-value frame source backed by `tokio::sync::watch`.
#[derive(Debug)]
pub struct LatestFrameSource {
    stream_id: StreamId,
    tx: watch::Sender<Option<Frame>>,
    sequence: AtomicU64,
}

impl LatestFrameSource {
    pub fn new(stream_id: StreamId) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            stream_id,
            tx,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Publish captured image bytes and return the assigned sequence number.
    pub fn publish(&self, image: FrameData) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx.send_replace(Some(Frame::new(self.stream_id.clone(), sequence, image)));
        sequence
    }

    /// Publish a frame whose sequence was assigned by the capture side.
    /// Sequence numbering continues from the larger of the two.
    pub fn publish_frame(&self, frame: Frame) {
        self.sequence.fetch_max(frame.sequence, Ordering::SeqCst);
        self.tx.send_replace(Some(frame));
    }

    /// Last assigned sequence number, 0 before the first frame.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        self.tx.subscribe()
    }
}

impl FrameSource for LatestFrameSource {
    fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_frame_wins() {
        let source = LatestFrameSource::new(StreamId::from("cam-1"));
        assert!(source.latest().is_none());

        assert_eq!(source.publish(FrameData::jpeg(vec![1])), 1);
        assert_eq!(source.publish(FrameData::jpeg(vec![2])), 2);

        let frame = source.latest().unwrap();
        assert_eq!(frame.sequence, 2);
        assert_eq!(frame.image.bytes.as_slice(), &[2]);
        assert_eq!(frame.stream_id.as_str(), "cam-1");
    }

    #[test]
    fn test_external_sequence_advances_counter() {
        let source = LatestFrameSource::new(StreamId::from("cam-1"));
        source.publish_frame(Frame::new(StreamId::from("cam-1"), 40, FrameData::jpeg(vec![0])));
        assert_eq!(source.last_sequence(), 40);
        assert_eq!(source.publish(FrameData::jpeg(vec![1])), 41);
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let source = LatestFrameSource::new(StreamId::from("cam-1"));
        let mut rx = source.subscribe();
        source.publish(FrameData::jpeg(vec![9]));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(|f| f.sequence), Some(1));
    }
}
