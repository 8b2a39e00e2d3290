//! Frame source seen by recorders

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::error::SourceError;
use super::frame::MediaFrame;

const SUBSCRIBE_RETRY: Duration = Duration::from_millis(50);

/// Anything that can hand out frame subscriptions for a stream
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Subscribe to a stream that is currently published
    async fn subscribe(&self, stream: &str) -> Result<Subscription, SourceError>;

    /// Subscribe, waiting up to `timeout` for the stream to be published
    async fn subscribe_within(&self, stream: &str, timeout: Duration) -> Result<Subscription, SourceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.subscribe(stream).await {
                Err(SourceError::StreamNotFound(_)) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(SUBSCRIBE_RETRY).await;
                }
                result => return result,
            }
        }
    }
}

/// Ordered frame feed for one subscriber
///
/// Catch-up frames (metadata and sequence headers) come first, then live
/// frames. Dropping the subscription unsubscribes.
pub struct Subscription {
    stream: String,
    catchup: VecDeque<MediaFrame>,
    rx: broadcast::Receiver<MediaFrame>,
    subscribers: Arc<AtomicU32>,
    lag_limit: u64,
    lagged: u64,
}

impl Subscription {
    pub fn new(
        stream: impl Into<String>,
        catchup: Vec<MediaFrame>,
        rx: broadcast::Receiver<MediaFrame>,
        subscribers: Arc<AtomicU32>,
    ) -> Self {
        subscribers.fetch_add(1, Ordering::Relaxed);
        Self {
            stream: stream.into(),
            catchup: catchup.into(),
            rx,
            subscribers,
            lag_limit: 0,
            lagged: 0,
        }
    }

    /// End the feed once a single lag skips more than `limit` frames
    /// (0 = never)
    pub fn with_lag_limit(mut self, limit: u64) -> Self {
        self.lag_limit = limit;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Next frame, or `None` once the stream has ended
    pub async fn next_frame(&mut self) -> Option<MediaFrame> {
        if let Some(frame) = self.catchup.pop_front() {
            return Some(frame);
        }

        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(skipped)) => {
                    self.lagged += skipped;
                    tracing::warn!(stream = %self.stream, skipped = skipped, "Subscriber lagging");
                    if self.lag_limit > 0 && skipped > self.lag_limit {
                        tracing::warn!(
                            stream = %self.stream,
                            limit = self.lag_limit,
                            "Lag limit exceeded, ending subscription"
                        );
                        return None;
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Frames skipped since the last call
    pub fn take_lagged(&mut self) -> u64 {
        std::mem::take(&mut self.lagged)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let prev = self.subscribers.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(stream = %self.stream, subscribers = prev.saturating_sub(1), "Subscriber removed");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn frame(ts: u32) -> MediaFrame {
        MediaFrame::audio(ts, Bytes::from_static(&[0xAF, 0x01, 0x00]), false)
    }

    #[tokio::test]
    async fn test_catchup_then_live_then_end() {
        let (tx, rx) = broadcast::channel(8);
        let count = Arc::new(AtomicU32::new(0));
        let mut sub = Subscription::new("live/a", vec![frame(0)], rx, Arc::clone(&count));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        tx.send(frame(20)).unwrap();
        drop(tx);

        assert_eq!(sub.next_frame().await.unwrap().timestamp, 0);
        assert_eq!(sub.next_frame().await.unwrap().timestamp, 20);
        assert!(sub.next_frame().await.is_none());

        drop(sub);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_lag_is_reported_and_survived() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new("live/a", vec![], rx, Arc::new(AtomicU32::new(0)));
        for ts in 0..5 {
            tx.send(frame(ts)).unwrap();
        }

        let next = sub.next_frame().await.unwrap();
        assert_eq!(next.timestamp, 3);
        assert_eq!(sub.take_lagged(), 3);
        assert_eq!(sub.take_lagged(), 0);
    }

    #[tokio::test]
    async fn test_lag_limit_ends_feed() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub =
            Subscription::new("live/a", vec![], rx, Arc::new(AtomicU32::new(0))).with_lag_limit(2);
        for ts in 0..5 {
            tx.send(frame(ts)).unwrap();
        }
        assert!(sub.next_frame().await.is_none());
    }
}
