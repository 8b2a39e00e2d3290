//! In-process stream hub
//!
//! Publishers push frames; recorders subscribe. Sequence headers and the
//! latest metadata are cached so a late subscriber can still initialize
//! its decoders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use super::error::SourceError;
use super::frame::{FrameType, MediaFrame};
use super::source::{StreamSource, Subscription};
use crate::event::RecordEvent;

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames buffered per subscriber before it starts lagging
    pub broadcast_capacity: usize,
    /// Capacity of the publish/unpublish event channel
    pub event_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            event_capacity: 256,
        }
    }
}

impl HubConfig {
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

struct HubEntry {
    tx: broadcast::Sender<MediaFrame>,
    video_header: Option<MediaFrame>,
    audio_header: Option<MediaFrame>,
    metadata: Option<MediaFrame>,
    subscribers: Arc<AtomicU32>,
    published_at: Instant,
}

impl HubEntry {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            video_header: None,
            audio_header: None,
            metadata: None,
            subscribers: Arc::new(AtomicU32::new(0)),
            published_at: Instant::now(),
        }
    }

    fn catchup_frames(&self) -> Vec<MediaFrame> {
        [&self.metadata, &self.video_header, &self.audio_header]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn update_caches(&mut self, frame: &MediaFrame) {
        match frame.frame_type {
            FrameType::Video if frame.is_header => self.video_header = Some(frame.clone()),
            FrameType::Audio if frame.is_header => self.audio_header = Some(frame.clone()),
            FrameType::Metadata => self.metadata = Some(frame.clone()),
            _ => {}
        }
    }
}

/// Publish/subscribe fan-out keyed by stream identifier
pub struct StreamHub {
    streams: RwLock<HashMap<String, HubEntry>>,
    events: broadcast::Sender<RecordEvent>,
    config: HubConfig,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    pub fn with_config(config: HubConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            streams: RwLock::new(HashMap::new()),
            events,
            config,
        }
    }

    /// Publish and unpublish notifications
    pub fn events(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }

    /// Start publishing `stream`
    pub async fn publish(&self, stream: &str) -> Result<(), SourceError> {
        {
            let mut streams = self.streams.write().await;
            if streams.contains_key(stream) {
                return Err(SourceError::StreamAlreadyPublishing(stream.to_string()));
            }
            streams.insert(stream.to_string(), HubEntry::new(self.config.broadcast_capacity));
        }

        tracing::info!(stream = %stream, "Stream published");
        let _ = self.events.send(RecordEvent::Publish {
            stream: stream.to_string(),
        });
        Ok(())
    }

    /// Stop publishing `stream`; subscribers see the end of their feed
    pub async fn unpublish(&self, stream: &str) -> bool {
        let removed = self.streams.write().await.remove(stream);
        let Some(entry) = removed else {
            return false;
        };

        tracing::info!(
            stream = %stream,
            subscribers = entry.subscribers.load(Ordering::Relaxed),
            duration_ms = entry.published_at.elapsed().as_millis() as u64,
            "Stream unpublished"
        );
        drop(entry);
        let _ = self.events.send(RecordEvent::Unpublish {
            stream: stream.to_string(),
        });
        true
    }

    /// Send a frame to every subscriber of `stream`
    pub async fn broadcast(&self, stream: &str, frame: MediaFrame) -> usize {
        let mut streams = self.streams.write().await;
        match streams.get_mut(stream) {
            Some(entry) => {
                entry.update_caches(&frame);
                entry.tx.send(frame).unwrap_or(0)
            }
            None => 0,
        }
    }

    pub async fn stream_exists(&self, stream: &str) -> bool {
        self.streams.read().await.contains_key(stream)
    }

    pub async fn subscriber_count(&self, stream: &str) -> u32 {
        let streams = self.streams.read().await;
        streams
            .get(stream)
            .map(|entry| entry.subscribers.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamSource for StreamHub {
    async fn subscribe(&self, stream: &str) -> Result<Subscription, SourceError> {
        let streams = self.streams.read().await;
        let entry = streams
            .get(stream)
            .ok_or_else(|| SourceError::StreamNotFound(stream.to_string()))?;

        let catchup = entry.catchup_frames();
        let subscription = Subscription::new(
            stream,
            catchup,
            entry.tx.subscribe(),
            Arc::clone(&entry.subscribers),
        );

        tracing::info!(
            stream = %stream,
            subscribers = entry.subscribers.load(Ordering::Relaxed),
            "Subscriber added"
        );
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe_unpublish() {
        let hub = StreamHub::new();
        let mut events = hub.events();

        hub.publish("live/a").await.unwrap();
        assert!(matches!(
            hub.publish("live/a").await,
            Err(SourceError::StreamAlreadyPublishing(_))
        ));
        assert!(matches!(events.recv().await.unwrap(), RecordEvent::Publish { stream } if stream == "live/a"));

        let mut sub = hub.subscribe("live/a").await.unwrap();
        assert_eq!(hub.subscriber_count("live/a").await, 1);

        let sent = hub
            .broadcast("live/a", MediaFrame::video(0, Bytes::from_static(&[0x17, 0x01]), true, false))
            .await;
        assert_eq!(sent, 1);
        assert!(sub.next_frame().await.unwrap().is_keyframe);

        assert!(hub.unpublish("live/a").await);
        assert!(sub.next_frame().await.is_none());
        assert!(matches!(events.recv().await.unwrap(), RecordEvent::Unpublish { .. }));
        assert!(!hub.unpublish("live/a").await);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_headers() {
        let hub = StreamHub::new();
        hub.publish("live/a").await.unwrap();
        hub.broadcast("live/a", MediaFrame::metadata(Bytes::from_static(&[0x02, 0, 0])))
            .await;
        hub.broadcast("live/a", MediaFrame::video(0, Bytes::from_static(&[0x17, 0x00]), true, true))
            .await;
        hub.broadcast("live/a", MediaFrame::audio(0, Bytes::from_static(&[0xAF, 0x00]), true))
            .await;
        hub.broadcast("live/a", MediaFrame::video(40, Bytes::from_static(&[0x27, 0x01]), false, false))
            .await;

        let mut sub = hub.subscribe("live/a").await.unwrap();
        assert_eq!(sub.next_frame().await.unwrap().frame_type, FrameType::Metadata);
        assert!(sub.next_frame().await.unwrap().is_video());
        assert!(sub.next_frame().await.unwrap().is_audio());
    }

    #[tokio::test]
    async fn test_subscribe_within_waits_for_publish() {
        let hub = Arc::new(StreamHub::new());
        assert!(matches!(
            hub.subscribe("live/late").await,
            Err(SourceError::StreamNotFound(_))
        ));

        let publisher = Arc::clone(&hub);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            publisher.publish("live/late").await.unwrap();
        });

        let sub = hub
            .subscribe_within("live/late", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(sub.stream(), "live/late");

        let missing = hub.subscribe_within("live/none", Duration::from_millis(60)).await;
        assert!(matches!(missing, Err(SourceError::StreamNotFound(_))));
    }

    #[tokio::test]
    async fn test_dropped_subscription_decrements() {
        let hub = StreamHub::with_config(HubConfig::default().broadcast_capacity(4));
        hub.publish("live/a").await.unwrap();
        let sub = hub.subscribe("live/a").await.unwrap();
        assert_eq!(hub.subscriber_count("live/a").await, 1);
        drop(sub);
        assert_eq!(hub.subscriber_count("live/a").await, 0);
        assert_eq!(hub.stream_count().await, 1);
    }
}
