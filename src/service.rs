//! Record service: reacts to configuration and publish events
//!
//! ```text
//!   RecordEvent ──► handle_event ─┬─ ConfigReload ─► swap policy snapshot
//!                                 ├─ Publish ──────► spawn start_recording per format
//!                                 └─ Unpublish ────► spawn stop per active recorder
//! ```
//!
//! The policy snapshot is swapped atomically; a running recorder keeps the
//! snapshot it was started with.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;

use crate::config::{RecordConfig, RecordPolicies};
use crate::error::{ConfigError, RecordError, Result};
use crate::event::RecordEvent;
use crate::format::RecordFormat;
use crate::hub::StreamSource;
use crate::recorder::{self, session, SessionParams, RECORDERS};
use crate::registry::{RecorderKey, RecorderRegistry};

/// Front door of the recorder engine
pub struct RecordService {
    policies: ArcSwap<RecordPolicies>,
    registry: Arc<RecorderRegistry>,
    source: Arc<dyn StreamSource>,
}

impl RecordService {
    /// Service with every format disabled until a reload
    pub fn new(source: Arc<dyn StreamSource>) -> Arc<Self> {
        Arc::new(Self {
            policies: ArcSwap::from_pointee(RecordPolicies::default()),
            registry: Arc::new(RecorderRegistry::new()),
            source,
        })
    }

    pub fn with_config(source: Arc<dyn StreamSource>, config: &RecordConfig) -> std::result::Result<Arc<Self>, ConfigError> {
        let policies = RecordPolicies::compile(config)?;
        Ok(Arc::new(Self {
            policies: ArcSwap::from_pointee(policies),
            registry: Arc::new(RecorderRegistry::new()),
            source,
        }))
    }

    /// Current policy snapshot
    pub fn policies(&self) -> Arc<RecordPolicies> {
        self.policies.load_full()
    }

    pub fn registry(&self) -> &Arc<RecorderRegistry> {
        &self.registry
    }

    /// Compile `config` and swap it in; the old snapshot stays on error
    pub fn reload(&self, config: &RecordConfig) -> std::result::Result<(), ConfigError> {
        let policies = RecordPolicies::compile(config)?;
        let enabled: Vec<&'static str> = policies.enabled_formats().map(|f| f.as_str()).collect();
        self.policies.store(Arc::new(policies));
        tracing::info!(enabled = ?enabled, "Record policies reloaded");
        Ok(())
    }

    pub fn need_record(&self, format: RecordFormat, stream: &str) -> bool {
        self.policies.load().need_record(format, stream)
    }

    /// Start recording `stream` as `format` and wait until the output is
    /// open.
    ///
    /// Fails with `AlreadyRecording` if a recorder for the pair is active.
    pub async fn start_recording(&self, format: RecordFormat, stream: &str) -> Result<()> {
        let key = RecorderKey::new(stream, format);
        let policies = self.policies.load_full();
        if !policies.need_record(format, stream) {
            return Err(RecordError::NotRecordable(key));
        }
        let constructor = recorder::constructor(format).ok_or_else(|| RecordError::NotRecordable(key.clone()))?;

        let (opened_tx, opened_rx) = oneshot::channel();
        let params = SessionParams {
            key: key.clone(),
            policies,
            source: Arc::clone(&self.source),
            recorder: constructor(),
        };
        let ticket = self
            .registry
            .try_start(key, move |stop| async move {
                session::run(params, stop, opened_tx).await;
            })
            .await?;

        let error = match opened_rx.await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => RecordError::Aborted,
        };
        // a failed open leaves no registry entry behind
        self.registry.wait_finished(&ticket.key, ticket.id).await;
        Err(error)
    }

    /// Stop the recorder for the pair; `false` if none was active
    pub async fn stop_recording(&self, format: RecordFormat, stream: &str) -> bool {
        self.registry.stop(&RecorderKey::new(stream, format)).await
    }

    pub async fn is_recording(&self, format: RecordFormat, stream: &str) -> bool {
        self.registry.is_active(&RecorderKey::new(stream, format)).await
    }

    /// Every active (stream, format) pair, sorted
    pub async fn active_recordings(&self) -> Vec<RecorderKey> {
        self.registry.active_keys().await
    }

    /// Stop every recorder and wait for them to close
    pub async fn shutdown(&self) -> usize {
        let stopped = self.registry.stop_all().await;
        tracing::info!(stopped = stopped, "Record service shut down");
        stopped
    }

    /// Dispatch one event without waiting for recorders to start or stop
    pub async fn handle_event(self: &Arc<Self>, event: RecordEvent) {
        match event {
            RecordEvent::ConfigReload(config) => {
                if let Err(e) = self.reload(&config) {
                    tracing::error!(error = %e, "Rejected record configuration, keeping previous");
                }
            }
            RecordEvent::Publish { stream } => {
                let policies = self.policies.load();
                for (format, _) in RECORDERS {
                    if !policies.need_record(format, &stream) {
                        continue;
                    }
                    let service = Arc::clone(self);
                    let stream = stream.clone();
                    tokio::spawn(async move {
                        match service.start_recording(format, &stream).await {
                            Ok(()) => {}
                            Err(e) if e.is_already_recording() => {
                                tracing::debug!(stream = %stream, format = %format, "Already recording");
                            }
                            Err(e) => {
                                tracing::warn!(stream = %stream, format = %format, error = %e, "Recording not started");
                            }
                        }
                    });
                }
            }
            RecordEvent::Unpublish { stream } => {
                for key in self.registry.active_keys().await {
                    if key.stream != stream {
                        continue;
                    }
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        registry.stop(&key).await;
                    });
                }
            }
        }
    }

    /// Handle events until the channel closes
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<RecordEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "Record service lagging behind events");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Record event channel closed");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::config::{FilterRule, FormatPolicy};
    use crate::hub::StreamHub;
    use crate::recorder::test_support::*;

    fn flv_config(dir: &Path) -> RecordConfig {
        let mut config = RecordConfig::default().with_format(
            RecordFormat::Flv,
            FormatPolicy::enabled().path(dir.to_string_lossy()),
        );
        config.subscribe.wait_timeout_ms = 500;
        config
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_stop_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(StreamHub::new());
        hub.publish("live/cam1").await.unwrap();
        let service = RecordService::with_config(hub.clone(), &flv_config(dir.path())).unwrap();

        assert_ok!(service.start_recording(RecordFormat::Flv, "live/cam1").await);
        assert!(service.is_recording(RecordFormat::Flv, "live/cam1").await);

        let duplicate = service.start_recording(RecordFormat::Flv, "live/cam1").await;
        assert!(assert_err!(duplicate).is_already_recording());

        for frame in stream(1) {
            hub.broadcast("live/cam1", frame).await;
        }
        assert!(service.stop_recording(RecordFormat::Flv, "live/cam1").await);
        assert!(!service.is_recording(RecordFormat::Flv, "live/cam1").await);
        assert!(!service.stop_recording(RecordFormat::Flv, "live/cam1").await);
        assert!(dir.path().join("live/cam1.flv").exists());
    }

    #[tokio::test]
    async fn test_not_recordable() {
        let hub = Arc::new(StreamHub::new());
        let service = RecordService::new(hub);
        let result = service.start_recording(RecordFormat::Hls, "live/cam1").await;
        assert!(matches!(result, Err(RecordError::NotRecordable(_))));
    }

    #[tokio::test]
    async fn test_missing_stream_reports_and_frees_key() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(StreamHub::new());
        let mut config = flv_config(dir.path());
        config.subscribe.wait_timeout_ms = 30;
        let service = RecordService::with_config(hub, &config).unwrap();

        let result = service.start_recording(RecordFormat::Flv, "live/ghost").await;
        assert!(matches!(result, Err(RecordError::Source(_))));
        assert!(!service.is_recording(RecordFormat::Flv, "live/ghost").await);
        assert!(service.active_recordings().await.is_empty());
        assert!(!dir.path().join("live/ghost.flv").exists());
    }

    #[tokio::test]
    async fn test_reload_swaps_policies() {
        let hub = Arc::new(StreamHub::new());
        let service = RecordService::new(hub);
        assert!(!service.need_record(RecordFormat::Flv, "live/cam1"));

        let before = service.policies();
        let config = RecordConfig::default().with_format(
            RecordFormat::Flv,
            FormatPolicy::enabled().filter(FilterRule::Prefix {
                patterns: vec!["live/".into()],
            }),
        );
        service.handle_event(RecordEvent::ConfigReload(config)).await;
        assert!(service.need_record(RecordFormat::Flv, "live/cam1"));
        assert!(!service.need_record(RecordFormat::Flv, "vod/cam1"));
        // earlier snapshots are untouched
        assert!(!before.need_record(RecordFormat::Flv, "live/cam1"));

        let bad = RecordConfig::default().with_format(
            RecordFormat::Flv,
            FormatPolicy::enabled().filter(FilterRule::Regex {
                pattern: "live/(".into(),
            }),
        );
        service.handle_event(RecordEvent::ConfigReload(bad)).await;
        assert!(service.need_record(RecordFormat::Flv, "live/cam1"));
    }

    #[tokio::test]
    async fn test_publish_events_start_one_recorder_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(StreamHub::new());
        let service = RecordService::with_config(hub.clone(), &flv_config(dir.path())).unwrap();
        let runner = tokio::spawn(Arc::clone(&service).run(hub.events()));

        for i in 0..100 {
            hub.publish(&format!("live/s{}", i)).await.unwrap();
        }
        // a duplicate publish event must not create a second recorder
        service.handle_event(RecordEvent::publish("live/s0")).await;

        let svc = Arc::clone(&service);
        wait_until(move || {
            let svc = Arc::clone(&svc);
            async move { svc.active_recordings().await.len() == 100 }
        })
        .await;

        for i in 0..100 {
            hub.unpublish(&format!("live/s{}", i)).await;
        }
        let svc = Arc::clone(&service);
        wait_until(move || {
            let svc = Arc::clone(&svc);
            async move { svc.active_recordings().await.is_empty() }
        })
        .await;

        drop(hub);
        runner.abort();
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(StreamHub::new());
        let config = flv_config(dir.path()).with_format(
            RecordFormat::Hls,
            FormatPolicy::enabled().path(dir.path().join("hls").to_string_lossy()),
        );
        let service = RecordService::with_config(hub.clone(), &config).unwrap();

        hub.publish("live/a").await.unwrap();
        hub.publish("live/b").await.unwrap();
        for stream in ["live/a", "live/b"] {
            assert_ok!(service.start_recording(RecordFormat::Flv, stream).await);
            assert_ok!(service.start_recording(RecordFormat::Hls, stream).await);
        }
        assert_eq!(service.active_recordings().await.len(), 4);

        assert_eq!(service.shutdown().await, 4);
        assert!(service.active_recordings().await.is_empty());
        assert!(dir.path().join("hls/live/a.m3u8").exists());
    }
}
