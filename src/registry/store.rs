//! Recorder registry implementation

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use super::key::RecorderKey;
use crate::error::{RecordError, Result};

/// Stop request delivered to a running recorder
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Detached signal and its trigger, for driving a recorder outside
    /// the registry
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Whether stop has been requested
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop is requested or the registry entry is gone
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Handle returned by a successful start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderTicket {
    pub id: u64,
    pub key: RecorderKey,
}

/// Snapshot of one active recorder
#[derive(Debug, Clone)]
pub struct RecorderInfo {
    pub id: u64,
    pub key: RecorderKey,
    pub uptime: Duration,
}

struct RecorderEntry {
    id: u64,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
    started_at: Instant,
}

impl RecorderEntry {
    /// Finished entries are stale and treated as absent
    fn is_active(&self) -> bool {
        !self.task.is_finished() && !*self.done_rx.borrow()
    }
}

/// Map of active recorders
///
/// Start and stop for the same key are linearized by the write lock; the
/// spawned task removes its own entry before reporting completion, so once
/// `stop` returns the key is free.
pub struct RecorderRegistry {
    entries: RwLock<HashMap<RecorderKey, RecorderEntry>>,
    next_id: AtomicU64,
}

impl RecorderRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a recorder under `key` unless one is already active.
    ///
    /// `factory` receives the stop signal and returns the recorder's future,
    /// which runs as its own task.
    pub async fn try_start<F, Fut>(self: &Arc<Self>, key: RecorderKey, factory: F) -> Result<RecorderTicket>
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(&key) {
            if existing.is_active() {
                tracing::debug!(recorder = %key, id = existing.id, "Recorder already active");
                return Err(RecordError::AlreadyRecording(key));
            }
            tracing::debug!(recorder = %key, id = existing.id, "Replacing finished recorder entry");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let recording = factory(StopSignal { rx: stop_rx });

        let registry = Arc::clone(self);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            recording.await;
            registry.remove_if(&task_key, id).await;
            let _ = done_tx.send(true);
        });

        entries.insert(
            key.clone(),
            RecorderEntry {
                id,
                stop_tx,
                done_rx,
                task,
                started_at: Instant::now(),
            },
        );

        tracing::info!(recorder = %key, id = id, active = entries.len(), "Recorder registered");

        Ok(RecorderTicket { id, key })
    }

    /// Signal the recorder under `key` to stop and wait for it to finish.
    ///
    /// Returns `false` if no recorder was active.
    pub async fn stop(&self, key: &RecorderKey) -> bool {
        let (id, done_rx) = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_active() => {
                    let _ = entry.stop_tx.send(true);
                    (entry.id, entry.done_rx.clone())
                }
                _ => return false,
            }
        };

        tracing::debug!(recorder = %key, id = id, "Stop requested");
        self.wait_done(key, id, done_rx).await;
        true
    }

    /// Stop every active recorder
    pub async fn stop_all(&self) -> usize {
        let pending: Vec<(RecorderKey, u64, watch::Receiver<bool>)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, entry)| entry.is_active())
                .map(|(key, entry)| {
                    let _ = entry.stop_tx.send(true);
                    (key.clone(), entry.id, entry.done_rx.clone())
                })
                .collect()
        };

        let count = pending.len();
        for (key, id, done_rx) in pending {
            self.wait_done(&key, id, done_rx).await;
        }
        if count > 0 {
            tracing::info!(stopped = count, "All recorders stopped");
        }
        count
    }

    /// Wait until recorder `id` under `key` has finished and left the map,
    /// without signalling it to stop
    pub async fn wait_finished(&self, key: &RecorderKey, id: u64) {
        let done_rx = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.id == id => entry.done_rx.clone(),
                _ => return,
            }
        };
        self.wait_done(key, id, done_rx).await;
    }

    async fn wait_done(&self, key: &RecorderKey, id: u64, mut done_rx: watch::Receiver<bool>) {
        // Err means the task died without reporting
        let _ = done_rx.wait_for(|done| *done).await;
        self.remove_if(key, id).await;
    }

    /// Remove `key` only if it still belongs to recorder `id`
    async fn remove_if(&self, key: &RecorderKey, id: u64) {
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            if let Some(entry) = entries.remove(key) {
                tracing::info!(
                    recorder = %key,
                    id = id,
                    uptime_ms = entry.started_at.elapsed().as_millis() as u64,
                    "Recorder deregistered"
                );
            }
        }
    }

    /// Whether a recorder is active under `key`
    pub async fn is_active(&self, key: &RecorderKey) -> bool {
        let entries = self.entries.read().await;
        entries.get(key).is_some_and(RecorderEntry::is_active)
    }

    /// Existence check for diagnostics; never a substitute for `try_start`
    pub async fn lookup(&self, key: &RecorderKey) -> Option<RecorderInfo> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.is_active())
            .map(|entry| RecorderInfo {
                id: entry.id,
                key: key.clone(),
                uptime: entry.started_at.elapsed(),
            })
    }

    /// Keys of every active recorder, sorted
    pub async fn active_keys(&self) -> Vec<RecorderKey> {
        let entries = self.entries.read().await;
        let mut keys: Vec<RecorderKey> = entries
            .iter()
            .filter(|(_, entry)| entry.is_active())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of active recorders
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|entry| entry.is_active()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for RecorderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::oneshot;

    use super::*;
    use crate::format::RecordFormat;

    fn key(stream: &str) -> RecorderKey {
        RecorderKey::new(stream, RecordFormat::Flv)
    }

    /// Recorder body that runs until stopped
    async fn until_stopped(mut stop: StopSignal) {
        stop.stopped().await;
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let registry = Arc::new(RecorderRegistry::new());
        let started = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&started);
        let ticket = registry
            .try_start(key("live/a"), move |stop| {
                counter.fetch_add(1, Ordering::SeqCst);
                until_stopped(stop)
            })
            .await
            .unwrap();
        assert_eq!(ticket.key, key("live/a"));

        let counter = Arc::clone(&started);
        let err = registry
            .try_start(key("live/a"), move |stop| {
                counter.fetch_add(1, Ordering::SeqCst);
                until_stopped(stop)
            })
            .await
            .unwrap_err();
        assert!(err.is_already_recording());
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len().await, 1);

        // another format of the same stream is independent
        let other = RecorderKey::new("live/a", RecordFormat::Hls);
        registry.try_start(other.clone(), until_stopped).await.unwrap();
        assert_eq!(registry.active_keys().await, vec![key("live/a"), other]);
    }

    #[tokio::test]
    async fn test_stop_removes_entry() {
        let registry = Arc::new(RecorderRegistry::new());
        let (closed_tx, closed_rx) = oneshot::channel();

        registry
            .try_start(key("live/a"), move |mut stop| async move {
                stop.stopped().await;
                let _ = closed_tx.send(());
            })
            .await
            .unwrap();
        assert!(registry.is_active(&key("live/a")).await);

        assert!(registry.stop(&key("live/a")).await);
        assert!(!registry.is_active(&key("live/a")).await);
        assert!(registry.lookup(&key("live/a")).await.is_none());
        closed_rx.await.unwrap();

        // stopping again is a no-op
        assert!(!registry.stop(&key("live/a")).await);
    }

    #[tokio::test]
    async fn test_finished_recorder_deregisters_itself() {
        let registry = Arc::new(RecorderRegistry::new());
        let (finish_tx, finish_rx) = oneshot::channel::<()>();

        let first = registry
            .try_start(key("live/a"), move |_stop| async move {
                let _ = finish_rx.await;
            })
            .await
            .unwrap();

        finish_tx.send(()).unwrap();
        for _ in 0..100 {
            if registry.is_empty().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.is_empty().await);

        let second = registry.try_start(key("live/a"), until_stopped).await.unwrap();
        assert!(second.id > first.id);
        assert!(registry.stop(&key("live/a")).await);
    }

    #[tokio::test]
    async fn test_concurrent_starts_one_wins() {
        let registry = Arc::new(RecorderRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.try_start(key("live/race"), until_stopped).await.is_ok()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_hundred_distinct_streams() {
        let registry = Arc::new(RecorderRegistry::new());
        let mut handles = Vec::new();
        for i in 0..100 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .try_start(key(&format!("live/{}", i)), until_stopped)
                    .await
                    .is_ok()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(registry.len().await, 100);
        assert_eq!(registry.active_keys().await.len(), 100);

        assert_eq!(registry.stop_all().await, 100);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_stops_all_wait() {
        let registry = Arc::new(RecorderRegistry::new());
        registry
            .try_start(key("live/a"), |mut stop| async move {
                stop.stopped().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
            .await
            .unwrap();

        let a = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.stop(&key("live/a")).await })
        };
        let b = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.stop(&key("live/a")).await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a || b);
        assert!(!registry.is_active(&key("live/a")).await);
    }

    #[tokio::test]
    async fn test_wait_finished_leaves_key_free() {
        let registry = Arc::new(RecorderRegistry::new());
        let ticket = registry
            .try_start(key("live/a"), |_stop| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
            .await
            .unwrap();

        registry.wait_finished(&ticket.key, ticket.id).await;
        assert!(registry.lookup(&key("live/a")).await.is_none());
        assert!(registry.entries.read().await.is_empty());

        // unknown ids return at once
        registry.wait_finished(&key("live/a"), ticket.id + 1).await;
    }

    #[tokio::test]
    async fn test_detached_signal() {
        let (tx, mut signal) = StopSignal::channel();
        assert!(!signal.is_stopped());
        tx.send(true).unwrap();
        signal.stopped().await;
        assert!(signal.is_stopped());
    }
}
