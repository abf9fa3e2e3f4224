//! Message store: per-topic in-memory windows in front of an optional
//! persistence backend.
//!
//! Each topic gets a bounded window of recent messages. Replay queries are
//! answered from the window when it covers the cursor and from a merge of
//! persistence and window otherwise.
//!
//! ## Durability
//!
//! - [`Durability::Strict`]: the write is awaited before the message is
//!   cached; a failed write fails the append.
//! - [`Durability::BestEffort`]: the message is cached immediately and handed
//!   to a background writer over a bounded channel. Write failures are logged
//!   and counted, never surfaced.

use crate::clock::{duration_ms, SharedClock};
use crate::error::BrokerError;
use crate::message::{Cursor, Message};
use crate::persistence::Persistence;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

/// How persistence failures affect publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Durability {
    Strict,
    #[default]
    BestEffort,
}

/// Message store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long messages stay replayable.
    pub retention: Duration,
    /// Cached messages per topic, oldest evicted first.
    pub max_cached: usize,
    pub durability: Durability,
    /// Best-effort writer queue capacity.
    pub writer_queue: usize,
    /// Messages per persistence batch.
    pub batch_size: usize,
    /// Longest a partial batch waits before being written.
    pub batch_timeout: Duration,
    /// Extra attempts for a failed best-effort batch.
    pub write_retries: u32,
    /// Delay before the first retry; grows linearly.
    pub retry_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(12 * 3600),
            max_cached: 1_000,
            durability: Durability::BestEffort,
            writer_queue: 10_000,
            batch_size: 100,
            batch_timeout: Duration::from_millis(100),
            write_retries: 2,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// One topic's cached messages, ordered by id.
#[derive(Debug, Default)]
pub struct TopicWindow {
    messages: RwLock<VecDeque<Arc<Message>>>,
}

impl TopicWindow {
    fn push(&self, message: Arc<Message>, max: usize, cutoff: u64) -> usize {
        let mut messages = self.messages.write();
        messages.push_back(message);
        evict(&mut messages, max, cutoff)
    }

    fn sweep(&self, max: usize, cutoff: u64) -> usize {
        evict(&mut self.messages.write(), max, cutoff)
    }

    fn snapshot(&self) -> Vec<Arc<Message>> {
        self.messages.read().iter().cloned().collect()
    }

    /// Whether the window holds every message matching `cursor`.
    fn covers(&self, cursor: Cursor) -> bool {
        let messages = self.messages.read();
        let Some(front) = messages.front() else {
            return false;
        };
        match cursor {
            Cursor::After(id) => front.id <= id,
            Cursor::Since(time) => front.time < time,
            Cursor::None | Cursor::Latest => true,
            Cursor::All => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

fn evict(messages: &mut VecDeque<Arc<Message>>, max: usize, cutoff: u64) -> usize {
    let mut evicted = 0;
    while messages.len() > max || messages.front().is_some_and(|m| m.time < cutoff) {
        messages.pop_front();
        evicted += 1;
    }
    evicted
}

/// Store counters.
#[derive(Debug, Default)]
struct Counters {
    appended: AtomicU64,
    evicted: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
}

/// Store statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub topics: usize,
    pub cached: usize,
    pub appended: u64,
    pub evicted: u64,
    pub persisted: u64,
    pub persist_failures: u64,
}

/// The message store.
pub struct MessageStore {
    windows: DashMap<String, Arc<TopicWindow>>,
    persistence: Option<Arc<dyn Persistence>>,
    config: StoreConfig,
    clock: SharedClock,
    writer_tx: Option<mpsc::Sender<Arc<Message>>>,
    writer_rx: Mutex<Option<mpsc::Receiver<Arc<Message>>>>,
    counters: Arc<Counters>,
}

impl MessageStore {
    /// Create a store. Without a persistence backend only the windows are
    /// used and durability has no effect.
    #[must_use]
    pub fn new(
        config: StoreConfig,
        persistence: Option<Arc<dyn Persistence>>,
        clock: SharedClock,
    ) -> Self {
        let (writer_tx, writer_rx) =
            if persistence.is_some() && config.durability == Durability::BestEffort {
                let (tx, rx) = mpsc::channel(config.writer_queue.max(1));
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
        Self {
            windows: DashMap::new(),
            persistence,
            config,
            clock,
            writer_tx,
            writer_rx: Mutex::new(writer_rx),
            counters: Arc::new(Counters::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn persistence(&self) -> Option<&Arc<dyn Persistence>> {
        self.persistence.as_ref()
    }

    fn cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(duration_ms(self.config.retention))
    }

    /// Persist (per durability mode) and cache a message.
    ///
    /// Callers must serialize appends per topic so the window stays ordered.
    ///
    /// # Errors
    ///
    /// In strict mode, returns [`BrokerError::Persistence`] when the write
    /// fails; the message is then not cached.
    pub async fn append(&self, message: Arc<Message>) -> Result<(), BrokerError> {
        if let Some(persistence) = &self.persistence {
            match self.config.durability {
                Durability::Strict => {
                    if let Err(e) = persistence.append(&message).await {
                        self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                        error!(topic = %message.topic, id = message.id, error = %e, "Persistence write failed");
                        return Err(e.into());
                    }
                    self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                }
                Durability::BestEffort => self.enqueue_write(&message),
            }
        }

        self.admit(message);
        Ok(())
    }

    fn enqueue_write(&self, message: &Arc<Message>) {
        let Some(tx) = &self.writer_tx else {
            return;
        };
        if let Err(e) = tx.try_send(Arc::clone(message)) {
            self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "writer queue full",
                mpsc::error::TrySendError::Closed(_) => "writer stopped",
            };
            warn!(topic = %message.topic, id = message.id, reason, "Message not persisted");
        }
    }

    fn admit(&self, message: Arc<Message>) {
        let cutoff = self.cutoff(self.clock.now_ms());
        let window = self
            .windows
            .entry(message.topic.clone())
            .or_default()
            .clone();
        let id = message.id;
        let evicted = window.push(message, self.config.max_cached, cutoff);
        self.counters.appended.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.counters.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        trace!(id, evicted, "Message cached");
    }

    /// Retained, unexpired messages of a topic matching `cursor`, ordered by
    /// id without duplicates.
    ///
    /// # Errors
    ///
    /// In strict mode a failed persistence query is returned; in best-effort
    /// mode it is logged and the window alone answers.
    pub async fn since(&self, topic: &str, cursor: Cursor) -> Result<Vec<Arc<Message>>, BrokerError> {
        if cursor == Cursor::None {
            return Ok(Vec::new());
        }

        let now = self.clock.now_ms();
        let cutoff = self.cutoff(now);
        let live = |m: &Message| m.time >= cutoff && !m.is_expired(now) && cursor.admits(m);

        let window = self.windows.get(topic).map(|w| Arc::clone(w.value()));
        let cached: Vec<Arc<Message>> = window
            .as_ref()
            .map(|w| w.snapshot().into_iter().filter(|m| live(&**m)).collect())
            .unwrap_or_default();

        let covered = window.as_ref().is_some_and(|w| w.covers(cursor))
            && !(cursor == Cursor::Latest && cached.is_empty());
        let from_disk = match (&self.persistence, covered) {
            (Some(persistence), false) => match persistence.query_since(topic, cursor).await {
                Ok(found) => found,
                Err(e) if self.config.durability == Durability::Strict => {
                    error!(topic, error = %e, "Replay query failed");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(topic, error = %e, "Replay query failed, serving cache only");
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };

        let mut merged: BTreeMap<u64, Arc<Message>> = from_disk
            .into_iter()
            .filter(|m| live(m))
            .map(|m| (m.id, Arc::new(m)))
            .collect();
        for m in cached {
            merged.insert(m.id, m);
        }

        let mut result: Vec<Arc<Message>> = merged.into_values().collect();
        if cursor == Cursor::Latest && result.len() > 1 {
            result.drain(..result.len() - 1);
        }
        trace!(topic, ?cursor, count = result.len(), covered, "Replay query");
        Ok(result)
    }

    /// Number of cached messages for a topic.
    #[must_use]
    pub fn cached_len(&self, topic: &str) -> usize {
        self.windows.get(topic).map_or(0, |w| w.len())
    }

    /// Whether a topic has no cached messages.
    #[must_use]
    pub fn is_window_empty(&self, topic: &str) -> bool {
        self.windows.get(topic).map_or(true, |w| w.is_empty())
    }

    /// Drop an empty window nobody else holds. Returns whether it is gone.
    pub fn release_window(&self, topic: &str) -> bool {
        self.windows
            .remove_if(topic, |_, w| Arc::strong_count(w) == 1 && w.is_empty());
        !self.windows.contains_key(topic)
    }

    /// Apply retention and size limits to every window.
    pub fn sweep(&self) -> usize {
        let cutoff = self.cutoff(self.clock.now_ms());
        let evicted: usize = self
            .windows
            .iter()
            .map(|w| w.sweep(self.config.max_cached, cutoff))
            .sum();
        if evicted > 0 {
            self.counters.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "Swept message windows");
        }
        evicted
    }

    /// Remove expired messages from the persistence backend.
    pub async fn prune_persistence(&self) -> usize {
        let Some(persistence) = &self.persistence else {
            return 0;
        };
        let cutoff = self.cutoff(self.clock.now_ms());
        let topics = match persistence.topics().await {
            Ok(topics) => topics,
            Err(e) => {
                warn!(error = %e, "Could not list persisted topics");
                return 0;
            }
        };
        let mut pruned = 0;
        for topic in topics {
            match persistence.prune(&topic, cutoff).await {
                Ok(n) => pruned += n,
                Err(e) => warn!(topic = %topic, error = %e, "Prune failed"),
            }
        }
        if pruned > 0 {
            debug!(pruned, "Pruned persisted messages");
        }
        pruned
    }

    /// Start the best-effort writer. Returns `None` if there is nothing to
    /// write to or the writer was already started.
    pub fn spawn_writer(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let persistence = self.persistence.clone()?;
        let rx = self.writer_rx.lock().take()?;
        let writer = Writer {
            persistence,
            rx,
            shutdown,
            batch_size: self.config.batch_size.max(1),
            batch_timeout: self.config.batch_timeout,
            retries: self.config.write_retries,
            backoff: self.config.retry_backoff,
            counters: Arc::clone(&self.counters),
        };
        info!(batch_size = writer.batch_size, "Starting persistence writer");
        Some(tokio::spawn(writer.run()))
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            topics: self.windows.len(),
            cached: self.windows.iter().map(|w| w.len()).sum(),
            appended: self.counters.appended.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
        }
    }
}

/// Background batch writer for best-effort durability.
struct Writer {
    persistence: Arc<dyn Persistence>,
    rx: mpsc::Receiver<Arc<Message>>,
    shutdown: watch::Receiver<bool>,
    batch_size: usize,
    batch_timeout: Duration,
    retries: u32,
    backoff: Duration,
    counters: Arc<Counters>,
}

impl Writer {
    async fn run(mut self) {
        let mut batch: Vec<Arc<Message>> = Vec::with_capacity(self.batch_size);
        let mut deadline = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    while let Ok(message) = self.rx.try_recv() {
                        batch.push(message);
                    }
                    self.flush(&mut batch).await;
                    break;
                }

                received = self.rx.recv() => match received {
                    Some(message) => {
                        if batch.is_empty() {
                            deadline = Instant::now() + self.batch_timeout;
                        }
                        batch.push(message);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => {
                        self.flush(&mut batch).await;
                        break;
                    }
                },

                () = sleep_until(deadline), if !batch.is_empty() => {
                    self.flush(&mut batch).await;
                }
            }
        }
        info!("Persistence writer stopped");
    }

    async fn flush(&self, batch: &mut Vec<Arc<Message>>) {
        if batch.is_empty() {
            return;
        }
        let mut attempt = 0;
        loop {
            match self.persistence.append_batch(&batch[..]).await {
                Ok(()) => {
                    self.counters.persisted.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    trace!(count = batch.len(), "Batch persisted");
                    break;
                }
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "Batch write failed, retrying");
                    sleep(self.backoff * attempt).await;
                }
                Err(e) => {
                    self.counters
                        .persist_failures
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    error!(count = batch.len(), error = %e, "Batch write failed, messages not persisted");
                    break;
                }
            }
        }
        batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::MemoryPersistence;

    const START: u64 = 1_700_000_000_000;

    fn msg(id: u64, time: u64) -> Arc<Message> {
        Arc::new(Message::new(id, "t", time, format!("m{id}")))
    }

    fn ids(v: &[Arc<Message>]) -> Vec<u64> {
        v.iter().map(|m| m.id).collect()
    }

    fn store(
        config: StoreConfig,
        persistence: Option<Arc<MemoryPersistence>>,
    ) -> (MessageStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let persistence = persistence.map(|p| p as Arc<dyn Persistence>);
        (MessageStore::new(config, persistence, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_cache_eviction_by_count() {
        let config = StoreConfig {
            max_cached: 3,
            ..StoreConfig::default()
        };
        let (store, _) = store(config, None);
        for id in 1..=5 {
            store.append(msg(id, START)).await.unwrap();
        }
        assert_eq!(store.cached_len("t"), 3);
        let all = store.since("t", Cursor::All).await.unwrap();
        assert_eq!(ids(&all), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_retention_and_expiry_hidden() {
        let config = StoreConfig {
            retention: Duration::from_secs(60),
            ..StoreConfig::default()
        };
        let (store, clock) = store(config, None);
        store.append(msg(1, START)).await.unwrap();
        let mut short = Message::new(2, "t", START + 1_000, "short");
        short.expires = Some(START + 5_000);
        store.append(Arc::new(short)).await.unwrap();
        store.append(msg(3, START + 30_000)).await.unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(ids(&store.since("t", Cursor::All).await.unwrap()), vec![1, 3]);

        clock.advance(Duration::from_secs(55));
        assert_eq!(ids(&store.since("t", Cursor::All).await.unwrap()), vec![3]);
        assert!(store.sweep() >= 1);
    }

    #[tokio::test]
    async fn test_cursor_kinds() {
        let (store, _) = store(StoreConfig::default(), None);
        for (id, time) in [(2, START), (5, START + 10), (9, START + 20)] {
            store.append(msg(id, time)).await.unwrap();
        }
        assert_eq!(ids(&store.since("t", Cursor::After(2)).await.unwrap()), vec![5, 9]);
        assert_eq!(ids(&store.since("t", Cursor::Since(START + 10)).await.unwrap()), vec![5, 9]);
        assert_eq!(ids(&store.since("t", Cursor::Latest).await.unwrap()), vec![9]);
        assert!(store.since("t", Cursor::None).await.unwrap().is_empty());
        assert!(store.since("missing", Cursor::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_with_persistence_dedups() {
        let persistence = Arc::new(MemoryPersistence::new());
        let config = StoreConfig {
            max_cached: 2,
            durability: Durability::Strict,
            ..StoreConfig::default()
        };
        let (store, _) = store(config, Some(persistence.clone()));
        for id in 1..=4 {
            store.append(msg(id, START + id)).await.unwrap();
        }
        assert_eq!(persistence.len(), 4);
        assert_eq!(store.cached_len("t"), 2);

        // Cursor reaches behind the window: served from both, no duplicates.
        let replay = store.since("t", Cursor::After(1)).await.unwrap();
        assert_eq!(ids(&replay), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_strict_failure_not_cached() {
        let persistence = Arc::new(MemoryPersistence::new());
        let config = StoreConfig {
            durability: Durability::Strict,
            ..StoreConfig::default()
        };
        let (store, _) = store(config, Some(persistence.clone()));
        persistence.set_failing(true);

        let err = store.append(msg(1, START)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Persistence(_)));
        assert_eq!(store.cached_len("t"), 0);
        assert_eq!(store.stats().persist_failures, 1);
    }

    #[tokio::test]
    async fn test_best_effort_writer_flushes_on_shutdown() {
        let persistence = Arc::new(MemoryPersistence::new());
        let config = StoreConfig {
            batch_size: 10,
            batch_timeout: Duration::from_secs(60),
            ..StoreConfig::default()
        };
        let (store, _) = store(config, Some(persistence.clone()));
        let (tx, rx) = watch::channel(false);
        let writer = store.spawn_writer(rx).unwrap();
        assert!(store.spawn_writer(watch::channel(false).1).is_none());

        for id in 1..=3 {
            store.append(msg(id, START)).await.unwrap();
        }
        tx.send(true).unwrap();
        writer.await.unwrap();

        assert_eq!(persistence.len(), 3);
        assert_eq!(store.stats().persisted, 3);
    }

    #[tokio::test]
    async fn test_best_effort_failure_is_counted() {
        let persistence = Arc::new(MemoryPersistence::new());
        let config = StoreConfig {
            batch_size: 1,
            write_retries: 1,
            retry_backoff: Duration::from_millis(1),
            ..StoreConfig::default()
        };
        let (store, _) = store(config, Some(persistence.clone()));
        persistence.set_failing(true);
        let (tx, rx) = watch::channel(false);
        let writer = store.spawn_writer(rx).unwrap();

        // Append still succeeds and the message is live in the cache.
        store.append(msg(1, START)).await.unwrap();
        assert_eq!(store.cached_len("t"), 1);

        tx.send(true).unwrap();
        writer.await.unwrap();
        assert_eq!(store.stats().persist_failures, 1);
    }

    #[tokio::test]
    async fn test_release_window() {
        let config = StoreConfig {
            retention: Duration::from_secs(1),
            ..StoreConfig::default()
        };
        let (store, clock) = store(config, None);
        store.append(msg(1, START)).await.unwrap();
        assert!(!store.release_window("t"));

        clock.advance(Duration::from_secs(2));
        store.sweep();
        assert!(store.release_window("t"));
        assert!(store.is_window_empty("t"));
    }
}
