//! Topics and the topic registry.
//!
//! Topics are created lazily on first publish or subscribe and reclaimed once
//! they are idle: no subscribers, an empty cache window and no in-flight
//! operation holding a [`TopicHandle`].

use crate::clock::{duration_ms, SharedClock};
use crate::error::BrokerError;
use crate::store::MessageStore;
use crate::subscription::Slot;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 64;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("Topic name too long");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("Topic name may only contain letters, digits, '_' and '-'");
    }
    Ok(())
}

/// A named topic.
#[derive(Debug)]
pub struct Topic {
    name: String,
    created_at: u64,
    last_active: AtomicU64,
    last_message_time: AtomicU64,
    pins: AtomicUsize,
    subscribers: RwLock<Vec<Arc<Slot>>>,
    /// Serializes publishes so id, append and fan-out order agree.
    publish_lock: Mutex<()>,
}

impl Topic {
    fn new(name: impl Into<String>, now: u64) -> Self {
        Self {
            name: name.into(),
            created_at: now,
            last_active: AtomicU64::new(now),
            last_message_time: AtomicU64::new(0),
            pins: AtomicUsize::new(0),
            subscribers: RwLock::new(Vec::new()),
            publish_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    #[must_use]
    pub fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now: u64) {
        self.last_active.fetch_max(now, Ordering::Relaxed);
    }

    /// Publish time for the next message: never earlier than the previous
    /// one. Call with the publish lock held.
    pub(crate) fn stamp(&self, now: u64) -> u64 {
        let time = now.max(self.last_message_time.load(Ordering::Acquire));
        self.last_message_time.store(time, Ordering::Release);
        time
    }

    /// Take the per-topic publish lock.
    pub async fn lock_publish(&self) -> MutexGuard<'_, ()> {
        self.publish_lock.lock().await
    }

    pub(crate) fn add_subscriber(&self, slot: Arc<Slot>) {
        self.subscribers.write().push(slot);
    }

    pub(crate) fn remove_subscriber(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id() != id);
        subscribers.len() != before
    }

    /// Snapshot of the current subscriber set.
    #[must_use]
    pub(crate) fn subscribers(&self) -> Vec<Arc<Slot>> {
        self.subscribers.read().clone()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }
}

/// A topic reference that keeps the topic from being reclaimed.
#[derive(Debug)]
pub struct TopicHandle {
    topic: Arc<Topic>,
    clock: SharedClock,
}

impl TopicHandle {
    /// The underlying shared topic.
    #[must_use]
    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }
}

impl Deref for TopicHandle {
    type Target = Topic;

    fn deref(&self) -> &Topic {
        &self.topic
    }
}

impl Drop for TopicHandle {
    fn drop(&mut self) {
        self.topic.touch(self.clock.now_ms());
        self.topic.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Topic registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of topics.
    pub max_topics: usize,
    /// How long an idle topic lingers before the sweep reclaims it.
    pub idle_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_topics: 15_000,
            idle_grace: Duration::from_secs(60),
        }
    }
}

/// All live topics.
pub struct TopicRegistry {
    topics: DashMap<String, Arc<Topic>>,
    count: AtomicUsize,
    store: Arc<MessageStore>,
    config: RegistryConfig,
    clock: SharedClock,
}

impl TopicRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig, store: Arc<MessageStore>, clock: SharedClock) -> Self {
        Self {
            topics: DashMap::new(),
            count: AtomicUsize::new(0),
            store,
            config,
            clock,
        }
    }

    /// Get or create a topic, pinned for as long as the handle lives.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Validation`] for a bad name and
    /// [`BrokerError::TopicCapacityExceeded`] when the registry is full.
    pub fn create_or_get(&self, name: &str) -> Result<TopicHandle, BrokerError> {
        validate_topic_name(name).map_err(BrokerError::validation)?;

        let now = self.clock.now_ms();
        let topic = match self.topics.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let topic = entry.get().clone();
                topic.pins.fetch_add(1, Ordering::AcqRel);
                topic
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let max = self.config.max_topics;
                self.count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .map_err(|_| BrokerError::TopicCapacityExceeded(max))?;
                let topic = Arc::new(Topic::new(name, now));
                topic.pins.fetch_add(1, Ordering::AcqRel);
                entry.insert(topic.clone());
                debug!(topic = %name, "Creating new topic");
                topic
            }
        };
        topic.touch(now);

        Ok(TopicHandle {
            topic,
            clock: self.clock.clone(),
        })
    }

    /// Look up an existing topic without pinning it.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|t| t.clone())
    }

    /// Look up an existing topic, pinned.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::TopicNotFound`] if it does not exist.
    pub fn get(&self, name: &str) -> Result<TopicHandle, BrokerError> {
        let entry = self
            .topics
            .get(name)
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))?;
        let topic = entry.value().clone();
        topic.pins.fetch_add(1, Ordering::AcqRel);
        drop(entry);
        Ok(TopicHandle {
            topic,
            clock: self.clock.clone(),
        })
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    fn is_idle(&self, topic: &Topic) -> bool {
        !topic.is_pinned() && topic.subscriber_count() == 0 && self.store.is_window_empty(&topic.name)
    }

    /// Remove a topic if it has no subscribers, no cached messages and no
    /// pinned handles. Safe to call speculatively.
    pub fn release_if_idle(&self, name: &str) -> bool {
        let removed = self
            .topics
            .remove_if(name, |_, topic| self.is_idle(topic))
            .is_some();
        if removed {
            self.count.fetch_sub(1, Ordering::AcqRel);
            self.store.release_window(name);
            debug!(topic = %name, "Released idle topic");
        }
        removed
    }

    /// Release every idle topic whose last activity is older than the grace
    /// period.
    pub fn sweep_idle(&self) -> usize {
        let now = self.clock.now_ms();
        let grace = duration_ms(self.config.idle_grace);
        let candidates: Vec<String> = self
            .topics
            .iter()
            .filter(|t| now.saturating_sub(t.last_active()) >= grace && self.is_idle(t))
            .map(|t| t.key().clone())
            .collect();

        let released = candidates
            .iter()
            .filter(|name| self.release_if_idle(name))
            .count();
        if released > 0 {
            debug!(released, remaining = self.len(), "Swept idle topics");
        }
        trace!(candidates = candidates.len(), released, "Idle sweep");
        released
    }

    /// All topic names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.key().clone()).collect()
    }

    /// Every live topic.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Topic>> {
        self.topics.iter().map(|t| t.value().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            topic_count: self.len(),
            total_subscribers: self.topics.iter().map(|t| t.subscriber_count()).sum(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of live topics.
    pub topic_count: usize,
    /// Total subscriptions across all topics.
    pub total_subscribers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::Message;
    use crate::store::StoreConfig;

    fn registry(max_topics: usize) -> (TopicRegistry, Arc<MessageStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MessageStore::new(StoreConfig::default(), None, clock.clone()));
        let config = RegistryConfig {
            max_topics,
            idle_grace: Duration::from_secs(30),
        };
        (
            TopicRegistry::new(config, store.clone(), clock.clone()),
            store,
            clock,
        )
    }

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("alerts").is_ok());
        assert!(validate_topic_name("backup_job-01").is_ok());
        assert!(validate_topic_name(&"a".repeat(64)).is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name(&"a".repeat(65)).is_err());
        assert!(validate_topic_name("has space").is_err());
        assert!(validate_topic_name("a/b").is_err());
    }

    #[test]
    fn test_create_or_get_same_topic() {
        let (registry, _, _) = registry(10);
        let a = registry.create_or_get("alerts").unwrap();
        let b = registry.create_or_get("alerts").unwrap();
        assert!(Arc::ptr_eq(a.topic(), b.topic()));
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.create_or_get("bad topic"), Err(BrokerError::Validation(_))));
    }

    #[test]
    fn test_capacity() {
        let (registry, _, _) = registry(2);
        let _a = registry.create_or_get("a").unwrap();
        let _b = registry.create_or_get("b").unwrap();
        assert!(matches!(
            registry.create_or_get("c"),
            Err(BrokerError::TopicCapacityExceeded(2))
        ));
        // Existing topics are still reachable at capacity.
        assert!(registry.create_or_get("a").is_ok());
    }

    #[test]
    fn test_pinned_topic_not_released() {
        let (registry, _, _) = registry(10);
        let handle = registry.create_or_get("alerts").unwrap();
        assert!(!registry.release_if_idle("alerts"));
        drop(handle);
        assert!(registry.release_if_idle("alerts"));
        assert!(!registry.exists("alerts"));
        assert_eq!(registry.len(), 0);
        // Repeated release is harmless.
        assert!(!registry.release_if_idle("alerts"));
    }

    #[tokio::test]
    async fn test_cached_messages_keep_topic() {
        let (registry, store, _) = registry(10);
        drop(registry.create_or_get("alerts").unwrap());
        store
            .append(Arc::new(Message::new(1, "alerts", 1_000_000, "hi")))
            .await
            .unwrap();
        assert!(!registry.release_if_idle("alerts"));
    }

    #[test]
    fn test_sweep_respects_grace() {
        let (registry, _, clock) = registry(10);
        drop(registry.create_or_get("alerts").unwrap());

        clock.advance(Duration::from_secs(10));
        assert_eq!(registry.sweep_idle(), 0);

        clock.advance(Duration::from_secs(25));
        assert_eq!(registry.sweep_idle(), 1);
        assert!(registry.is_empty());

        // Recreated identically on demand.
        assert!(registry.create_or_get("alerts").is_ok());
    }
}
