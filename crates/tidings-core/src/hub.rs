//! Subscriber hub: registration, backlog replay and fan-out.

use crate::clock::SharedClock;
use crate::error::BrokerError;
use crate::filter::Filter;
use crate::message::{Cursor, Message};
use crate::store::MessageStore;
use crate::subscription::{CloseReason, Offer, Slot, SlowConsumerPolicy, Subscription, TransportKind};
use crate::topic::{Topic, TopicHandle};
use crate::visitor::Visitor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bounded outbound queue per subscription.
    pub queue_capacity: usize,
    pub slow_consumer: SlowConsumerPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            slow_consumer: SlowConsumerPolicy::DropOldest,
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Subscriptions the message was queued for.
    pub delivered: usize,
    /// Subscriptions whose filter rejected it.
    pub filtered: usize,
    /// Deliveries that displaced an older queued message.
    pub dropped: usize,
    /// Subscriptions that were or became closed.
    pub closed: usize,
}

impl FanoutReport {
    /// Subscriptions that matched the message.
    #[must_use]
    pub fn matched(&self) -> usize {
        self.delivered + self.dropped
    }
}

/// Hub counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub registered: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub slow_closed: u64,
}

/// Registration parameters.
#[derive(Debug, Clone)]
pub struct Registration {
    pub filter: Filter,
    pub kind: TransportKind,
    pub cursor: Cursor,
    /// Visitor whose subscription quota was charged, released on unregister.
    pub visitor: Option<Arc<Visitor>>,
}

/// Tracks live subscriptions and delivers messages to them.
pub struct SubscriberHub {
    config: HubConfig,
    store: Arc<MessageStore>,
    clock: SharedClock,
    next_id: AtomicU64,
    registered: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    slow_closed: AtomicU64,
}

impl SubscriberHub {
    #[must_use]
    pub fn new(config: HubConfig, store: Arc<MessageStore>, clock: SharedClock) -> Self {
        Self {
            config,
            store,
            clock,
            next_id: AtomicU64::new(1),
            registered: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            slow_closed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a subscription on a pinned topic.
    ///
    /// Live capture begins before the backlog is queried; the handle merges
    /// both and never yields the same id twice.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the backlog query fails. The partially
    /// registered subscription is unregistered before returning.
    pub async fn register(
        &self,
        topic: &TopicHandle,
        registration: Registration,
    ) -> Result<Subscription, BrokerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(
            id,
            registration.filter,
            self.config.queue_capacity,
            self.config.slow_consumer,
        ));
        topic.add_subscriber(Arc::clone(&slot));

        // From here on, dropping `subscription` undoes the registration.
        let mut subscription = Subscription::new(
            Arc::clone(&slot),
            Arc::clone(topic.topic()),
            registration.visitor,
            registration.kind,
            self.clock.clone(),
        );

        if registration.cursor != Cursor::None {
            let backlog: Vec<Arc<Message>> = self
                .store
                .since(topic.name(), registration.cursor)
                .await?
                .into_iter()
                .filter(|m| slot.filter().matches(m))
                .collect();
            trace!(subscription = id, backlog = backlog.len(), "Backlog loaded");
            subscription.set_backlog(backlog);
        }

        subscription.activate();
        self.registered.fetch_add(1, Ordering::Relaxed);
        debug!(
            subscription = id,
            topic = %topic.name(),
            kind = registration.kind.as_str(),
            subscribers = topic.subscriber_count(),
            "Subscribed"
        );
        Ok(subscription)
    }

    /// Queue a message for every matching subscriber of a topic.
    ///
    /// The subscriber set is snapshotted first; offers happen outside the
    /// topic lock and never wait on a consumer.
    pub fn fanout(&self, topic: &Topic, message: &Arc<Message>) -> FanoutReport {
        let mut report = FanoutReport::default();
        for slot in topic.subscribers() {
            match slot.offer(message) {
                Offer::Queued => report.delivered += 1,
                Offer::Filtered => report.filtered += 1,
                Offer::Dropped => report.dropped += 1,
                Offer::SlowConsumer => {
                    report.closed += 1;
                    self.slow_closed.fetch_add(1, Ordering::Relaxed);
                }
                Offer::Closed => report.closed += 1,
            }
        }
        self.delivered
            .fetch_add(report.matched() as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        trace!(
            topic = %topic.name(),
            id = message.id,
            delivered = report.delivered,
            filtered = report.filtered,
            dropped = report.dropped,
            "Fanout"
        );
        report
    }

    /// Close every subscription on the given topics.
    pub fn close_all<I>(&self, topics: I, reason: CloseReason) -> usize
    where
        I: IntoIterator<Item = Arc<Topic>>,
    {
        let mut closed = 0;
        for topic in topics {
            for slot in topic.subscribers() {
                slot.close(reason);
                closed += 1;
            }
        }
        debug!(closed, %reason, "Closed subscriptions");
        closed
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            registered: self.registered.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            slow_closed: self.slow_closed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::Priority;
    use crate::store::StoreConfig;
    use crate::subscription::SubscriptionState;
    use crate::topic::{RegistryConfig, TopicRegistry};

    struct Fixture {
        registry: TopicRegistry,
        store: Arc<MessageStore>,
        hub: SubscriberHub,
    }

    fn fixture(config: HubConfig) -> Fixture {
        let clock: SharedClock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MessageStore::new(StoreConfig::default(), None, clock.clone()));
        Fixture {
            registry: TopicRegistry::new(RegistryConfig::default(), store.clone(), clock.clone()),
            hub: SubscriberHub::new(config, store.clone(), clock),
            store,
        }
    }

    fn live(filter: Filter) -> Registration {
        Registration {
            filter,
            kind: TransportKind::Stream,
            cursor: Cursor::None,
            visitor: None,
        }
    }

    fn msg(id: u64) -> Arc<Message> {
        Arc::new(Message::new(id, "t", 1_000, format!("m{id}")))
    }

    #[tokio::test]
    async fn test_fanout_respects_filters() {
        let f = fixture(HubConfig::default());
        let topic = f.registry.create_or_get("t").unwrap();
        let mut all = f.hub.register(&topic, live(Filter::Any)).await.unwrap();
        let mut urgent = f
            .hub
            .register(&topic, live(Filter::MinPriority(Priority::Urgent)))
            .await
            .unwrap();

        let report = f.hub.fanout(&topic, &msg(1));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.filtered, 1);

        assert_eq!(all.try_recv().unwrap().id, 1);
        assert!(urgent.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_backlog_then_live_without_duplicates() {
        let f = fixture(HubConfig::default());
        let topic = f.registry.create_or_get("t").unwrap();
        for id in 1..=3 {
            f.store.append(msg(id)).await.unwrap();
        }

        let mut sub = f
            .hub
            .register(
                &topic,
                Registration {
                    cursor: Cursor::After(1),
                    ..live(Filter::Any)
                },
            )
            .await
            .unwrap();

        // Message 3 arrives live as well; it must not be seen twice.
        f.hub.fanout(&topic, &msg(3));
        f.hub.fanout(&topic, &msg(4));

        let ids: Vec<u64> = sub.drain_ready().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let f = fixture(HubConfig::default());
        let topic = f.registry.create_or_get("t").unwrap();
        let sub = f.hub.register(&topic, live(Filter::Any)).await.unwrap();
        assert_eq!(topic.subscriber_count(), 1);
        assert_eq!(sub.state(), SubscriptionState::Active);

        drop(sub);
        assert_eq!(topic.subscriber_count(), 0);
        assert_eq!(f.hub.fanout(&topic, &msg(1)), FanoutReport::default());
    }

    #[tokio::test]
    async fn test_slow_consumer_close() {
        let f = fixture(HubConfig {
            queue_capacity: 1,
            slow_consumer: SlowConsumerPolicy::Close,
        });
        let topic = f.registry.create_or_get("t").unwrap();
        let mut slow = f.hub.register(&topic, live(Filter::Any)).await.unwrap();

        f.hub.fanout(&topic, &msg(1));
        let report = f.hub.fanout(&topic, &msg(2));
        assert_eq!(report.closed, 1);
        assert_eq!(f.hub.stats().slow_closed, 1);

        assert!(slow.recv().await.is_none());
        assert_eq!(slow.close_reason(), Some(CloseReason::SlowConsumer));
    }

    #[tokio::test]
    async fn test_close_all_ends_streams() {
        let f = fixture(HubConfig::default());
        let topic = f.registry.create_or_get("t").unwrap();
        let mut sub = f.hub.register(&topic, live(Filter::Any)).await.unwrap();
        f.hub.fanout(&topic, &msg(1));

        assert_eq!(f.hub.close_all(f.registry.all(), CloseReason::Shutdown), 1);
        // Queued messages are still drained before the end.
        assert_eq!(sub.recv().await.unwrap().id, 1);
        assert!(sub.recv().await.is_none());
        assert_eq!(sub.close_reason(), Some(CloseReason::Shutdown));
    }
}
