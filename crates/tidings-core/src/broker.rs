//! The delivery dispatcher.
//!
//! [`Broker`] ties the components together and is the only type transports
//! talk to. Every operation checks, in order: validation, permission, quota,
//! topic capacity. Nothing is changed until all checks pass; a capacity
//! rejection hands back the quota it was charged.

use crate::auth::{Action, AllowAll, Authorizer, Permission};
use crate::clock::{SharedClock, SystemClock};
use crate::error::BrokerError;
use crate::filter::{Filter, FilterParams};
use crate::hub::{FanoutReport, HubConfig, HubStats, Registration, SubscriberHub};
use crate::message::{validate_url, Cursor, Message, MessageId, PublishRequest};
use crate::persistence::Persistence;
use crate::push::{LogRelay, MessageSummary, PushLimits, PushPolicy, PushRegistry, PushRelay};
use crate::store::{Durability, MessageStore, StoreConfig, StoreStats};
use crate::subscription::{CloseReason, Subscription, TransportKind};
use crate::topic::{validate_topic_name, RegistryConfig, TopicRegistry};
use crate::visitor::{CostKind, Identity, QuotaConfig, Visitor, VisitorStats, VisitorTable};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub quotas: QuotaConfig,
    pub hub: HubConfig,
    pub push_policy: PushPolicy,
    pub push_limits: PushLimits,
    /// Largest accepted payload (body, title, tags, click) in bytes.
    pub max_message_size: usize,
    /// How often the manager task sweeps topics, caches and visitors.
    pub manager_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
            quotas: QuotaConfig::default(),
            hub: HubConfig::default(),
            push_policy: PushPolicy::default(),
            push_limits: PushLimits::default(),
            max_message_size: 4096,
            manager_interval: Duration::from_secs(60),
        }
    }
}

/// A subscribe, poll or long-poll request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub topic: String,
    pub filter: Filter,
    pub cursor: Cursor,
}

impl SubscribeRequest {
    /// Live-only subscription without a filter.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            filter: Filter::Any,
            cursor: Cursor::None,
        }
    }

    #[must_use]
    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = cursor;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Build from client parameters.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidFilter`] for malformed filter parameters.
    pub fn from_params(
        topic: impl Into<String>,
        params: &FilterParams,
        cursor: Cursor,
    ) -> Result<Self, BrokerError> {
        Ok(Self {
            topic: topic.into(),
            filter: Filter::from_params(params)?,
            cursor,
        })
    }
}

/// Work done by one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub evicted_messages: usize,
    pub pruned_messages: usize,
    pub released_topics: usize,
    pub evicted_visitors: usize,
}

/// Broker statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub topics: usize,
    pub subscribers: usize,
    pub visitors: usize,
    pub published: u64,
    pub push_sent: u64,
    pub push_failed: u64,
    pub push_endpoints: usize,
    pub store: StoreStats,
    pub hub: HubStats,
}

#[derive(Debug, Default)]
struct PushCounters {
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Builds a [`Broker`] with its collaborators.
pub struct BrokerBuilder {
    config: BrokerConfig,
    persistence: Option<Arc<dyn Persistence>>,
    relay: Arc<dyn PushRelay>,
    authorizer: Arc<dyn Authorizer>,
    clock: SharedClock,
}

impl BrokerBuilder {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            persistence: None,
            relay: Arc::new(LogRelay),
            authorizer: Arc::new(AllowAll),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    #[must_use]
    pub fn relay(mut self, relay: Arc<dyn PushRelay>) -> Self {
        self.relay = relay;
        self
    }

    #[must_use]
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Broker> {
        let Self {
            config,
            persistence,
            relay,
            authorizer,
            clock,
        } = self;
        info!(
            max_topics = config.registry.max_topics,
            durability = ?config.store.durability,
            persistent = persistence.is_some(),
            "Creating broker"
        );

        let store = Arc::new(MessageStore::new(
            config.store.clone(),
            persistence,
            clock.clone(),
        ));
        let registry = TopicRegistry::new(config.registry.clone(), store.clone(), clock.clone());
        let hub = SubscriberHub::new(config.hub.clone(), store.clone(), clock.clone());
        let visitors = VisitorTable::new(config.quotas.clone(), clock.clone());
        let (shutdown_tx, _) = watch::channel(false);
        let push_limits = config.push_limits;

        Arc::new(Broker {
            config,
            clock,
            store,
            registry,
            hub,
            visitors,
            authorizer,
            relay,
            push_targets: PushRegistry::new(push_limits),
            next_id: AtomicU64::new(0),
            published: AtomicU64::new(0),
            push: Arc::new(PushCounters::default()),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The pub/sub broker.
pub struct Broker {
    config: BrokerConfig,
    clock: SharedClock,
    store: Arc<MessageStore>,
    registry: TopicRegistry,
    hub: SubscriberHub,
    visitors: VisitorTable,
    authorizer: Arc<dyn Authorizer>,
    relay: Arc<dyn PushRelay>,
    push_targets: PushRegistry,
    next_id: AtomicU64,
    published: AtomicU64,
    push: Arc<PushCounters>,
    started: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Broker with default collaborators.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        BrokerBuilder::new(config).build()
    }

    #[must_use]
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Current broker time in Unix milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    #[must_use]
    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    #[must_use]
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Seed the id sequence and start background tasks. Idempotent.
    ///
    /// # Errors
    ///
    /// In strict durability mode, fails if the persistence high-water mark
    /// cannot be read.
    pub async fn start(self: &Arc<Self>) -> Result<(), BrokerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(persistence) = self.store.persistence() {
            match persistence.high_water_mark().await {
                Ok(Some(mark)) => {
                    self.next_id.fetch_max(mark, Ordering::AcqRel);
                    info!(high_water_mark = mark, "Seeded message ids");
                }
                Ok(None) => {}
                Err(e) if self.config.store.durability == Durability::Strict => {
                    self.started.store(false, Ordering::Release);
                    return Err(e.into());
                }
                Err(e) => warn!(error = %e, "Could not read high-water mark, ids start fresh"),
            }
        }

        let mut tasks = Vec::new();
        if let Some(writer) = self.store.spawn_writer(self.shutdown_tx.subscribe()) {
            tasks.push(writer);
        }
        tasks.push(tokio::spawn(run_manager(
            Arc::downgrade(self),
            self.config.manager_interval,
            self.shutdown_tx.subscribe(),
        )));
        self.tasks.lock().extend(tasks);
        info!("Broker started");
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), BrokerError> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(BrokerError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    async fn authorize(
        &self,
        identity: &Identity,
        topic: &str,
        action: Action,
    ) -> Result<(), BrokerError> {
        match self
            .authorizer
            .check_permission(&identity.visitor_id(), topic, action)
            .await
        {
            Permission::Allow => Ok(()),
            Permission::Deny => {
                debug!(visitor = %identity.visitor_id(), topic, %action, "Permission denied");
                Err(BrokerError::PermissionDenied {
                    topic: topic.to_string(),
                    action,
                })
            }
        }
    }

    /// Publish a message.
    ///
    /// Returns once the message is stored (per durability mode) and queued
    /// for live subscribers; never waits on subscriber transports.
    ///
    /// # Errors
    ///
    /// Validation, permission, quota and capacity errors leave no trace. A
    /// strict-mode persistence failure is returned after quota was charged;
    /// the id it consumed is never reused.
    pub async fn publish(
        &self,
        request: PublishRequest,
        identity: &Identity,
    ) -> Result<Arc<Message>, BrokerError> {
        self.ensure_running()?;
        request.validate(self.config.max_message_size)?;
        self.authorize(identity, &request.topic, Action::Write).await?;

        let visitor = self.visitors.visitor(identity);
        let mut costs = vec![CostKind::Request, CostKind::Message];
        // Validation guarantees a declared size.
        if let Some(bytes) = request.attachment.as_ref().and_then(|a| a.size) {
            costs.push(CostKind::Attachment { bytes });
        }
        self.visitors.allow(&visitor, &costs)?;

        let topic = match self.registry.create_or_get(&request.topic) {
            Ok(topic) => topic,
            Err(e) => {
                visitor.refund(&costs);
                return Err(e);
            }
        };
        let cache = request.cache;
        let push_override = request.push;

        let (message, report) = {
            let _guard = topic.lock_publish().await;
            let id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
            let time = topic.stamp(self.clock.now_ms());
            let message = Arc::new(request.into_message(id, time));
            if cache {
                self.store.append(Arc::clone(&message)).await?;
            }
            let report = self.hub.fanout(&topic, &message);
            (message, report)
        };
        self.published.fetch_add(1, Ordering::Relaxed);

        debug!(
            topic = %message.topic,
            id = message.id,
            visitor = %visitor.id(),
            recipients = report.matched(),
            cached = cache,
            "Published message"
        );

        self.maybe_push(&message, report, push_override);
        Ok(message)
    }

    fn maybe_push(&self, message: &Arc<Message>, report: FanoutReport, push_override: Option<bool>) {
        if !self.push_targets.has_targets(&message.topic) {
            return;
        }
        if !self
            .config
            .push_policy
            .should_push(message, report.matched(), push_override)
        {
            return;
        }
        let targets = self.push_targets.targets(&message.topic);
        let summary = MessageSummary::from_message(message);
        let relay = Arc::clone(&self.relay);
        let counters = Arc::clone(&self.push);
        tokio::spawn(async move {
            match relay.notify(&targets, &summary).await {
                Ok(()) => {
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = %summary.topic, id = summary.id, error = %e, "Push relay failed");
                }
            }
        });
    }

    async fn register(
        &self,
        request: SubscribeRequest,
        identity: &Identity,
        kind: TransportKind,
    ) -> Result<Subscription, BrokerError> {
        self.ensure_running()?;
        validate_topic_name(&request.topic).map_err(BrokerError::validation)?;
        self.authorize(identity, &request.topic, Action::Read).await?;

        let visitor = self.visitors.visitor(identity);
        let costs = [CostKind::Request, CostKind::Subscription];
        self.visitors.allow(&visitor, &costs)?;

        let topic = match self.registry.create_or_get(&request.topic) {
            Ok(topic) => topic,
            Err(e) => {
                visitor.refund(&costs);
                return Err(e);
            }
        };

        // On failure the half-built subscription releases the quota itself.
        self.hub
            .register(
                &topic,
                Registration {
                    filter: request.filter,
                    kind,
                    cursor: request.cursor,
                    visitor: Some(visitor),
                },
            )
            .await
    }

    /// Open a streaming subscription. Backlog per the request cursor is
    /// delivered first.
    ///
    /// # Errors
    ///
    /// Validation, permission, quota, capacity or backlog query errors.
    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
        identity: &Identity,
    ) -> Result<Subscription, BrokerError> {
        self.register(request, identity, TransportKind::Stream).await
    }

    /// One-shot read of retained messages matching the cursor and filter.
    ///
    /// # Errors
    ///
    /// Validation, permission, request quota or backlog query errors.
    pub async fn poll(
        &self,
        request: SubscribeRequest,
        identity: &Identity,
    ) -> Result<Vec<Arc<Message>>, BrokerError> {
        self.ensure_running()?;
        validate_topic_name(&request.topic).map_err(BrokerError::validation)?;
        self.authorize(identity, &request.topic, Action::Read).await?;

        let visitor = self.visitors.visitor(identity);
        self.visitors.allow(&visitor, &[CostKind::Request])?;

        let messages = self
            .store
            .since(&request.topic, request.cursor)
            .await?
            .into_iter()
            .filter(|m| request.filter.matches(m))
            .collect::<Vec<_>>();
        debug!(topic = %request.topic, count = messages.len(), "Poll");
        Ok(messages)
    }

    /// Return ready messages, or wait up to `wait` for the first one.
    ///
    /// # Errors
    ///
    /// Same as [`Broker::subscribe`].
    pub async fn long_poll(
        &self,
        request: SubscribeRequest,
        identity: &Identity,
        wait: Duration,
    ) -> Result<Vec<Arc<Message>>, BrokerError> {
        let mut subscription = self.register(request, identity, TransportKind::LongPoll).await?;

        let ready = subscription.drain_ready();
        if !ready.is_empty() {
            return Ok(ready);
        }

        match tokio::time::timeout(wait, subscription.recv()).await {
            Ok(Some(first)) => {
                let mut messages = vec![first];
                messages.extend(subscription.drain_ready());
                Ok(messages)
            }
            Ok(None) | Err(_) => Ok(Vec::new()),
        }
    }

    /// Register a push endpoint for a topic.
    ///
    /// # Errors
    ///
    /// Validation, permission or request quota errors, and
    /// [`BrokerError::PushCapacityExceeded`] when the topic or the broker
    /// has no room for another endpoint.
    pub async fn register_push(
        &self,
        topic: &str,
        endpoint: &str,
        identity: &Identity,
    ) -> Result<bool, BrokerError> {
        self.ensure_running()?;
        validate_topic_name(topic).map_err(BrokerError::validation)?;
        validate_url(endpoint, false)?;
        self.authorize(identity, topic, Action::Read).await?;
        let visitor = self.visitors.visitor(identity);
        self.visitors.allow(&visitor, &[CostKind::Request])?;

        let added = self.push_targets.register(topic, endpoint).map_err(|e| {
            visitor.refund(&[CostKind::Request]);
            e
        })?;
        debug!(topic, endpoint, added, "Push endpoint registered");
        Ok(added)
    }

    /// Remove a push endpoint.
    ///
    /// # Errors
    ///
    /// Validation or permission errors.
    pub async fn unregister_push(
        &self,
        topic: &str,
        endpoint: &str,
        identity: &Identity,
    ) -> Result<bool, BrokerError> {
        validate_topic_name(topic).map_err(BrokerError::validation)?;
        self.authorize(identity, topic, Action::Read).await?;
        let removed = self.push_targets.unregister(topic, endpoint);
        debug!(topic, endpoint, removed, "Push endpoint unregistered");
        Ok(removed)
    }

    /// One pass of background maintenance.
    pub async fn maintain(&self) -> MaintenanceReport {
        let evicted_messages = self.store.sweep();
        let pruned_messages = self.store.prune_persistence().await;
        let released_topics = self.registry.sweep_idle();
        let evicted_visitors = self.visitors.sweep();
        MaintenanceReport {
            evicted_messages,
            pruned_messages,
            released_topics,
            evicted_visitors,
        }
    }

    /// Quota snapshot for a visitor, if known.
    #[must_use]
    pub fn visitor_stats(&self, identity: &Identity) -> Option<VisitorStats> {
        self.visitors
            .get(&identity.visitor_id())
            .map(|v| v.stats(self.clock.now_ms()))
    }

    /// The visitor record for an identity, created on demand.
    pub fn visitor(&self, identity: &Identity) -> Arc<Visitor> {
        self.visitors.visitor(identity)
    }

    /// Highest id assigned so far.
    #[must_use]
    pub fn last_id(&self) -> MessageId {
        self.next_id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop accepting work, close every subscription, stop background tasks
    /// and flush pending writes.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let closed = self.hub.close_all(self.registry.all(), CloseReason::Shutdown);
        info!(closed, "Broker shutting down");

        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Broker stopped");
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let registry = self.registry.stats();
        BrokerStats {
            topics: registry.topic_count,
            subscribers: registry.total_subscribers,
            visitors: self.visitors.len(),
            published: self.published.load(Ordering::Relaxed),
            push_sent: self.push.sent.load(Ordering::Relaxed),
            push_failed: self.push.failed.load(Ordering::Relaxed),
            push_endpoints: self.push_targets.len(),
            store: self.store.stats(),
            hub: self.hub.stats(),
        }
    }
}

async fn run_manager(broker: Weak<Broker>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                let report = broker.maintain().await;
                if report != MaintenanceReport::default() {
                    debug!(?report, "Maintenance pass");
                }
            }
        }
    }
    debug!("Manager task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Access, AccessControlList};
    use crate::clock::ManualClock;
    use crate::message::{Attachment, Priority};
    use crate::persistence::MemoryPersistence;
    use crate::push::PushRelayError;
    use crate::visitor::{Quota, QuotaKind};
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};

    const START: u64 = 1_700_000_000_000;

    fn anon() -> Identity {
        Identity::anonymous(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
    }

    fn broker_with(config: BrokerConfig) -> (Arc<Broker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let broker = Broker::builder(config).clock(clock.clone()).build();
        (broker, clock)
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_ids() {
        let (broker, _) = broker_with(BrokerConfig::default());
        let a = broker.publish(PublishRequest::new("t", "one"), &anon()).await.unwrap();
        let b = broker.publish(PublishRequest::new("t", "two"), &anon()).await.unwrap();
        let c = broker.publish(PublishRequest::new("u", "three"), &anon()).await.unwrap();
        assert!(a.id < b.id && b.id < c.id);
        assert!(b.time >= a.time);
        assert_eq!(broker.stats().published, 3);
    }

    #[tokio::test]
    async fn test_validation_before_side_effects() {
        let (broker, _) = broker_with(BrokerConfig::default());
        let err = broker
            .publish(PublishRequest::new("bad topic", "hi"), &anon())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Validation(_)));
        assert_eq!(broker.registry().len(), 0);
        assert_eq!(broker.last_id(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let acl = AccessControlList::new(Access::ReadOnly);
        let clock = Arc::new(ManualClock::new(START));
        let broker = Broker::builder(BrokerConfig::default())
            .clock(clock)
            .authorizer(Arc::new(acl))
            .build();

        let err = broker
            .publish(PublishRequest::new("t", "hi"), &anon())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PermissionDenied { action: Action::Write, .. }));
        assert!(broker.subscribe(SubscribeRequest::new("t"), &anon()).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_quota_released_on_drop() {
        let mut config = BrokerConfig::default();
        config.quotas.anonymous = Quota {
            max_subscriptions: 1,
            ..Quota::anonymous()
        };
        let (broker, _) = broker_with(config);

        let first = broker.subscribe(SubscribeRequest::new("t"), &anon()).await.unwrap();
        let err = broker
            .subscribe(SubscribeRequest::new("t"), &anon())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::QuotaExceeded(QuotaKind::Subscriptions)));

        drop(first);
        assert!(broker.subscribe(SubscribeRequest::new("t"), &anon()).await.is_ok());
    }

    #[tokio::test]
    async fn test_topic_capacity_rejection_keeps_quota() {
        let mut config = BrokerConfig::default();
        config.registry.max_topics = 1;
        config.quotas.anonymous = Quota {
            daily_messages: 2,
            ..Quota::anonymous()
        };
        let (broker, _) = broker_with(config);

        broker.publish(PublishRequest::new("a", "first"), &anon()).await.unwrap();
        let err = broker
            .publish(PublishRequest::new("b", "no room"), &anon())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::TopicCapacityExceeded(1)));
        assert_eq!(broker.registry().len(), 1);

        let stats = broker.visitor_stats(&anon()).unwrap();
        assert_eq!(stats.messages_today, 1);
        assert_eq!(stats.requests_remaining, Quota::anonymous().request_burst - 1);

        // The rejected publish did not use up the second daily message.
        broker.publish(PublishRequest::new("a", "second"), &anon()).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_against_full_registry() {
        let mut config = BrokerConfig::default();
        config.registry.max_topics = 1;
        let (broker, _) = broker_with(config);

        let _held = broker.subscribe(SubscribeRequest::new("a"), &anon()).await.unwrap();
        let err = broker
            .subscribe(SubscribeRequest::new("b"), &anon())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::TopicCapacityExceeded(1)));

        let stats = broker.visitor_stats(&anon()).unwrap();
        assert_eq!(stats.subscriptions, 1);
        assert_eq!(stats.requests_remaining, Quota::anonymous().request_burst - 1);
        assert_eq!(broker.stats().subscribers, 1);
    }

    #[tokio::test]
    async fn test_attachment_bytes_charged() {
        let mut config = BrokerConfig::default();
        config.quotas.anonymous = Quota {
            attachment_daily_bytes: 1_000,
            ..Quota::anonymous()
        };
        let (broker, _) = broker_with(config);
        let report = || {
            PublishRequest::new("t", "report")
                .with_attachment(Attachment::from_url("https://files.example/r.pdf").with_size(600))
        };

        broker.publish(report(), &anon()).await.unwrap();
        let err = broker.publish(report(), &anon()).await.unwrap_err();
        assert!(matches!(err, BrokerError::QuotaExceeded(QuotaKind::AttachmentBytes)));
        assert_eq!(broker.visitor_stats(&anon()).unwrap().attachment_bytes_today, 600);
    }

    #[tokio::test]
    async fn test_best_effort_persistence_failure_still_delivers() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence.set_failing(true);
        let mut config = BrokerConfig::default();
        config.store.batch_size = 1;
        config.store.write_retries = 1;
        config.store.retry_backoff = Duration::from_millis(1);
        let broker = Broker::builder(config)
            .clock(Arc::new(ManualClock::new(START)))
            .persistence(persistence.clone())
            .build();
        broker.start().await.unwrap();
        let mut sub = broker.subscribe(SubscribeRequest::new("t"), &anon()).await.unwrap();

        let published = broker
            .publish(PublishRequest::new("t", "kept in memory"), &anon())
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().id, published.id);

        broker.shutdown().await;
        assert_eq!(broker.stats().store.persist_failures, 1);
        assert!(persistence.is_empty());
    }

    #[tokio::test]
    async fn test_push_endpoint_limits() {
        let mut config = BrokerConfig::default();
        config.push_limits = PushLimits {
            per_topic: 1,
            total: 2,
        };
        let (broker, _) = broker_with(config);

        assert!(broker.register_push("t", "https://push.example/a", &anon()).await.unwrap());
        assert!(matches!(
            broker.register_push("t", "https://push.example/b", &anon()).await,
            Err(BrokerError::PushCapacityExceeded(1))
        ));
        assert!(broker.register_push("u", "https://push.example/a", &anon()).await.unwrap());
        assert!(matches!(
            broker.register_push("v", "https://push.example/a", &anon()).await,
            Err(BrokerError::PushCapacityExceeded(2))
        ));
        assert_eq!(broker.stats().push_endpoints, 2);

        // Rejections hand the request token back.
        let stats = broker.visitor_stats(&anon()).unwrap();
        assert_eq!(stats.requests_remaining, Quota::anonymous().request_burst - 2);
    }

    #[tokio::test]
    async fn test_uncached_message_delivered_live_only() {
        let (broker, _) = broker_with(BrokerConfig::default());
        let mut sub = broker.subscribe(SubscribeRequest::new("t"), &anon()).await.unwrap();

        broker
            .publish(PublishRequest::new("t", "ephemeral").uncached(), &anon())
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().body, "ephemeral");

        let polled = broker
            .poll(SubscribeRequest::new("t").with_cursor(Cursor::All), &anon())
            .await
            .unwrap();
        assert!(polled.is_empty());
    }

    #[tokio::test]
    async fn test_poll_applies_filter() {
        let (broker, _) = broker_with(BrokerConfig::default());
        broker
            .publish(PublishRequest::new("t", "low").with_priority(Priority::Low), &anon())
            .await
            .unwrap();
        broker
            .publish(PublishRequest::new("t", "high").with_priority(Priority::High), &anon())
            .await
            .unwrap();

        let params = FilterParams {
            priority: Some("4,5".into()),
            ..FilterParams::default()
        };
        let request = SubscribeRequest::from_params("t", &params, Cursor::All).unwrap();
        let found = broker.poll(request, &anon()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].body, "high");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_times_out_empty() {
        let (broker, _) = broker_with(BrokerConfig::default());
        let found = broker
            .long_poll(SubscribeRequest::new("t"), &anon(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(broker.stats().subscribers, 0);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_publish() {
        let (broker, _) = broker_with(BrokerConfig::default());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .long_poll(SubscribeRequest::new("t"), &anon(), Duration::from_secs(30))
                    .await
            })
        };
        while broker.stats().subscribers == 0 {
            tokio::task::yield_now().await;
        }
        broker.publish(PublishRequest::new("t", "wake"), &anon()).await.unwrap();

        let found = waiter.await.unwrap().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].body, "wake");
    }

    #[derive(Default)]
    struct RecordingRelay {
        calls: AtomicU64,
    }

    #[async_trait]
    impl PushRelay for RecordingRelay {
        async fn notify(&self, _: &[String], _: &MessageSummary) -> Result<(), PushRelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PushRelayError::Unavailable("gateway down".into()))
        }
    }

    #[tokio::test]
    async fn test_push_failure_is_isolated() {
        let relay = Arc::new(RecordingRelay::default());
        let clock = Arc::new(ManualClock::new(START));
        let broker = Broker::builder(BrokerConfig::default())
            .clock(clock)
            .relay(relay.clone())
            .build();
        broker
            .register_push("t", "https://push.example/device", &anon())
            .await
            .unwrap();

        assert!(broker.publish(PublishRequest::new("t", "hi"), &anon()).await.is_ok());
        // Suppressed per message.
        assert!(broker
            .publish(PublishRequest::new("t", "quiet").with_push(false), &anon())
            .await
            .is_ok());

        while broker.stats().push_failed == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(relay.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_seeds_ids_from_persistence() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence
            .append(&Message::new(41, "t", START, "old"))
            .await
            .unwrap();
        let broker = Broker::builder(BrokerConfig::default())
            .clock(Arc::new(ManualClock::new(START)))
            .persistence(persistence)
            .build();
        broker.start().await.unwrap();

        let m = broker.publish(PublishRequest::new("t", "new"), &anon()).await.unwrap();
        assert_eq!(m.id, 42);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_work() {
        let (broker, _) = broker_with(BrokerConfig::default());
        broker.start().await.unwrap();
        let mut sub = broker.subscribe(SubscribeRequest::new("t"), &anon()).await.unwrap();

        broker.shutdown().await;
        assert!(sub.recv().await.is_none());
        assert_eq!(sub.close_reason(), Some(CloseReason::Shutdown));
        assert!(matches!(
            broker.publish(PublishRequest::new("t", "late"), &anon()).await,
            Err(BrokerError::ShuttingDown)
        ));
    }
}
