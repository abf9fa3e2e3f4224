//! Visitors and per-visitor quotas.
//!
//! A visitor is whoever is making requests: an anonymous network address or
//! an authenticated principal. Each visitor carries its own counters, all
//! guarded by one short-lived lock so that a multi-cost check (request +
//! message + attachment) either commits every charge or none of them.
//!
//! All replenishment is driven by explicit comparisons against the injected
//! [`Clock`](crate::clock::Clock):
//!
//! - requests: token bucket, one token every `request_refill`, up to
//!   `request_burst`
//! - messages and attachments: counters reset at the next UTC midnight
//! - subscriptions: a concurrency count, released on unregister

use crate::clock::{duration_ms, next_day_boundary, SharedClock};
use crate::error::BrokerError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Visitor identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VisitorId {
    /// Anonymous visitor keyed by network address.
    Addr(IpAddr),
    /// Authenticated principal.
    User(String),
}

impl fmt::Display for VisitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VisitorId::Addr(ip) => write!(f, "ip:{ip}"),
            VisitorId::User(name) => write!(f, "user:{name}"),
        }
    }
}

/// Request identity as seen by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Network origin.
    pub addr: IpAddr,
    /// Authenticated principal, if any.
    pub user: Option<String>,
}

impl Identity {
    /// An anonymous identity.
    #[must_use]
    pub fn anonymous(addr: IpAddr) -> Self {
        Self { addr, user: None }
    }

    /// An authenticated identity.
    #[must_use]
    pub fn user(addr: IpAddr, name: impl Into<String>) -> Self {
        Self {
            addr,
            user: Some(name.into()),
        }
    }

    /// Quota key: the principal if authenticated, the address otherwise.
    #[must_use]
    pub fn visitor_id(&self) -> VisitorId {
        match &self.user {
            Some(name) => VisitorId::User(name.clone()),
            None => VisitorId::Addr(self.addr),
        }
    }

    /// Which quota class applies: authenticated if a principal is present.
    #[must_use]
    pub fn class(&self) -> VisitorClass {
        if self.user.is_some() {
            VisitorClass::Authenticated
        } else {
            VisitorClass::Anonymous
        }
    }
}

/// Visitor class selecting which [`Quota`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VisitorClass {
    Anonymous,
    Authenticated,
}

/// Immutable limits for one visitor class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    /// Request bucket capacity.
    pub request_burst: u32,
    /// Time to regain one request token. Zero disables request limiting.
    pub request_refill: Duration,
    /// Messages per UTC day.
    pub daily_messages: u32,
    /// Largest single attachment in bytes.
    pub attachment_file_size: u64,
    /// Attachment bytes per UTC day.
    pub attachment_daily_bytes: u64,
    /// Attachments per UTC day.
    pub attachment_daily_count: u32,
    /// Concurrent live subscriptions.
    pub max_subscriptions: u32,
}

impl Quota {
    /// Default limits for anonymous visitors.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            request_burst: 60,
            request_refill: Duration::from_secs(5),
            daily_messages: 17_280,
            attachment_file_size: 15 * 1024 * 1024,
            attachment_daily_bytes: 500 * 1024 * 1024,
            attachment_daily_count: 250,
            max_subscriptions: 30,
        }
    }

    /// Default limits for authenticated visitors.
    #[must_use]
    pub fn authenticated() -> Self {
        Self {
            request_burst: 120,
            request_refill: Duration::from_secs(1),
            daily_messages: 50_000,
            attachment_file_size: 100 * 1024 * 1024,
            attachment_daily_bytes: 5 * 1024 * 1024 * 1024,
            attachment_daily_count: 2_500,
            max_subscriptions: 100,
        }
    }

    /// No limits at all (exempt visitors).
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            request_burst: u32::MAX,
            request_refill: Duration::ZERO,
            daily_messages: u32::MAX,
            attachment_file_size: u64::MAX,
            attachment_daily_bytes: u64::MAX,
            attachment_daily_count: u32::MAX,
            max_subscriptions: u32::MAX,
        }
    }
}

/// Quota configuration for the visitor table.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub anonymous: Quota,
    pub authenticated: Quota,
    /// Visitor ids (as displayed, e.g. `ip:10.0.0.1` or `user:ci`) that are
    /// never limited.
    pub exempt: Vec<String>,
    /// Inactive visitors are forgotten after this long.
    pub visitor_ttl: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            anonymous: Quota::anonymous(),
            authenticated: Quota::authenticated(),
            exempt: Vec::new(),
            visitor_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

/// What an operation costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostKind {
    /// Any request.
    Request,
    /// One published message.
    Message,
    /// One attachment of the given size.
    Attachment { bytes: u64 },
    /// One concurrent subscription slot.
    Subscription,
}

/// Which limit rejected an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Requests,
    DailyMessages,
    AttachmentSize,
    AttachmentBytes,
    AttachmentCount,
    Subscriptions,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuotaKind::Requests => "request rate limit reached",
            QuotaKind::DailyMessages => "daily message limit reached",
            QuotaKind::AttachmentSize => "attachment too large",
            QuotaKind::AttachmentBytes => "daily attachment bandwidth reached",
            QuotaKind::AttachmentCount => "daily attachment count reached",
            QuotaKind::Subscriptions => "too many subscriptions",
        };
        f.write_str(s)
    }
}

/// Integer token bucket refilled one token per interval.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: u32,
    capacity: u32,
    refill_every_ms: u64,
    last_refill: u64,
}

impl TokenBucket {
    fn new(capacity: u32, refill_every: Duration, now: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_every_ms: duration_ms(refill_every),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: u64) {
        if self.refill_every_ms == 0 || self.tokens >= self.capacity {
            self.tokens = self.capacity;
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_sub(self.last_refill);
        let earned = elapsed / self.refill_every_ms;
        if earned > 0 {
            let earned_tokens = u32::try_from(earned).unwrap_or(u32::MAX);
            self.tokens = self.tokens.saturating_add(earned_tokens).min(self.capacity);
            self.last_refill += earned * self.refill_every_ms;
        }
    }

    fn can_take(&self, n: u32) -> bool {
        self.refill_every_ms == 0 || self.tokens >= n
    }

    fn take(&mut self, n: u32) {
        if self.refill_every_ms != 0 {
            self.tokens = self.tokens.saturating_sub(n);
        }
    }

    fn give_back(&mut self, n: u32) {
        if self.refill_every_ms != 0 {
            self.tokens = self.tokens.saturating_add(n).min(self.capacity);
        }
    }
}

#[derive(Debug)]
struct Counters {
    requests: TokenBucket,
    messages_today: u32,
    attachment_bytes_today: u64,
    attachments_today: u32,
    resets_at: u64,
    subscriptions: u32,
}

impl Counters {
    fn roll_over(&mut self, now: u64) {
        if now >= self.resets_at {
            self.messages_today = 0;
            self.attachment_bytes_today = 0;
            self.attachments_today = 0;
            self.resets_at = next_day_boundary(now);
        }
    }
}

/// Snapshot of a visitor's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisitorStats {
    pub requests_remaining: u32,
    pub messages_today: u32,
    pub messages_remaining: u32,
    pub attachment_bytes_today: u64,
    pub attachments_today: u32,
    pub subscriptions: u32,
    pub resets_at: u64,
}

/// A quota-tracked client.
#[derive(Debug)]
pub struct Visitor {
    id: VisitorId,
    quota: Quota,
    counters: Mutex<Counters>,
    last_seen: AtomicU64,
}

impl Visitor {
    /// Create a visitor with full buckets.
    #[must_use]
    pub fn new(id: VisitorId, quota: Quota, now: u64) -> Self {
        Self {
            id,
            counters: Mutex::new(Counters {
                requests: TokenBucket::new(quota.request_burst, quota.request_refill, now),
                messages_today: 0,
                attachment_bytes_today: 0,
                attachments_today: 0,
                resets_at: next_day_boundary(now),
                subscriptions: 0,
            }),
            quota,
            last_seen: AtomicU64::new(now),
        }
    }

    #[must_use]
    pub fn id(&self) -> &VisitorId {
        &self.id
    }

    #[must_use]
    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// Charge a single cost.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QuotaExceeded`] without charging anything.
    pub fn allow(&self, cost: CostKind, now: u64) -> Result<(), BrokerError> {
        self.allow_all(&[cost], now)
    }

    /// Charge several costs atomically: all of them or none.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QuotaExceeded`] naming the first limit hit.
    pub fn allow_all(&self, costs: &[CostKind], now: u64) -> Result<(), BrokerError> {
        self.touch(now);
        let mut c = self.counters.lock();
        c.requests.refill(now);
        c.roll_over(now);

        let q = &self.quota;
        let mut requests = 0u32;
        let mut messages = 0u32;
        let mut attachments = 0u32;
        let mut attachment_bytes = 0u64;
        let mut subscriptions = 0u32;
        for cost in costs {
            match *cost {
                CostKind::Request => requests += 1,
                CostKind::Message => messages += 1,
                CostKind::Attachment { bytes } => {
                    if bytes > q.attachment_file_size {
                        return Err(BrokerError::QuotaExceeded(QuotaKind::AttachmentSize));
                    }
                    attachments += 1;
                    attachment_bytes = attachment_bytes.saturating_add(bytes);
                }
                CostKind::Subscription => subscriptions += 1,
            }
        }

        if !c.requests.can_take(requests) {
            return Err(BrokerError::QuotaExceeded(QuotaKind::Requests));
        }
        if c.messages_today.saturating_add(messages) > q.daily_messages {
            return Err(BrokerError::QuotaExceeded(QuotaKind::DailyMessages));
        }
        if c.attachments_today.saturating_add(attachments) > q.attachment_daily_count {
            return Err(BrokerError::QuotaExceeded(QuotaKind::AttachmentCount));
        }
        if c.attachment_bytes_today.saturating_add(attachment_bytes) > q.attachment_daily_bytes {
            return Err(BrokerError::QuotaExceeded(QuotaKind::AttachmentBytes));
        }
        if c.subscriptions.saturating_add(subscriptions) > q.max_subscriptions {
            return Err(BrokerError::QuotaExceeded(QuotaKind::Subscriptions));
        }

        c.requests.take(requests);
        c.messages_today += messages;
        c.attachments_today += attachments;
        c.attachment_bytes_today += attachment_bytes;
        c.subscriptions += subscriptions;

        trace!(visitor = %self.id, ?costs, "Quota charged");
        Ok(())
    }

    /// Hand back costs charged by [`Visitor::allow_all`] for an operation
    /// rejected after the charge. Counters never drop below zero.
    pub fn refund(&self, costs: &[CostKind]) {
        let mut c = self.counters.lock();
        for cost in costs {
            match *cost {
                CostKind::Request => c.requests.give_back(1),
                CostKind::Message => c.messages_today = c.messages_today.saturating_sub(1),
                CostKind::Attachment { bytes } => {
                    c.attachments_today = c.attachments_today.saturating_sub(1);
                    c.attachment_bytes_today = c.attachment_bytes_today.saturating_sub(bytes);
                }
                CostKind::Subscription => c.subscriptions = c.subscriptions.saturating_sub(1),
            }
        }
        trace!(visitor = %self.id, ?costs, "Quota refunded");
    }

    /// Return a subscription slot. Never drops below zero.
    pub fn release_subscription(&self) {
        let mut c = self.counters.lock();
        c.subscriptions = c.subscriptions.saturating_sub(1);
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> u32 {
        self.counters.lock().subscriptions
    }

    /// Record activity.
    pub fn touch(&self, now: u64) {
        self.last_seen.fetch_max(now, Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_seen(&self) -> u64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    /// Counter snapshot with refills and resets applied as of `now`.
    #[must_use]
    pub fn stats(&self, now: u64) -> VisitorStats {
        let mut c = self.counters.lock();
        c.requests.refill(now);
        c.roll_over(now);
        VisitorStats {
            requests_remaining: c.requests.tokens,
            messages_today: c.messages_today,
            messages_remaining: self.quota.daily_messages.saturating_sub(c.messages_today),
            attachment_bytes_today: c.attachment_bytes_today,
            attachments_today: c.attachments_today,
            subscriptions: c.subscriptions,
            resets_at: c.resets_at,
        }
    }
}

/// All known visitors.
pub struct VisitorTable {
    visitors: DashMap<VisitorId, Arc<Visitor>>,
    config: QuotaConfig,
    clock: SharedClock,
}

impl VisitorTable {
    #[must_use]
    pub fn new(config: QuotaConfig, clock: SharedClock) -> Self {
        Self {
            visitors: DashMap::new(),
            config,
            clock,
        }
    }

    /// Get or create the visitor for a request identity.
    pub fn visitor(&self, identity: &Identity) -> Arc<Visitor> {
        let id = identity.visitor_id();
        let now = self.clock.now_ms();
        let visitor = self
            .visitors
            .entry(id.clone())
            .or_insert_with(|| {
                let quota = self.quota_for(&id, identity.class());
                debug!(visitor = %id, "New visitor");
                Arc::new(Visitor::new(id, quota, now))
            })
            .clone();
        visitor.touch(now);
        visitor
    }

    /// Look up a visitor without creating it.
    #[must_use]
    pub fn get(&self, id: &VisitorId) -> Option<Arc<Visitor>> {
        self.visitors.get(id).map(|v| v.clone())
    }

    fn quota_for(&self, id: &VisitorId, class: VisitorClass) -> Quota {
        let key = id.to_string();
        if self.config.exempt.iter().any(|e| *e == key) {
            return Quota::unlimited();
        }
        match class {
            VisitorClass::Anonymous => self.config.anonymous.clone(),
            VisitorClass::Authenticated => self.config.authenticated.clone(),
        }
    }

    /// Charge costs against a visitor at the current clock time.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QuotaExceeded`] if any limit is hit.
    pub fn allow(&self, visitor: &Visitor, costs: &[CostKind]) -> Result<(), BrokerError> {
        visitor.allow_all(costs, self.clock.now_ms())
    }

    /// Forget visitors idle past the TTL.
    ///
    /// A visitor with open subscriptions, or still referenced by an in-flight
    /// request, is never evicted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let ttl = duration_ms(self.config.visitor_ttl);
        let before = self.visitors.len();
        self.visitors.retain(|_, v| {
            let idle = now.saturating_sub(v.last_seen()) >= ttl;
            !(idle && v.subscriptions() == 0 && Arc::strong_count(v) == 1)
        });
        let evicted = before.saturating_sub(self.visitors.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.visitors.len(), "Evicted idle visitors");
        }
        evicted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, DAY_MS};
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> Identity {
        Identity::anonymous(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    fn quota(burst: u32, refill_secs: u64, daily: u32) -> Quota {
        Quota {
            request_burst: burst,
            request_refill: Duration::from_secs(refill_secs),
            daily_messages: daily,
            ..Quota::anonymous()
        }
    }

    #[test]
    fn test_burst_then_single_refill() {
        let v = Visitor::new(VisitorId::User("a".into()), quota(3, 5, 100), 1_000);

        for _ in 0..3 {
            assert!(v.allow(CostKind::Request, 1_000).is_ok());
        }
        let err = v.allow(CostKind::Request, 1_000).unwrap_err();
        assert!(matches!(err, BrokerError::QuotaExceeded(QuotaKind::Requests)));

        // One interval buys exactly one more request.
        assert!(v.allow(CostKind::Request, 6_000).is_ok());
        assert!(v.allow(CostKind::Request, 6_000).is_err());
    }

    #[test]
    fn test_refill_caps_at_burst() {
        let v = Visitor::new(VisitorId::User("a".into()), quota(2, 1, 100), 0);
        assert!(v.allow(CostKind::Request, 0).is_ok());
        assert!(v.allow(CostKind::Request, 0).is_ok());

        let stats = v.stats(3_600_000);
        assert_eq!(stats.requests_remaining, 2);
    }

    #[test]
    fn test_daily_message_cap_resets_at_midnight() {
        let start = 10 * DAY_MS + 1_000;
        let v = Visitor::new(VisitorId::User("a".into()), quota(1000, 0, 60), start);

        for _ in 0..60 {
            assert!(v.allow(CostKind::Message, start).is_ok());
        }
        let err = v.allow(CostKind::Message, start).unwrap_err();
        assert!(matches!(err, BrokerError::QuotaExceeded(QuotaKind::DailyMessages)));

        assert!(v.allow(CostKind::Message, 11 * DAY_MS).is_ok());
    }

    #[test]
    fn test_allow_all_is_atomic() {
        let v = Visitor::new(VisitorId::User("a".into()), quota(5, 5, 1), 0);
        assert!(v.allow(CostKind::Message, 0).is_ok());

        // Request would pass, message fails: the request token must not be spent.
        let before = v.stats(0).requests_remaining;
        assert!(v.allow_all(&[CostKind::Request, CostKind::Message], 0).is_err());
        assert_eq!(v.stats(0).requests_remaining, before);
    }

    #[test]
    fn test_refund_restores_charges() {
        let v = Visitor::new(VisitorId::User("a".into()), quota(2, 5, 1), 0);
        let costs = [
            CostKind::Request,
            CostKind::Message,
            CostKind::Attachment { bytes: 40 },
        ];
        v.allow_all(&costs, 0).unwrap();
        assert!(v.allow(CostKind::Message, 0).is_err());

        v.refund(&costs);
        let stats = v.stats(0);
        assert_eq!(stats.requests_remaining, 2);
        assert_eq!(stats.messages_today, 0);
        assert_eq!(stats.attachment_bytes_today, 0);
        assert_eq!(stats.attachments_today, 0);

        // A refund never overfills the bucket.
        v.refund(&[CostKind::Request]);
        assert_eq!(v.stats(0).requests_remaining, 2);
    }

    #[test]
    fn test_attachment_limits() {
        let q = Quota {
            attachment_file_size: 100,
            attachment_daily_bytes: 150,
            attachment_daily_count: 10,
            ..Quota::anonymous()
        };
        let v = Visitor::new(VisitorId::User("a".into()), q, 0);

        assert!(matches!(
            v.allow(CostKind::Attachment { bytes: 101 }, 0),
            Err(BrokerError::QuotaExceeded(QuotaKind::AttachmentSize))
        ));
        assert!(v.allow(CostKind::Attachment { bytes: 100 }, 0).is_ok());
        assert!(matches!(
            v.allow(CostKind::Attachment { bytes: 60 }, 0),
            Err(BrokerError::QuotaExceeded(QuotaKind::AttachmentBytes))
        ));
    }

    #[test]
    fn test_subscription_slots() {
        let q = Quota {
            max_subscriptions: 2,
            ..Quota::anonymous()
        };
        let v = Visitor::new(VisitorId::User("a".into()), q, 0);

        assert!(v.allow(CostKind::Subscription, 0).is_ok());
        assert!(v.allow(CostKind::Subscription, 0).is_ok());
        assert!(v.allow(CostKind::Subscription, 0).is_err());

        v.release_subscription();
        assert!(v.allow(CostKind::Subscription, 0).is_ok());

        for _ in 0..5 {
            v.release_subscription();
        }
        assert_eq!(v.subscriptions(), 0);
    }

    #[test]
    fn test_table_keys_by_principal() {
        let clock = Arc::new(ManualClock::new(0));
        let table = VisitorTable::new(QuotaConfig::default(), clock);

        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = table.visitor(&Identity::user(addr, "alice"));
        let b = table.visitor(&Identity::user(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), "alice"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.quota(), &Quota::authenticated());

        let anon = table.visitor(&Identity::anonymous(addr));
        assert_eq!(anon.quota(), &Quota::anonymous());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_exempt_visitor_unlimited() {
        let clock = Arc::new(ManualClock::new(0));
        let config = QuotaConfig {
            exempt: vec!["ip:10.0.0.9".to_string()],
            ..QuotaConfig::default()
        };
        let table = VisitorTable::new(config, clock);

        let v = table.visitor(&ip(9));
        for _ in 0..10_000 {
            assert!(table.allow(&v, &[CostKind::Request]).is_ok());
        }
    }

    #[test]
    fn test_sweep_spares_subscribed_visitors() {
        let clock = Arc::new(ManualClock::new(0));
        let config = QuotaConfig {
            visitor_ttl: Duration::from_secs(60),
            ..QuotaConfig::default()
        };
        let table = VisitorTable::new(config, clock.clone());

        let busy = table.visitor(&ip(1));
        table.allow(&busy, &[CostKind::Subscription]).unwrap();
        drop(busy);
        let idle = table.visitor(&ip(2));
        drop(idle);
        let held = table.visitor(&ip(3));

        clock.advance(Duration::from_secs(61));
        assert_eq!(table.sweep(), 1);
        assert!(table.get(&ip(1).visitor_id()).is_some());
        assert!(table.get(&ip(2).visitor_id()).is_none());
        assert!(table.get(&ip(3).visitor_id()).is_some());
        drop(held);
    }
}
