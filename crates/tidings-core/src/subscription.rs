//! Live subscriptions.
//!
//! A subscription has two halves:
//!
//! - a [`Slot`], shared with the topic, into which fan-out offers messages;
//! - a [`Subscription`] handle, owned by the single drain path (one
//!   connection task), which reads the slot and any replayed backlog.
//!
//! Dropping the handle on any exit path unregisters it: the slot leaves the
//! topic, the visitor's subscription quota is returned and the state becomes
//! `Closed`.

use crate::clock::SharedClock;
use crate::filter::Filter;
use crate::message::{Message, MessageId};
use crate::topic::Topic;
use crate::visitor::Visitor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// How the client receives messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Long-lived stream (NDJSON, SSE, WebSocket).
    Stream,
    /// Held request answered by the first message.
    LongPoll,
    /// One-shot backlog read.
    Poll,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stream => "stream",
            TransportKind::LongPoll => "long_poll",
            TransportKind::Poll => "poll",
        }
    }
}

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlowConsumerPolicy {
    /// Discard the oldest queued message and keep going.
    #[default]
    DropOldest,
    /// Close the subscription.
    Close,
}

/// Why a subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unsubscribed,
    SlowConsumer,
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Unsubscribed => "unsubscribed",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered, backlog not yet loaded. Live messages are already queued.
    Connecting,
    Active,
    /// No new messages accepted; queued ones may still be read.
    Draining,
    /// Terminal.
    Closed,
}

/// Result of offering a message to one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Filter did not match.
    Filtered,
    /// Queued after discarding the oldest entry.
    Dropped,
    /// Queue overflowed under the close policy; the subscription is now
    /// draining.
    SlowConsumer,
    /// Subscription is no longer accepting.
    Closed,
}

#[derive(Debug)]
struct SlotQueue {
    items: VecDeque<Arc<Message>>,
    state: SubscriptionState,
    reason: Option<CloseReason>,
}

/// The topic-side half of a subscription.
#[derive(Debug)]
pub struct Slot {
    id: u64,
    filter: Filter,
    capacity: usize,
    policy: SlowConsumerPolicy,
    queue: Mutex<SlotQueue>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Slot {
    pub(crate) fn new(id: u64, filter: Filter, capacity: usize, policy: SlowConsumerPolicy) -> Self {
        Self {
            id,
            filter,
            capacity: capacity.max(1),
            policy,
            queue: Mutex::new(SlotQueue {
                items: VecDeque::new(),
                state: SubscriptionState::Connecting,
                reason: None,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Queue a message if the filter matches. Never blocks on the consumer.
    pub(crate) fn offer(&self, message: &Arc<Message>) -> Offer {
        if !self.filter.matches(message) {
            return Offer::Filtered;
        }

        let mut q = self.queue.lock();
        if matches!(q.state, SubscriptionState::Draining | SubscriptionState::Closed) {
            return Offer::Closed;
        }

        let outcome = if q.items.len() < self.capacity {
            q.items.push_back(Arc::clone(message));
            Offer::Queued
        } else {
            match self.policy {
                SlowConsumerPolicy::DropOldest => {
                    q.items.pop_front();
                    q.items.push_back(Arc::clone(message));
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Offer::Dropped
                }
                SlowConsumerPolicy::Close => {
                    q.items.clear();
                    q.state = SubscriptionState::Draining;
                    q.reason = Some(CloseReason::SlowConsumer);
                    debug!(subscription = self.id, "Closing slow consumer");
                    Offer::SlowConsumer
                }
            }
        };
        drop(q);
        self.notify.notify_one();
        outcome
    }

    pub(crate) fn activate(&self) {
        let mut q = self.queue.lock();
        if q.state == SubscriptionState::Connecting {
            q.state = SubscriptionState::Active;
        }
    }

    /// Stop accepting messages. Already queued messages remain readable.
    pub(crate) fn close(&self, reason: CloseReason) {
        let mut q = self.queue.lock();
        if matches!(q.state, SubscriptionState::Connecting | SubscriptionState::Active) {
            q.state = SubscriptionState::Draining;
            q.reason.get_or_insert(reason);
        }
        drop(q);
        self.notify.notify_one();
    }

    fn finish(&self, reason: CloseReason) {
        let mut q = self.queue.lock();
        q.items.clear();
        q.state = SubscriptionState::Closed;
        q.reason.get_or_insert(reason);
    }

    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.queue.lock().state
    }

    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.queue.lock().reason
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.lock().items.len()
    }
}

enum Next {
    Message(Arc<Message>),
    Empty,
    Closed,
}

/// The consumer-side handle of a subscription.
pub struct Subscription {
    slot: Arc<Slot>,
    topic: Arc<Topic>,
    visitor: Option<Arc<Visitor>>,
    kind: TransportKind,
    backlog: VecDeque<Arc<Message>>,
    last_id: Option<MessageId>,
    clock: SharedClock,
}

impl Subscription {
    pub(crate) fn new(
        slot: Arc<Slot>,
        topic: Arc<Topic>,
        visitor: Option<Arc<Visitor>>,
        kind: TransportKind,
        clock: SharedClock,
    ) -> Self {
        Self {
            slot,
            topic,
            visitor,
            kind,
            backlog: VecDeque::new(),
            last_id: None,
            clock,
        }
    }

    pub(crate) fn set_backlog(&mut self, backlog: Vec<Arc<Message>>) {
        self.backlog = backlog.into();
    }

    pub(crate) fn activate(&self) {
        self.slot.activate();
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.name()
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.slot.state()
    }

    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.slot.close_reason()
    }

    /// Messages discarded by the drop-oldest policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.slot.dropped()
    }

    /// Backlog messages not yet read.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Next message: backlog and live queue merged in id order, each id
    /// delivered at most once.
    fn next_ready(&mut self) -> Next {
        loop {
            let next = {
                let mut q = self.slot.queue.lock();
                let live_head = q.items.front().map(|m| m.id);
                match (self.backlog.front().map(|m| m.id), live_head) {
                    (Some(b), Some(l)) if l < b => q.items.pop_front(),
                    (Some(b), Some(l)) if l == b => {
                        q.items.pop_front();
                        self.backlog.pop_front()
                    }
                    (Some(_), _) => self.backlog.pop_front(),
                    (None, Some(_)) => q.items.pop_front(),
                    (None, None) => {
                        return match q.state {
                            SubscriptionState::Draining | SubscriptionState::Closed => Next::Closed,
                            _ => Next::Empty,
                        };
                    }
                }
            };
            let Some(message) = next else {
                continue;
            };
            if self.last_id.is_some_and(|last| message.id <= last) {
                continue;
            }
            self.last_id = Some(message.id);
            return Next::Message(message);
        }
    }

    /// Wait for the next message. Returns `None` once the subscription is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        loop {
            match self.next_ready() {
                Next::Message(message) => return Some(message),
                Next::Closed => return None,
                Next::Empty => self.slot.notify.notified().await,
            }
        }
    }

    /// Next message if one is ready.
    pub fn try_recv(&mut self) -> Option<Arc<Message>> {
        match self.next_ready() {
            Next::Message(message) => Some(message),
            Next::Empty | Next::Closed => None,
        }
    }

    /// Everything ready right now.
    pub fn drain_ready(&mut self) -> Vec<Arc<Message>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Explicitly unsubscribe.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.slot.id)
            .field("topic", &self.topic.name())
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.topic.remove_subscriber(self.slot.id);
        if let Some(visitor) = &self.visitor {
            visitor.release_subscription();
        }
        self.slot.finish(CloseReason::Unsubscribed);
        self.topic.touch(self.clock.now_ms());
        debug!(
            subscription = self.slot.id,
            topic = %self.topic.name(),
            reason = ?self.slot.close_reason(),
            "Unregistered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: u64) -> Arc<Message> {
        Arc::new(Message::new(id, "t", 0, format!("m{id}")))
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let slot = Slot::new(1, Filter::Any, 2, SlowConsumerPolicy::DropOldest);
        assert_eq!(slot.offer(&msg(1)), Offer::Queued);
        assert_eq!(slot.offer(&msg(2)), Offer::Queued);
        assert_eq!(slot.offer(&msg(3)), Offer::Dropped);
        assert_eq!(slot.queued(), 2);
        assert_eq!(slot.dropped(), 1);
    }

    #[test]
    fn test_close_policy_drains_and_closes() {
        let slot = Slot::new(1, Filter::Any, 1, SlowConsumerPolicy::Close);
        assert_eq!(slot.offer(&msg(1)), Offer::Queued);
        assert_eq!(slot.offer(&msg(2)), Offer::SlowConsumer);
        assert_eq!(slot.state(), SubscriptionState::Draining);
        assert_eq!(slot.close_reason(), Some(CloseReason::SlowConsumer));
        assert_eq!(slot.offer(&msg(3)), Offer::Closed);
        assert_eq!(slot.queued(), 0);
    }

    #[test]
    fn test_filtered_offer() {
        let slot = Slot::new(1, Filter::IdIs(5), 4, SlowConsumerPolicy::DropOldest);
        assert_eq!(slot.offer(&msg(4)), Offer::Filtered);
        assert_eq!(slot.offer(&msg(5)), Offer::Queued);
    }

    #[test]
    fn test_close_keeps_queued_until_read() {
        let slot = Slot::new(1, Filter::Any, 4, SlowConsumerPolicy::DropOldest);
        slot.activate();
        slot.offer(&msg(1));
        slot.close(CloseReason::Shutdown);
        assert_eq!(slot.queued(), 1);
        assert_eq!(slot.close_reason(), Some(CloseReason::Shutdown));
        slot.finish(CloseReason::Unsubscribed);
        assert_eq!(slot.state(), SubscriptionState::Closed);
        // The first reason sticks.
        assert_eq!(slot.close_reason(), Some(CloseReason::Shutdown));
    }
}
