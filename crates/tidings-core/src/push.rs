//! Push relay collaborator.
//!
//! Topics may have push endpoints registered (mobile gateways, webhooks).
//! After a publish the broker hands a short summary to the [`PushRelay`] on a
//! spawned task; relay failures are logged and never reach the publisher.

use crate::error::BrokerError;
use crate::message::{Message, MessageId, Priority};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::info;

/// Longest body excerpt forwarded to a relay.
pub const MAX_SUMMARY_BODY: usize = 512;

/// Push relay errors.
#[derive(Debug, Error)]
pub enum PushRelayError {
    #[error("Push target rejected: {0}")]
    Rejected(String),

    #[error("Push relay unavailable: {0}")]
    Unavailable(String),
}

/// The part of a message a push target receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: MessageId,
    pub topic: String,
    pub time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click: Option<String>,
}

impl MessageSummary {
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        Self {
            id: message.id,
            topic: message.topic.clone(),
            time: message.time,
            title: message.title.clone(),
            body: truncate(&message.body, MAX_SUMMARY_BODY),
            priority: message.priority.into(),
            tags: message.tags.clone(),
            click: message.click.clone(),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Delivers summaries to push targets.
#[async_trait]
pub trait PushRelay: Send + Sync {
    /// Notify every target. Called off the publish path.
    async fn notify(&self, targets: &[String], summary: &MessageSummary)
        -> Result<(), PushRelayError>;
}

/// A relay that only logs. Useful when no gateway is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRelay;

#[async_trait]
impl PushRelay for LogRelay {
    async fn notify(
        &self,
        targets: &[String],
        summary: &MessageSummary,
    ) -> Result<(), PushRelayError> {
        info!(
            topic = %summary.topic,
            id = summary.id,
            targets = targets.len(),
            "Push notification"
        );
        Ok(())
    }
}

/// When a publish triggers a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum PushPolicy {
    #[default]
    Always,
    /// Only when no live subscriber received the message.
    NoSubscribersOnly,
    /// Only at or above a priority.
    PriorityThreshold { min: Priority },
}

impl PushPolicy {
    /// Decide for one message. `override_push` is the publisher's explicit
    /// choice, which can only disable a push.
    #[must_use]
    pub fn should_push(&self, message: &Message, live_deliveries: usize, override_push: Option<bool>) -> bool {
        if override_push == Some(false) {
            return false;
        }
        match self {
            PushPolicy::Always => true,
            PushPolicy::NoSubscribersOnly => live_deliveries == 0,
            PushPolicy::PriorityThreshold { min } => message.priority >= *min,
        }
    }
}

/// Bounds on the push registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushLimits {
    /// Endpoints one topic may carry.
    pub per_topic: usize,
    /// Endpoints across all topics.
    pub total: usize,
}

impl Default for PushLimits {
    fn default() -> Self {
        Self {
            per_topic: 50,
            total: 10_000,
        }
    }
}

/// Push endpoints registered per topic.
#[derive(Debug, Default)]
pub struct PushRegistry {
    targets: DashMap<String, BTreeSet<String>>,
    limits: PushLimits,
    total: AtomicUsize,
}

impl PushRegistry {
    #[must_use]
    pub fn new(limits: PushLimits) -> Self {
        Self {
            targets: DashMap::new(),
            limits,
            total: AtomicUsize::new(0),
        }
    }

    /// Add an endpoint. Returns `false` if it was already registered.
    ///
    /// # Errors
    ///
    /// [`BrokerError::PushCapacityExceeded`] when the topic or the registry
    /// is full. Nothing is added in that case.
    pub fn register(&self, topic: &str, endpoint: &str) -> Result<bool, BrokerError> {
        let outcome = {
            let mut set = self.targets.entry(topic.to_string()).or_default();
            if set.contains(endpoint) {
                Ok(false)
            } else if set.len() >= self.limits.per_topic {
                Err(BrokerError::PushCapacityExceeded(self.limits.per_topic))
            } else if !self.reserve() {
                Err(BrokerError::PushCapacityExceeded(self.limits.total))
            } else {
                set.insert(endpoint.to_string());
                Ok(true)
            }
        };
        if outcome.is_err() {
            self.targets.remove_if(topic, |_, set| set.is_empty());
        }
        outcome
    }

    fn reserve(&self) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limits.total).then_some(n + 1)
            })
            .is_ok()
    }

    /// Remove an endpoint. Returns whether it was registered.
    pub fn unregister(&self, topic: &str, endpoint: &str) -> bool {
        let removed = self
            .targets
            .get_mut(topic)
            .is_some_and(|mut set| set.remove(endpoint));
        if removed {
            self.total.fetch_sub(1, Ordering::AcqRel);
        }
        self.targets.remove_if(topic, |_, set| set.is_empty());
        removed
    }

    #[must_use]
    pub fn targets(&self, topic: &str) -> Vec<String> {
        self.targets
            .get(topic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_targets(&self, topic: &str) -> bool {
        self.targets.contains_key(topic)
    }

    /// Total registered endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
