//! Durable message storage collaborator.
//!
//! The broker never assumes a particular backend. It writes through a
//! [`Persistence`] implementation and reads from it when a replay cursor
//! reaches further back than the in-memory window.

use crate::message::{Cursor, Message, MessageId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Persistence errors.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// Backend cannot be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// A write was rejected.
    #[error("Write failed: {0}")]
    Write(String),

    /// A query failed.
    #[error("Query failed: {0}")]
    Query(String),
}

/// A durable message log.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store one message.
    async fn append(&self, message: &Message) -> Result<(), PersistenceError>;

    /// Store several messages. The default appends them one at a time.
    async fn append_batch(&self, messages: &[Arc<Message>]) -> Result<(), PersistenceError> {
        for message in messages {
            self.append(message).await?;
        }
        Ok(())
    }

    /// Messages of a topic matching a cursor, ordered by id.
    async fn query_since(&self, topic: &str, cursor: Cursor)
        -> Result<Vec<Message>, PersistenceError>;

    /// Delete messages of a topic published before `cutoff_ms`. Returns the
    /// number removed.
    async fn prune(&self, topic: &str, cutoff_ms: u64) -> Result<usize, PersistenceError>;

    /// Topics with at least one stored message.
    async fn topics(&self) -> Result<Vec<String>, PersistenceError>;

    /// Highest id ever stored, if any.
    async fn high_water_mark(&self) -> Result<Option<MessageId>, PersistenceError>;
}

/// Process-local persistence, mostly for tests and single-node setups
/// without a disk backend.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    topics: RwLock<HashMap<String, BTreeMap<MessageId, Message>>>,
    failing: AtomicBool,
}

impl MemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored messages across all topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.read().values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PersistenceError::Unavailable("memory backend set to fail".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn append(&self, message: &Message) -> Result<(), PersistenceError> {
        self.check()?;
        self.topics
            .write()
            .entry(message.topic.clone())
            .or_default()
            .insert(message.id, message.clone());
        Ok(())
    }

    async fn query_since(
        &self,
        topic: &str,
        cursor: Cursor,
    ) -> Result<Vec<Message>, PersistenceError> {
        self.check()?;
        let topics = self.topics.read();
        let Some(log) = topics.get(topic) else {
            return Ok(Vec::new());
        };
        let result = match cursor {
            Cursor::None => Vec::new(),
            Cursor::Latest => log.values().next_back().cloned().into_iter().collect(),
            Cursor::All | Cursor::Since(_) => {
                log.values().filter(|m| cursor.admits(m)).cloned().collect()
            }
            Cursor::After(id) => log
                .range(id.saturating_add(1)..)
                .map(|(_, m)| m.clone())
                .collect(),
        };
        Ok(result)
    }

    async fn prune(&self, topic: &str, cutoff_ms: u64) -> Result<usize, PersistenceError> {
        self.check()?;
        let mut topics = self.topics.write();
        let Some(log) = topics.get_mut(topic) else {
            return Ok(0);
        };
        let before = log.len();
        log.retain(|_, m| m.time >= cutoff_ms);
        let removed = before - log.len();
        if log.is_empty() {
            topics.remove(topic);
        }
        Ok(removed)
    }

    async fn topics(&self) -> Result<Vec<String>, PersistenceError> {
        self.check()?;
        Ok(self.topics.read().keys().cloned().collect())
    }

    async fn high_water_mark(&self) -> Result<Option<MessageId>, PersistenceError> {
        self.check()?;
        Ok(self
            .topics
            .read()
            .values()
            .filter_map(|log| log.keys().next_back().copied())
            .max())
    }
}
