//! Event types for the Tidings subscriber protocol.
//!
//! Every line, SSE frame or WebSocket message a subscriber receives is one
//! [`Event`]. Only `message` events carry notification content; the others
//! are connection bookkeeping.

use serde::{Deserialize, Serialize};

/// Event kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Subscription is established; sent first on every stream.
    Open,
    /// Periodic liveness signal on idle streams.
    Keepalive,
    /// A published notification.
    Message,
    /// The broker closed the stream (see `message` for the reason).
    Close,
}

impl EventKind {
    /// Name used for the SSE `event:` field.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Open => "open",
            EventKind::Keepalive => "keepalive",
            EventKind::Message => "message",
            EventKind::Close => "close",
        }
    }
}

/// Attachment metadata as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    /// File name shown to the user.
    pub name: String,
    /// Where the attachment can be downloaded.
    pub url: String,
    /// Size in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Unix milliseconds after which the URL may stop working.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

/// A single subscriber-facing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Message id; only present on `message` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Unix milliseconds.
    pub time: u64,
    /// Event kind.
    pub event: EventKind,
    /// Topic the event belongs to.
    pub topic: String,
    /// Message body, or close reason for `close` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Priority 1 (min) to 5 (urgent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Click-action URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentInfo>,
    /// Unix milliseconds after which the message is no longer replayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

impl Event {
    fn bare(kind: EventKind, topic: impl Into<String>, time: u64) -> Self {
        Self {
            id: None,
            time,
            event: kind,
            topic: topic.into(),
            message: None,
            title: None,
            priority: None,
            tags: Vec::new(),
            click: None,
            attachment: None,
            expires: None,
        }
    }

    /// Create an `open` event.
    #[must_use]
    pub fn open(topic: impl Into<String>, time: u64) -> Self {
        Self::bare(EventKind::Open, topic, time)
    }

    /// Create a `keepalive` event.
    #[must_use]
    pub fn keepalive(topic: impl Into<String>, time: u64) -> Self {
        Self::bare(EventKind::Keepalive, topic, time)
    }

    /// Create a `close` event carrying the reason.
    #[must_use]
    pub fn close(topic: impl Into<String>, time: u64, reason: impl Into<String>) -> Self {
        let mut event = Self::bare(EventKind::Close, topic, time);
        event.message = Some(reason.into());
        event
    }

    /// Create a `message` event with only a body set.
    #[must_use]
    pub fn message(id: u64, topic: impl Into<String>, time: u64, body: impl Into<String>) -> Self {
        let mut event = Self::bare(EventKind::Message, topic, time);
        event.id = Some(id);
        event.message = Some(body.into());
        event
    }

    /// Whether this event carries notification content.
    #[must_use]
    pub fn is_message(&self) -> bool {
        self.event == EventKind::Message
    }
}
