//! Message types for Tidings.
//!
//! A [`Message`] is immutable once the dispatcher has assigned its id and
//! timestamp; it is shared between the cache, persistence writer and every
//! subscriber queue behind an `Arc`.

use crate::clock::duration_ms;
use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tidings_protocol::{AttachmentInfo, Event, EventKind};

/// A message identifier. Strictly increasing within a topic, never reused.
pub type MessageId = u64;

/// Maximum title length in bytes.
pub const MAX_TITLE_LENGTH: usize = 256;

/// Maximum number of tags on one message.
pub const MAX_TAGS: usize = 16;

/// Maximum length of a single tag.
pub const MAX_TAG_LENGTH: usize = 64;

/// Maximum length of click and attachment URLs.
pub const MAX_URL_LENGTH: usize = 2048;

/// Message priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Priority {
    Min = 1,
    Low = 2,
    #[default]
    Default = 3,
    High = 4,
    Urgent = 5,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Min),
            2 => Ok(Priority::Low),
            3 => Ok(Priority::Default),
            4 => Ok(Priority::High),
            5 => Ok(Priority::Urgent),
            _ => Err("Priority must be between 1 and 5"),
        }
    }
}

impl FromStr for Priority {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "min" => Ok(Priority::Min),
            "2" | "low" => Ok(Priority::Low),
            "3" | "default" => Ok(Priority::Default),
            "4" | "high" => Ok(Priority::High),
            "5" | "urgent" | "max" => Ok(Priority::Urgent),
            _ => Err("Unknown priority"),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Min => "min",
            Priority::Low => "low",
            Priority::Default => "default",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

/// Attachment descriptor. The broker never stores file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
    /// Unix milliseconds.
    #[serde(default)]
    pub expires: Option<u64>,
}

impl Attachment {
    /// Create an attachment, naming it after the last URL path segment.
    #[must_use]
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("attachment")
            .to_string();
        Self {
            name,
            url,
            size: None,
            expires: None,
        }
    }

    /// Declared size in bytes, charged against attachment quotas.
    #[must_use]
    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size = Some(bytes);
        self
    }
}

/// A stored notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Publish time in Unix milliseconds.
    pub time: u64,
    pub topic: String,
    #[serde(default)]
    pub title: Option<String>,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub click: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    /// Unix milliseconds after which the message is not replayed.
    #[serde(default)]
    pub expires: Option<u64>,
}

impl Message {
    /// Create a message with only a body (defaults elsewhere).
    #[must_use]
    pub fn new(id: MessageId, topic: impl Into<String>, time: u64, body: impl Into<String>) -> Self {
        Self {
            id,
            time,
            topic: topic.into(),
            title: None,
            body: body.into(),
            priority: Priority::Default,
            tags: Vec::new(),
            click: None,
            attachment: None,
            expires: None,
        }
    }

    /// Whether the message's own expiry has passed.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires.is_some_and(|e| e <= now_ms)
    }

    /// Whether the message carries the given tag (case-insensitive).
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Convert to the subscriber-facing wire event.
    #[must_use]
    pub fn to_event(&self) -> Event {
        Event {
            id: Some(self.id),
            time: self.time,
            event: EventKind::Message,
            topic: self.topic.clone(),
            message: Some(self.body.clone()),
            title: self.title.clone(),
            priority: (self.priority != Priority::Default).then(|| self.priority.into()),
            tags: self.tags.clone(),
            click: self.click.clone(),
            attachment: self.attachment.as_ref().map(|a| AttachmentInfo {
                name: a.name.clone(),
                url: a.url.clone(),
                size: a.size,
                expires: a.expires,
            }),
            expires: self.expires,
        }
    }
}

/// Replay cursor requested at subscribe or poll time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cursor {
    /// No backlog; live messages only.
    #[default]
    None,
    /// Everything still retained.
    All,
    /// Only the newest retained message.
    Latest,
    /// Messages with an id strictly greater than this one.
    After(MessageId),
    /// Messages published at or after this Unix millisecond.
    Since(u64),
}

impl Cursor {
    /// Parse a cursor from its query-string form.
    ///
    /// Accepted forms: `none`, `all`, `latest`, a message id (`1234`), a Unix
    /// timestamp in seconds prefixed with `@` (`@1700000000`), or a duration
    /// relative to `now_ms` (`10m`, `2h`, `1d`).
    ///
    /// # Errors
    ///
    /// Returns a validation error for anything else.
    pub fn parse(s: &str, now_ms: u64) -> Result<Self, BrokerError> {
        let s = s.trim();
        match s {
            "" | "none" => return Ok(Cursor::None),
            "all" => return Ok(Cursor::All),
            "latest" => return Ok(Cursor::Latest),
            _ => {}
        }
        if let Ok(id) = s.parse::<MessageId>() {
            return Ok(Cursor::After(id));
        }
        if let Some(secs) = s.strip_prefix('@') {
            let secs: u64 = secs
                .parse()
                .map_err(|_| BrokerError::validation(format!("invalid since timestamp: {s}")))?;
            return Ok(Cursor::Since(secs.saturating_mul(1000)));
        }
        let ago = humantime::parse_duration(s)
            .map_err(|_| BrokerError::validation(format!("invalid since value: {s}")))?;
        Ok(Cursor::Since(now_ms.saturating_sub(duration_ms(ago))))
    }

    /// Whether a message lies after the cursor. `Latest` and `All` admit
    /// everything; `None` admits nothing.
    #[must_use]
    pub fn admits(&self, message: &Message) -> bool {
        match *self {
            Cursor::None => false,
            Cursor::All | Cursor::Latest => true,
            Cursor::After(id) => message.id > id,
            Cursor::Since(time) => message.time >= time,
        }
    }
}

/// A publish request before id/time assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub topic: String,
    pub body: String,
    pub title: Option<String>,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
    pub click: Option<String>,
    pub attachment: Option<Attachment>,
    /// Relative expiry; the message stops being replayed after this.
    pub ttl: Option<Duration>,
    /// Whether to admit the message to the cache for replay.
    pub cache: bool,
    /// Per-message push override; `Some(false)` suppresses the push relay.
    pub push: Option<bool>,
}

impl PublishRequest {
    /// Create a request with defaults.
    #[must_use]
    pub fn new(topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            body: body.into(),
            title: None,
            priority: None,
            tags: Vec::new(),
            click: None,
            attachment: None,
            ttl: None,
            cache: true,
            push: None,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_click(mut self, url: impl Into<String>) -> Self {
        self.click = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Skip the cache; the message is delivered live only.
    #[must_use]
    pub fn uncached(mut self) -> Self {
        self.cache = false;
        self
    }

    #[must_use]
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = Some(push);
        self
    }

    /// Approximate payload size counted against the message size limit.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.body.len()
            + self.title.as_ref().map_or(0, String::len)
            + self.tags.iter().map(String::len).sum::<usize>()
            + self.click.as_ref().map_or(0, String::len)
    }

    /// Check every field. Runs before any state changes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Validation`] describing the first problem found.
    pub fn validate(&self, max_message_size: usize) -> Result<(), BrokerError> {
        crate::topic::validate_topic_name(&self.topic).map_err(BrokerError::validation)?;

        if self.body.trim().is_empty() && self.attachment.is_none() {
            return Err(BrokerError::validation("message body is empty"));
        }
        if self.payload_size() > max_message_size {
            return Err(BrokerError::validation(format!(
                "message too large: {} bytes (max {max_message_size})",
                self.payload_size()
            )));
        }
        if let Some(title) = &self.title {
            if title.len() > MAX_TITLE_LENGTH {
                return Err(BrokerError::validation("title too long"));
            }
            if title.chars().any(char::is_control) {
                return Err(BrokerError::validation("title contains control characters"));
            }
        }
        if self.tags.len() > MAX_TAGS {
            return Err(BrokerError::validation(format!("too many tags (max {MAX_TAGS})")));
        }
        for tag in &self.tags {
            if tag.is_empty() || tag.len() > MAX_TAG_LENGTH {
                return Err(BrokerError::validation(format!("invalid tag length: {tag:?}")));
            }
            if tag.contains(',') || tag.chars().any(char::is_control) {
                return Err(BrokerError::validation(format!("invalid tag: {tag:?}")));
            }
        }
        if let Some(click) = &self.click {
            validate_url(click, true)?;
        }
        if let Some(attachment) = &self.attachment {
            validate_url(&attachment.url, false)?;
            if attachment.name.trim().is_empty() {
                return Err(BrokerError::validation("attachment name is empty"));
            }
            if attachment.size.is_none() {
                return Err(BrokerError::validation("attachment size is required"));
            }
        }
        if self.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(BrokerError::validation("expiry must be in the future"));
        }
        Ok(())
    }

    /// Freeze into a stored message.
    #[must_use]
    pub fn into_message(self, id: MessageId, time: u64) -> Message {
        Message {
            id,
            time,
            expires: self.ttl.map(|ttl| time.saturating_add(duration_ms(ttl))),
            topic: self.topic,
            title: self.title.filter(|t| !t.is_empty()),
            body: self.body,
            priority: self.priority.unwrap_or_default(),
            tags: self.tags,
            click: self.click,
            attachment: self.attachment,
        }
    }
}

pub(crate) fn validate_url(url: &str, allow_mailto: bool) -> Result<(), BrokerError> {
    if url.len() > MAX_URL_LENGTH {
        return Err(BrokerError::validation("URL too long"));
    }
    let ok = url.starts_with("https://")
        || url.starts_with("http://")
        || (allow_mailto && url.starts_with("mailto:"));
    if !ok || url.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(BrokerError::validation(format!("invalid URL: {url}")));
    }
    Ok(())
}
