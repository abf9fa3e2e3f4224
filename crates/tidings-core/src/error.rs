//! Broker error taxonomy.

use crate::auth::Action;
use crate::persistence::PersistenceError;
use crate::visitor::QuotaKind;
use thiserror::Error;

/// Errors surfaced by broker operations.
///
/// Validation, quota and permission failures are detected before any state
/// changes. Push relay failures never appear here; they are logged by the
/// dispatcher and dropped.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed or oversized request.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A visitor limit was hit; callers should back off.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(QuotaKind),

    /// The auth collaborator denied the action.
    #[error("Permission denied: cannot {action} topic {topic}")]
    PermissionDenied {
        /// Topic the action targeted.
        topic: String,
        /// Denied action.
        action: Action,
    },

    /// The registry is full.
    #[error("Topic capacity exceeded (max {0})")]
    TopicCapacityExceeded(usize),

    /// A push endpoint limit was reached, per topic or broker-wide.
    #[error("Push endpoint capacity exceeded (max {0})")]
    PushCapacityExceeded(usize),

    /// Topic does not exist.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Subscription filter could not be built.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Durable write or read failed (fatal only in strict mode).
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// The broker no longer accepts work.
    #[error("Broker is shutting down")]
    ShuttingDown,
}

impl BrokerError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the caller should retry later with backoff.
    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded(_))
    }

    /// HTTP-style status code for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::InvalidFilter(_) => 400,
            Self::PermissionDenied { .. } => 403,
            Self::TopicNotFound(_) => 404,
            Self::QuotaExceeded(_) => 429,
            Self::Persistence(_) => 500,
            Self::ShuttingDown => 503,
            Self::TopicCapacityExceeded(_) | Self::PushCapacityExceeded(_) => 507,
        }
    }
}
