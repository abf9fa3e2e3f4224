//! Topic access control.
//!
//! The broker asks an [`Authorizer`] before every publish (write) and
//! subscribe (read). The deployment picks the implementation: [`AllowAll`]
//! for open instances, [`AccessControlList`] for pattern-based rules.

use crate::visitor::VisitorId;
use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::trace;

/// What a visitor wants to do with a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Read,
    Write,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Read => f.write_str("read"),
            Action::Write => f.write_str("write"),
        }
    }
}

/// Authorization verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Allow,
    Deny,
}

impl Permission {
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Permission::Allow)
    }
}

/// Decides whether a visitor may act on a topic.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Check one action. Implementations must not block the runtime.
    async fn check_permission(&self, visitor: &VisitorId, topic: &str, action: Action)
        -> Permission;
}

/// Permits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn check_permission(&self, _: &VisitorId, _: &str, _: Action) -> Permission {
        Permission::Allow
    }
}

/// Access level granted by an ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Access {
    ReadWrite,
    ReadOnly,
    WriteOnly,
    DenyAll,
}

impl Access {
    #[must_use]
    pub fn permits(self, action: Action) -> bool {
        matches!(
            (self, action),
            (Access::ReadWrite, _) | (Access::ReadOnly, Action::Read) | (Access::WriteOnly, Action::Write)
        )
    }
}

impl FromStr for Access {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read-write" | "rw" => Ok(Access::ReadWrite),
            "read-only" | "ro" | "read" => Ok(Access::ReadOnly),
            "write-only" | "wo" | "write" => Ok(Access::WriteOnly),
            "deny-all" | "deny" | "none" => Ok(Access::DenyAll),
            other => Err(AclError::InvalidAccess(other.to_string())),
        }
    }
}

/// ACL construction errors.
#[derive(Debug, Error)]
pub enum AclError {
    #[error("Invalid topic pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid access level: {0}")]
    InvalidAccess(String),
}

#[derive(Debug, Clone)]
struct AclEntry {
    /// `None` applies to everyone.
    user: Option<String>,
    pattern: String,
    matcher: GlobMatcher,
    access: Access,
}

/// Pattern-based access rules.
///
/// Entries naming the visitor's principal are checked first, then entries
/// for everyone, then the default. Within each group the first matching
/// pattern wins.
#[derive(Debug, Clone)]
pub struct AccessControlList {
    default: Access,
    entries: Vec<AclEntry>,
}

impl AccessControlList {
    /// An ACL with only a default.
    #[must_use]
    pub fn new(default: Access) -> Self {
        Self {
            default,
            entries: Vec::new(),
        }
    }

    /// Add a rule. `user` of `None` (or `"*"`) applies to everyone.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic pattern is not a valid glob.
    pub fn grant(
        mut self,
        user: Option<&str>,
        pattern: &str,
        access: Access,
    ) -> Result<Self, AclError> {
        let matcher = Glob::new(pattern)
            .map_err(|e| AclError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.kind().to_string(),
            })?
            .compile_matcher();
        self.entries.push(AclEntry {
            user: user.filter(|u| *u != "*").map(str::to_string),
            pattern: pattern.to_string(),
            matcher,
            access,
        });
        Ok(self)
    }

    /// The default access level.
    #[must_use]
    pub fn default_access(&self) -> Access {
        self.default
    }

    /// Number of explicit rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the access level a visitor has on a topic.
    #[must_use]
    pub fn resolve(&self, visitor: &VisitorId, topic: &str) -> Access {
        let user = match visitor {
            VisitorId::User(name) => Some(name.as_str()),
            VisitorId::Addr(_) => None,
        };

        if let Some(name) = user {
            if let Some(entry) = self
                .entries
                .iter()
                .find(|e| e.user.as_deref() == Some(name) && e.matcher.is_match(topic))
            {
                trace!(%visitor, topic, pattern = %entry.pattern, "ACL user rule matched");
                return entry.access;
            }
        }

        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.user.is_none() && e.matcher.is_match(topic))
        {
            trace!(%visitor, topic, pattern = %entry.pattern, "ACL rule matched");
            return entry.access;
        }

        self.default
    }
}

#[async_trait]
impl Authorizer for AccessControlList {
    async fn check_permission(
        &self,
        visitor: &VisitorId,
        topic: &str,
        action: Action,
    ) -> Permission {
        if self.resolve(visitor, topic).permits(action) {
            Permission::Allow
        } else {
            Permission::Deny
        }
    }
}
