//! # tidings-core
//!
//! The engine behind the Tidings notification broker: topics, message
//! retention and replay, live fan-out, per-visitor quotas and the dispatcher
//! that ties them together.
//!
//! - **Broker** - Validates, authorizes, rate-limits and dispatches
//! - **TopicRegistry** - Lazily created topics, reclaimed when idle
//! - **MessageStore** - Per-topic cache windows over optional persistence
//! - **SubscriberHub** - Bounded per-subscriber queues and backlog replay
//! - **VisitorTable** - Token buckets and daily budgets per visitor
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌───────────────┐
//! │  Transport  │────▶│   Broker    │────▶│ TopicRegistry │
//! └─────────────┘     └─────────────┘     └───────────────┘
//!                       │    │    │
//!            ┌──────────┘    │    └──────────┐
//!            ▼               ▼               ▼
//!     ┌─────────────┐ ┌──────────────┐ ┌───────────────┐
//!     │ VisitorTable│ │ MessageStore │ │ SubscriberHub │
//!     └─────────────┘ └──────────────┘ └───────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │ Persistence │
//!                     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use tidings_core::{Broker, BrokerConfig, Identity, PublishRequest, SubscribeRequest};
//!
//! # async fn run() -> Result<(), tidings_core::BrokerError> {
//! let broker = Broker::new(BrokerConfig::default());
//! broker.start().await?;
//!
//! let me = Identity::anonymous(IpAddr::V4(Ipv4Addr::LOCALHOST));
//! let mut sub = broker.subscribe(SubscribeRequest::new("backups"), &me).await?;
//! broker.publish(PublishRequest::new("backups", "nightly backup done"), &me).await?;
//!
//! let message = sub.recv().await;
//! assert_eq!(message.map(|m| m.body.clone()).as_deref(), Some("nightly backup done"));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod broker;
pub mod clock;
pub mod error;
pub mod filter;
pub mod hub;
pub mod message;
pub mod persistence;
pub mod push;
pub mod store;
pub mod subscription;
pub mod topic;
pub mod visitor;

pub use auth::{Access, AccessControlList, Action, AllowAll, Authorizer, Permission};
pub use broker::{Broker, BrokerBuilder, BrokerConfig, BrokerStats, MaintenanceReport, SubscribeRequest};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::BrokerError;
pub use filter::{Filter, FilterParams};
pub use hub::{FanoutReport, HubConfig};
pub use message::{Attachment, Cursor, Message, MessageId, Priority, PublishRequest};
pub use persistence::{MemoryPersistence, Persistence, PersistenceError};
pub use push::{LogRelay, MessageSummary, PushLimits, PushPolicy, PushRelay, PushRelayError};
pub use store::{Durability, StoreConfig};
pub use subscription::{CloseReason, SlowConsumerPolicy, Subscription, SubscriptionState, TransportKind};
pub use topic::{validate_topic_name, RegistryConfig};
pub use visitor::{CostKind, Identity, Quota, QuotaConfig, QuotaKind, VisitorClass, VisitorId};
