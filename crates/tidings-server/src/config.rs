//! Server configuration.
//!
//! Sources, later ones overriding earlier ones:
//! - Built-in defaults
//! - A TOML file (`--config`, or the first of the default paths that exists)
//! - Environment variables (`TIDINGS_PORT`, `TIDINGS_CACHE__RETENTION`, ...)
//!
//! Durations are written in humantime form (`45s`, `12h`, `100ms`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tidings_core::{
    Access, AccessControlList, AllowAll, Authorizer, BrokerConfig, Durability, HubConfig,
    MemoryPersistence, Persistence, PushLimits, PushPolicy, Quota, QuotaConfig, RegistryConfig,
    SlowConsumerPolicy, StoreConfig,
};

const DEFAULT_PATHS: [&str; 3] = [
    "tidings.toml",
    "/etc/tidings/tidings.toml",
    "~/.config/tidings/tidings.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Trust `X-Forwarded-For` for the visitor address.
    #[serde(default)]
    pub behind_proxy: bool,

    /// Subscriber stream settings.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Message cache and persistence writer.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Per-visitor quotas.
    #[serde(default)]
    pub visitors: VisitorsConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// When publishes trigger a push.
    #[serde(default)]
    pub push: PushPolicy,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Subscriber stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Interval between keepalive events on idle streams.
    #[serde(default = "default_keepalive", with = "humantime_duration")]
    pub keepalive: Duration,

    /// Upper bound on a long-poll wait.
    #[serde(default = "default_long_poll_max", with = "humantime_duration")]
    pub long_poll_max: Duration,
}

/// Message cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long messages stay replayable.
    #[serde(default = "default_retention", with = "humantime_duration")]
    pub retention: Duration,

    /// Cached messages per topic.
    #[serde(default = "default_max_per_topic")]
    pub max_per_topic: usize,

    #[serde(default)]
    pub durability: Durability,

    /// Persistence collaborator behind the cache.
    #[serde(default)]
    pub persistence: PersistenceBackend,

    /// Background writer queue capacity.
    #[serde(default = "default_writer_queue")]
    pub writer_queue: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_timeout", with = "humantime_duration")]
    pub batch_timeout: Duration,

    /// Extra attempts for a failed background write.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    #[serde(default = "default_retry_backoff", with = "humantime_duration")]
    pub retry_backoff: Duration,
}

/// Which persistence collaborator backs the message cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceBackend {
    /// Cache only; history is lost on restart.
    #[default]
    None,
    /// In-process store, useful for exercising replay beyond the cache window.
    Memory,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of topics.
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,

    /// Maximum message body size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// How long an idle topic lingers before it is reclaimed.
    #[serde(default = "default_topic_idle_grace", with = "humantime_duration")]
    pub topic_idle_grace: Duration,

    /// Per-subscriber queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub slow_consumer: SlowConsumerPolicy,

    /// Interval of the background maintenance pass.
    #[serde(default = "default_manager_interval", with = "humantime_duration")]
    pub manager_interval: Duration,

    /// Push endpoints one topic may carry.
    #[serde(default = "default_max_push_endpoints_per_topic")]
    pub max_push_endpoints_per_topic: usize,

    /// Push endpoints across all topics.
    #[serde(default = "default_max_push_endpoints")]
    pub max_push_endpoints: usize,
}

/// Visitor quota configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisitorsConfig {
    /// Overrides for anonymous visitors.
    #[serde(default)]
    pub anonymous: QuotaOverrides,

    /// Overrides for authenticated visitors.
    #[serde(default)]
    pub authenticated: QuotaOverrides,

    /// Visitor ids (`ip:10.0.0.1`, `user:ci`) that are never limited.
    #[serde(default)]
    pub exempt: Vec<String>,

    /// Inactive visitors are forgotten after this long.
    #[serde(default, with = "humantime_duration_opt")]
    pub ttl: Option<Duration>,
}

/// Partial quota; unset fields keep the class default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaOverrides {
    pub request_burst: Option<u32>,
    #[serde(default, with = "humantime_duration_opt")]
    pub request_refill: Option<Duration>,
    pub daily_messages: Option<u32>,
    pub attachment_file_size: Option<u64>,
    pub attachment_daily_bytes: Option<u64>,
    pub attachment_daily_count: Option<u32>,
    pub max_subscriptions: Option<u32>,
}

/// Authentication and topic access rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Access when no rule matches.
    #[serde(default = "default_access")]
    pub default_access: Access,

    /// Known users and their bearer tokens.
    #[serde(default)]
    pub users: Vec<UserConfig>,

    /// Topic rules, first match wins per user.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub token: String,
}

/// One ACL rule. A missing `user` (or `*`) applies to everyone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub user: Option<String>,
    pub topic: String,
    pub access: Access,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_keepalive() -> Duration {
    Duration::from_secs(45)
}

fn default_long_poll_max() -> Duration {
    Duration::from_secs(120)
}

fn default_retention() -> Duration {
    StoreConfig::default().retention
}

fn default_max_per_topic() -> usize {
    StoreConfig::default().max_cached
}

fn default_writer_queue() -> usize {
    StoreConfig::default().writer_queue
}

fn default_batch_size() -> usize {
    StoreConfig::default().batch_size
}

fn default_batch_timeout() -> Duration {
    StoreConfig::default().batch_timeout
}

fn default_write_retries() -> u32 {
    StoreConfig::default().write_retries
}

fn default_retry_backoff() -> Duration {
    StoreConfig::default().retry_backoff
}

fn default_max_topics() -> usize {
    RegistryConfig::default().max_topics
}

fn default_max_message_size() -> usize {
    BrokerConfig::default().max_message_size
}

fn default_topic_idle_grace() -> Duration {
    RegistryConfig::default().idle_grace
}

fn default_queue_capacity() -> usize {
    HubConfig::default().queue_capacity
}

fn default_manager_interval() -> Duration {
    BrokerConfig::default().manager_interval
}

fn default_max_push_endpoints_per_topic() -> usize {
    PushLimits::default().per_topic
}

fn default_max_push_endpoints() -> usize {
    PushLimits::default().total
}

fn default_access() -> Access {
    Access::ReadWrite
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            behind_proxy: false,
            stream: StreamConfig::default(),
            cache: CacheConfig::default(),
            limits: LimitsConfig::default(),
            visitors: VisitorsConfig::default(),
            auth: AuthConfig::default(),
            push: PushPolicy::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive: default_keepalive(),
            long_poll_max: default_long_poll_max(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            max_per_topic: default_max_per_topic(),
            durability: Durability::default(),
            persistence: PersistenceBackend::default(),
            writer_queue: default_writer_queue(),
            batch_size: default_batch_size(),
            batch_timeout: default_batch_timeout(),
            write_retries: default_write_retries(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_topics: default_max_topics(),
            max_message_size: default_max_message_size(),
            topic_idle_grace: default_topic_idle_grace(),
            queue_capacity: default_queue_capacity(),
            slow_consumer: SlowConsumerPolicy::default(),
            manager_interval: default_manager_interval(),
            max_push_endpoints_per_topic: default_max_push_endpoints_per_topic(),
            max_push_endpoints: default_max_push_endpoints(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_access: default_access(),
            users: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl QuotaOverrides {
    /// Apply the overrides on top of a class default.
    #[must_use]
    pub fn apply(&self, base: Quota) -> Quota {
        Quota {
            request_burst: self.request_burst.unwrap_or(base.request_burst),
            request_refill: self.request_refill.unwrap_or(base.request_refill),
            daily_messages: self.daily_messages.unwrap_or(base.daily_messages),
            attachment_file_size: self.attachment_file_size.unwrap_or(base.attachment_file_size),
            attachment_daily_bytes: self
                .attachment_daily_bytes
                .unwrap_or(base.attachment_daily_bytes),
            attachment_daily_count: self
                .attachment_daily_count
                .unwrap_or(base.attachment_daily_count),
            max_subscriptions: self.max_subscriptions.unwrap_or(base.max_subscriptions),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, the first default path
    /// that exists is used, if any. Environment variables apply last.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or the merged values do
    /// not form a valid configuration.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => DEFAULT_PATHS
                .iter()
                .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
                .find(|p| p.exists()),
        };

        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(
                config::File::from(path.as_path())
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TIDINGS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("visitors.exempt"),
        );

        let merged = builder.build().with_context(|| match &file {
            Some(path) => format!("Failed to read config file: {}", path.display()),
            None => "Failed to read configuration".to_string(),
        })?;
        let config: Config = merged
            .try_deserialize()
            .context("Failed to parse configuration")?;
        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }

    /// Address of the Prometheus endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the host is not an IP address.
    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.metrics.port)
            .parse()
            .with_context(|| format!("Invalid metrics address {}:{}", self.host, self.metrics.port))
    }

    /// Broker settings derived from this configuration.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        let defaults = QuotaConfig::default();
        BrokerConfig {
            store: StoreConfig {
                retention: self.cache.retention,
                max_cached: self.cache.max_per_topic,
                durability: self.cache.durability,
                writer_queue: self.cache.writer_queue,
                batch_size: self.cache.batch_size,
                batch_timeout: self.cache.batch_timeout,
                write_retries: self.cache.write_retries,
                retry_backoff: self.cache.retry_backoff,
            },
            registry: RegistryConfig {
                max_topics: self.limits.max_topics,
                idle_grace: self.limits.topic_idle_grace,
            },
            quotas: QuotaConfig {
                anonymous: self.visitors.anonymous.apply(defaults.anonymous),
                authenticated: self.visitors.authenticated.apply(defaults.authenticated),
                exempt: self.visitors.exempt.clone(),
                visitor_ttl: self.visitors.ttl.unwrap_or(defaults.visitor_ttl),
            },
            hub: HubConfig {
                queue_capacity: self.limits.queue_capacity,
                slow_consumer: self.limits.slow_consumer,
            },
            push_policy: self.push,
            push_limits: PushLimits {
                per_topic: self.limits.max_push_endpoints_per_topic,
                total: self.limits.max_push_endpoints,
            },
            max_message_size: self.limits.max_message_size,
            manager_interval: self.limits.manager_interval,
        }
    }

    /// The persistence collaborator, if any.
    #[must_use]
    pub fn persistence(&self) -> Option<Arc<dyn Persistence>> {
        match self.cache.persistence {
            PersistenceBackend::None => None,
            PersistenceBackend::Memory => Some(Arc::new(MemoryPersistence::new())),
        }
    }

    /// The topic authorizer. Without rules and with open default access,
    /// everything is allowed.
    ///
    /// # Errors
    ///
    /// Returns an error if a rule's topic pattern is invalid.
    pub fn authorizer(&self) -> Result<Arc<dyn Authorizer>> {
        if self.auth.rules.is_empty() && self.auth.default_access == Access::ReadWrite {
            return Ok(Arc::new(AllowAll));
        }
        let mut acl = AccessControlList::new(self.auth.default_access);
        for rule in &self.auth.rules {
            acl = acl
                .grant(rule.user.as_deref(), &rule.topic, rule.access)
                .with_context(|| format!("Invalid access rule for topic {}", rule.topic))?;
        }
        Ok(Arc::new(acl))
    }

    /// User name for a bearer token.
    #[must_use]
    pub fn user_for_token(&self, token: &str) -> Option<&str> {
        self.auth
            .users
            .iter()
            .find(|u| u.token == token)
            .map(|u| u.name.as_str())
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod humantime_duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidings_core::{Action, Permission, Priority, VisitorId};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.stream.keepalive, Duration::from_secs(45));
        assert_eq!(config.cache.retention, Duration::from_secs(12 * 3600));
        assert!(!config.metrics.enabled);
        assert_eq!(config.broker_config().push_limits, PushLimits::default());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            behind_proxy = true

            [cache]
            retention = "6h"
            max_per_topic = 50
            durability = "strict"
            persistence = "memory"

            [limits]
            slow_consumer = "close"
            max_push_endpoints_per_topic = 5
            max_push_endpoints = 200

            [visitors]
            exempt = ["user:ci"]

            [visitors.anonymous]
            daily_messages = 60
            request_refill = "10s"

            [push]
            mode = "priority-threshold"
            min = 4
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(config.behind_proxy);

        let broker = config.broker_config();
        assert_eq!(broker.store.retention, Duration::from_secs(6 * 3600));
        assert_eq!(broker.store.max_cached, 50);
        assert_eq!(broker.store.durability, Durability::Strict);
        assert!(config.persistence().is_some());
        assert!(Config::default().persistence().is_none());
        assert_eq!(broker.hub.slow_consumer, SlowConsumerPolicy::Close);
        assert_eq!(
            broker.push_limits,
            PushLimits {
                per_topic: 5,
                total: 200
            }
        );
        assert_eq!(broker.quotas.exempt, vec!["user:ci".to_string()]);
        assert_eq!(broker.quotas.anonymous.daily_messages, 60);
        assert_eq!(broker.quotas.anonymous.request_refill, Duration::from_secs(10));
        // Untouched fields keep the class default.
        assert_eq!(
            broker.quotas.anonymous.request_burst,
            Quota::anonymous().request_burst
        );
        assert_eq!(broker.quotas.authenticated, Quota::authenticated());
        assert_eq!(
            broker.push_policy,
            PushPolicy::PriorityThreshold {
                min: Priority::High
            }
        );
    }

    #[test]
    fn test_bad_duration_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [stream]
            keepalive = "soon"
        "#,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_auth_rules() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            default_access = "deny-all"

            [[auth.users]]
            name = "ci"
            token = "tk_ci"

            [[auth.rules]]
            user = "ci"
            topic = "builds-*"
            access = "read-write"

            [[auth.rules]]
            topic = "announcements"
            access = "read-only"
        "#,
        )
        .unwrap();

        assert_eq!(config.user_for_token("tk_ci"), Some("ci"));
        assert_eq!(config.user_for_token("tk_other"), None);

        let authorizer = config.authorizer().unwrap();
        let ci = VisitorId::User("ci".to_string());
        let anon = VisitorId::Addr("198.51.100.7".parse().unwrap());

        assert_eq!(
            authorizer.check_permission(&ci, "builds-main", Action::Write).await,
            Permission::Allow
        );
        assert_eq!(
            authorizer.check_permission(&anon, "builds-main", Action::Read).await,
            Permission::Deny
        );
        assert_eq!(
            authorizer.check_permission(&anon, "announcements", Action::Read).await,
            Permission::Allow
        );
        assert_eq!(
            authorizer.check_permission(&anon, "announcements", Action::Write).await,
            Permission::Deny
        );
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = std::env::temp_dir().join(format!("tidings-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tidings.toml");
        std::fs::write(&path, "port = 9100\n[limits]\nmax_topics = 7\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.limits.max_topics, 7);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
