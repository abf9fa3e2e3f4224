//! Metrics collection and export.
//!
//! Handlers record through the `metrics` facade; the Prometheus exporter is
//! installed only when enabled in the config.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tidings_core::{BrokerError, BrokerStats};
use tracing::info;

/// Metric names.
pub mod names {
    pub const PUBLISHED_TOTAL: &str = "tidings_published_total";
    pub const PUBLISHED_BYTES: &str = "tidings_published_bytes";
    pub const DELIVERIES_TOTAL: &str = "tidings_deliveries_total";
    pub const PUSH_TOTAL: &str = "tidings_push_total";
    pub const STREAMS_TOTAL: &str = "tidings_streams_total";
    pub const STREAMS_ACTIVE: &str = "tidings_streams_active";
    pub const POLLS_TOTAL: &str = "tidings_polls_total";
    pub const TOPICS_ACTIVE: &str = "tidings_topics_active";
    pub const SUBSCRIBERS_ACTIVE: &str = "tidings_subscribers_active";
    pub const VISITORS_ACTIVE: &str = "tidings_visitors_active";
    pub const CACHED_MESSAGES: &str = "tidings_cached_messages";
    pub const PERSIST_FAILURES: &str = "tidings_persist_failures";
    pub const PUBLISH_SECONDS: &str = "tidings_publish_seconds";
    pub const ERRORS_TOTAL: &str = "tidings_errors_total";
}

/// Describe every metric.
pub fn init_metrics() {
    metrics::describe_counter!(names::PUBLISHED_TOTAL, "Messages accepted for publishing");
    metrics::describe_counter!(names::PUBLISHED_BYTES, "Body bytes of accepted messages");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Live fan-out outcomes per subscriber"
    );
    metrics::describe_counter!(names::PUSH_TOTAL, "Push relay attempts by outcome");
    metrics::describe_counter!(names::STREAMS_TOTAL, "Streaming subscriptions opened");
    metrics::describe_gauge!(names::STREAMS_ACTIVE, "Currently open streaming subscriptions");
    metrics::describe_counter!(names::POLLS_TOTAL, "Poll and long-poll requests served");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Topics in the registry");
    metrics::describe_gauge!(names::SUBSCRIBERS_ACTIVE, "Live subscribers across all topics");
    metrics::describe_gauge!(names::VISITORS_ACTIVE, "Tracked visitors");
    metrics::describe_gauge!(names::CACHED_MESSAGES, "Messages held in cache windows");
    metrics::describe_gauge!(
        names::PERSIST_FAILURES,
        "Writes abandoned by the background persistence writer"
    );
    metrics::describe_histogram!(names::PUBLISH_SECONDS, "Publish handling latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Requests rejected by the broker");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics endpoint.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an accepted publish.
pub fn record_publish(bytes: usize, seconds: f64) {
    counter!(names::PUBLISHED_BYTES).increment(bytes as u64);
    histogram!(names::PUBLISH_SECONDS).record(seconds);
}

/// Record a served poll.
pub fn record_poll(kind: &'static str) {
    counter!(names::POLLS_TOTAL, "kind" => kind).increment(1);
}

/// Record a rejected request.
pub fn record_error(error: &BrokerError) {
    let kind = match error {
        BrokerError::Validation(_) => "validation",
        BrokerError::QuotaExceeded(_) => "quota",
        BrokerError::PermissionDenied { .. } => "permission",
        BrokerError::TopicCapacityExceeded(_) => "capacity",
        BrokerError::PushCapacityExceeded(_) => "push_capacity",
        BrokerError::TopicNotFound(_) => "not_found",
        BrokerError::InvalidFilter(_) => "filter",
        BrokerError::Persistence(_) => "persistence",
        BrokerError::ShuttingDown => "shutdown",
    };
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Refresh gauges and broker-owned counters from a snapshot.
pub fn record_stats(stats: &BrokerStats) {
    counter!(names::PUBLISHED_TOTAL).absolute(stats.published);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "delivered").absolute(stats.hub.delivered);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "dropped").absolute(stats.hub.dropped);
    counter!(names::DELIVERIES_TOTAL, "outcome" => "slow_closed").absolute(stats.hub.slow_closed);
    counter!(names::PUSH_TOTAL, "outcome" => "sent").absolute(stats.push_sent);
    counter!(names::PUSH_TOTAL, "outcome" => "failed").absolute(stats.push_failed);

    gauge!(names::TOPICS_ACTIVE).set(stats.topics as f64);
    gauge!(names::SUBSCRIBERS_ACTIVE).set(stats.subscribers as f64);
    gauge!(names::VISITORS_ACTIVE).set(stats.visitors as f64);
    gauge!(names::CACHED_MESSAGES).set(stats.store.cached as f64);
    gauge!(names::PERSIST_FAILURES).set(stats.store.persist_failures as f64);
}

/// Counts one open stream for as long as it lives.
pub struct StreamMetricsGuard {
    transport: &'static str,
}

impl StreamMetricsGuard {
    /// Record a new stream.
    #[must_use]
    pub fn new(transport: &'static str) -> Self {
        counter!(names::STREAMS_TOTAL, "transport" => transport).increment(1);
        gauge!(names::STREAMS_ACTIVE, "transport" => transport).increment(1.0);
        Self { transport }
    }
}

impl Drop for StreamMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::STREAMS_ACTIVE, "transport" => self.transport).decrement(1.0);
    }
}
