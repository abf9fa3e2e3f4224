//! Shared fixtures for the Tidings benchmarks.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tidings_core::{Broker, BrokerConfig, Identity, Quota, Subscription, SubscribeRequest};
use tokio::runtime::Runtime;

/// A multi-threaded runtime for driving the async broker API.
///
/// # Panics
///
/// Panics if the runtime cannot be created.
#[must_use]
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
}

/// Broker settings with quotas out of the way and room for large fan-outs.
#[must_use]
pub fn bench_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.quotas.anonymous = Quota::unlimited();
    config.quotas.authenticated = Quota::unlimited();
    config.hub.queue_capacity = 4_096;
    config
}

/// A broker with [`bench_config`].
#[must_use]
pub fn broker() -> Arc<Broker> {
    Broker::new(bench_config())
}

/// An anonymous visitor keyed by the last address octet.
#[must_use]
pub fn visitor(n: u8) -> Identity {
    Identity::anonymous(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)))
}

/// Open `count` live subscriptions on one topic.
///
/// # Panics
///
/// Panics if a subscription is refused.
pub async fn subscribers(broker: &Broker, topic: &str, count: usize) -> Vec<Subscription> {
    let me = visitor(1);
    let mut subs = Vec::with_capacity(count);
    for _ in 0..count {
        subs.push(
            broker
                .subscribe(SubscribeRequest::new(topic), &me)
                .await
                .expect("subscribe failed"),
        );
    }
    subs
}
