//! Subscriber event feed shared by the streaming transports.
//!
//! A feed starts with `open`, then yields messages as they arrive with a
//! `keepalive` whenever the stream has been idle for the configured
//! interval, and ends with one `close` event naming the reason.

use futures_util::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;
use tidings_core::{Broker, Subscription};
use tidings_protocol::Event;
use tokio::time::{Instant, Interval, MissedTickBehavior};

enum Phase {
    Open,
    Live,
    Closed,
}

struct Feed {
    subscription: Subscription,
    broker: Arc<Broker>,
    ticker: Interval,
    phase: Phase,
}

impl Feed {
    async fn next_event(&mut self) -> Option<Event> {
        match self.phase {
            Phase::Open => {
                self.phase = Phase::Live;
                Some(Event::open(self.subscription.topic(), self.broker.now_ms()))
            }
            Phase::Closed => None,
            Phase::Live => {
                tokio::select! {
                    message = self.subscription.recv() => match message {
                        Some(message) => {
                            self.ticker.reset();
                            Some(message.to_event())
                        }
                        None => {
                            self.phase = Phase::Closed;
                            let reason = self
                                .subscription
                                .close_reason()
                                .map_or("closed", |r| r.as_str());
                            Some(Event::close(self.subscription.topic(), self.broker.now_ms(), reason))
                        }
                    },
                    _ = self.ticker.tick() => {
                        Some(Event::keepalive(self.subscription.topic(), self.broker.now_ms()))
                    }
                }
            }
        }
    }
}

/// Turn a live subscription into a stream of subscriber events.
pub fn event_feed(
    subscription: Subscription,
    broker: Arc<Broker>,
    keepalive: Duration,
) -> impl Stream<Item = Event> + Send + 'static {
    let keepalive = keepalive.max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let feed = Feed {
        subscription,
        broker,
        ticker,
        phase: Phase::Open,
    };
    stream::unfold(feed, |mut feed| async move {
        let event = feed.next_event().await?;
        Some((event, feed))
    })
}
