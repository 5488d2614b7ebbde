//! Message bus abstraction: a topic-based publish/subscribe transport with
//! at-most-once delivery and no persistence beyond in-flight messages. The
//! production transport (NATS, Redis Streams, or similar) is an external
//! collaborator reached over the network; this crate defines the trait every
//! other crate programs against, plus an in-process implementation usable
//! for local development and the workspace's own integration tests — the
//! same role `toka-bus-core::EventBus` plays for its ecosystem, adapted here
//! to topic-addressed raw payloads rather than one fixed event enum, since
//! topics are the unit of routing here, not the payload type.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// A boxed stream of topic payloads, used as every [`Subscriber`]
/// implementation's associated stream type so callers don't need to name the
/// concrete broadcast/lag-filtering machinery underneath.
pub type TopicStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Publish a raw payload on a topic. Delivery is at-most-once: subscribers
/// that are not listening when a message is published never see it, and a
/// slow subscriber can be dropped by the broadcast channel's lag behavior.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()>;
}

/// Subscribe to a topic, receiving every message published after the
/// subscription is created.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<TopicStream>;
}

/// Convenience supertrait for code that needs to both publish and subscribe
/// — every domain service and the correlation RPC layer do both, so they
/// program against `Arc<dyn Bus>` rather than threading two trait objects.
pub trait Bus: Publisher + Subscriber {}
impl<T: Publisher + Subscriber> Bus for T {}

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    topics: HashMap<String, broadcast::Sender<Bytes>>,
}

impl Inner {
    fn sender_for(&mut self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// In-process broker: one `tokio::sync::broadcast` channel per topic, created
/// lazily on first publish or subscribe. Used for local development and for
/// every integration test in this workspace — nothing here talks to a real
/// network; the bus is consumed through this contract rather than
/// reimplemented for production.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        let sender = self.inner.lock().unwrap().sender_for(topic);
        // A `SendError` here only means there are currently no subscribers;
        // that is a normal, expected state for an at-most-once bus, not a
        // failure the publisher should see.
        let _ = sender.send(payload);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<TopicStream> {
        let sender = self.inner.lock().unwrap().sender_for(topic);
        let topic = topic.to_string();
        // Lagged subscribers drop missed messages and keep going: the bus
        // promises at-most-once delivery, not exactly-once, so a skip is
        // logged and not treated as a stream error.
        let stream = BroadcastStream::new(sender.subscribe()).filter_map(move |item| match item {
            Ok(payload) => Some(payload),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                tracing::warn!(topic = %topic, skipped = n, "subscriber lagged, messages dropped");
                None
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn subscriber_registered_before_publish_receives_it() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("topic.a").await.unwrap();
        bus.publish("topic.a", Bytes::from_static(b"hello")).await.unwrap();

        let received = stream.next().await.unwrap();
        assert_eq!(received, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = InMemoryBus::new();
        bus.publish("nobody.listening", Bytes::from_static(b"x")).await.unwrap();
    }

    #[tokio::test]
    async fn two_subscribers_on_same_topic_both_get_the_message() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("fanout").await.unwrap();
        let mut b = bus.subscribe("fanout").await.unwrap();
        bus.publish("fanout", Bytes::from_static(b"msg")).await.unwrap();

        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"msg"));
        assert_eq!(b.next().await.unwrap(), Bytes::from_static(b"msg"));
    }
}
