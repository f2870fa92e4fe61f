//! Topic-based publish/subscribe used between front and back masters.
//!
//! Delivery is at-most-once and ordered per topic. A publish on a topic nobody
//! listens to is accepted and dropped; subscribers only see messages published
//! after they subscribed.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    /// Returns a receiver that observes every message published on `topic`
    /// from this point on. Dropping the receiver unsubscribes.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;

    /// Publishes `payload` on `topic`, returning how many live subscribers it
    /// was handed to.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;
}

/// In-process bus; every master sharing one instance can reach every other.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capacity` bounds how far a slow subscriber may fall behind on one
    /// topic before it starts losing messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Drops topics that no longer have subscribers.
    pub fn prune(&self) -> usize {
        let mut guard = self.topics.write();
        let before = guard.len();
        guard.retain(|_, sender| sender.receiver_count() > 0);
        before - guard.len()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let sender = match self.topics.read().get(topic) {
            Some(sender) => sender.clone(),
            None => return Ok(0),
        };
        // a send error only means every receiver has gone away
        Ok(sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("8-front-0");
        let delivered = bus
            .publish("8-front-0", Bytes::from_static(b"ping"))
            .expect("publish ok");
        assert_eq!(delivered, 1);
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "8-front-0");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = LocalBus::new();
        let delivered = bus
            .publish("2", Bytes::from_static(b"nobody"))
            .expect("publish ok");
        assert_eq!(delivered, 0);
        assert_eq!(bus.subscriber_count("2"), 0);
    }

    #[tokio::test]
    async fn preserves_order_per_topic() {
        let bus = LocalBus::with_capacity(16);
        let mut sub = bus.subscribe("0-1");
        for i in 0..10u8 {
            bus.publish("0-1", Bytes::from(vec![i])).expect("publish ok");
        }
        for i in 0..10u8 {
            let msg = sub.recv().await.expect("receive ok");
            assert_eq!(msg.payload.as_ref(), &[i]);
        }
    }

    #[test]
    fn prune_drops_abandoned_topics() {
        let bus = LocalBus::new();
        let keep = bus.subscribe("keep");
        drop(bus.subscribe("gone"));
        assert_eq!(bus.prune(), 1);
        assert_eq!(bus.subscriber_count("keep"), 1);
        drop(keep);
        assert_eq!(bus.subscriber_count("keep"), 0);
    }
}
