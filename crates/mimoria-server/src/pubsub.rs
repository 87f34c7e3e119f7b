//! Pub/Sub channel fanout (§4.D).
//!
//! Subscriber sets are copy-on-write (`arc_swap::ArcSwap`) so publish can
//! iterate a snapshot without taking a lock; subscribe/unsubscribe build a
//! new `Vec` and swap it in. Delivery is best-effort: a subscriber whose
//! outbound channel is full or closed is logged and skipped, never
//! surfaced to the publisher.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use mimoria_common::TaggedValue;
use tokio::sync::mpsc;

/// The internal channel name carrying key-expiration events (§4.D, §9).
pub const EXPIRED_KEY_CHANNEL: &str = "__keyevent@expired__";

/// One message delivered to a subscriber: the channel it arrived on and
/// its tagged payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub payload: TaggedValue,
}

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Message>,
}

/// Channel name → subscriber set. One per server instance.
pub struct Hub {
    channels: DashMap<String, ArcSwap<Vec<Subscriber>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Idempotent: subscribing the same `(channel, id)` pair twice leaves a
    /// single entry (the second call replaces the first's sender).
    pub fn subscribe(&self, channel: &str, id: SubscriberId, tx: mpsc::Sender<Message>) {
        let entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| ArcSwap::from_pointee(Vec::new()));
        let current = entry.load();
        let mut next: Vec<Subscriber> = current
            .iter()
            .filter(|s| s.id != id)
            .map(|s| Subscriber {
                id: s.id,
                tx: s.tx.clone(),
            })
            .collect();
        next.push(Subscriber { id, tx });
        entry.store(std::sync::Arc::new(next));
    }

    /// Idempotent: unsubscribing an id that isn't present is a no-op.
    pub fn unsubscribe(&self, channel: &str, id: SubscriberId) {
        if let Some(entry) = self.channels.get(channel) {
            let current = entry.load();
            let next: Vec<Subscriber> = current
                .iter()
                .filter(|s| s.id != id)
                .map(|s| Subscriber {
                    id: s.id,
                    tx: s.tx.clone(),
                })
                .collect();
            entry.store(std::sync::Arc::new(next));
        }
    }

    /// Remove a connection from every channel it may be subscribed to
    /// (called on connection teardown, §4.E).
    pub fn unsubscribe_all(&self, id: SubscriberId) {
        for entry in self.channels.iter() {
            self.unsubscribe(entry.key(), id);
        }
    }

    /// Best-effort fanout to every current subscriber of `channel`.
    pub async fn publish(&self, channel: &str, payload: TaggedValue) {
        let Some(entry) = self.channels.get(channel) else {
            return;
        };
        let subscribers = entry.load_full();
        drop(entry);
        for subscriber in subscribers.iter() {
            let msg = Message {
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            if subscriber.tx.send(msg).await.is_err() {
                tracing::warn!(channel, subscriber = subscriber.id, "pubsub delivery failed");
            }
        }
    }

    /// Publish a key-expiration event on the reserved internal channel.
    pub async fn publish_expired_key(&self, key: &[u8]) {
        let text = String::from_utf8_lossy(key).into_owned();
        self.publish(EXPIRED_KEY_CHANNEL, TaggedValue::String(text)).await;
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let hub = Hub::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        hub.subscribe("chan", 1, tx1);
        hub.subscribe("chan", 2, tx2);

        hub.publish("chan", TaggedValue::Bool(true)).await;

        assert_eq!(rx1.recv().await.unwrap().payload, TaggedValue::Bool(true));
        assert_eq!(rx2.recv().await.unwrap().payload, TaggedValue::Bool(true));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.subscribe("chan", 1, tx);
        hub.unsubscribe("chan", 1);
        hub.unsubscribe("chan", 1);

        hub.publish("chan", TaggedValue::Null).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn expired_key_event_carries_key_text() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.subscribe(EXPIRED_KEY_CHANNEL, 1, tx);

        hub.publish_expired_key(b"session:42").await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, EXPIRED_KEY_CHANNEL);
        assert_eq!(msg.payload, TaggedValue::String("session:42".to_string()));
    }

    #[tokio::test]
    async fn publish_to_unknown_channel_is_a_no_op() {
        let hub = Hub::new();
        hub.publish("nobody-home", TaggedValue::Null).await;
    }
}
