//! In-process broker.
//!
//! A [`MemoryBus`] stands in for the shared broker; each relay node attaches
//! to it with [`MemoryBus::connect`] and gets its own [`MemoryBroker`] plus
//! event stream. A single-node deployment uses [`MemoryBroker::standalone`].
//!
//! The bus never disconnects, so no `Disconnected` / `Reconnected` events are
//! ever emitted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Broker, BrokerEvent, BrokerEvents, EVENT_CHANNEL_BUFFER};
use crate::errors::BrokerError;

/// Channel -> (node -> that node's event sender).
type ChannelTable = HashMap<String, HashMap<u64, mpsc::Sender<BrokerEvent>>>;

/// Shared in-process message bus.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    channels: Arc<Mutex<ChannelTable>>,
    next_node: Arc<AtomicU64>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node to the bus.
    #[must_use]
    pub fn connect(&self) -> (MemoryBroker, BrokerEvents) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let node = self.next_node.fetch_add(1, Ordering::Relaxed);
        let broker = MemoryBroker {
            bus: self.clone(),
            node,
            events,
        };
        (broker, events_rx)
    }

    /// Number of nodes subscribed to `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().get(channel).map_or(0, HashMap::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelTable> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One node's view of a [`MemoryBus`].
#[derive(Debug)]
pub struct MemoryBroker {
    bus: MemoryBus,
    node: u64,
    events: mpsc::Sender<BrokerEvent>,
}

impl MemoryBroker {
    /// A broker on a private bus.
    #[must_use]
    pub fn standalone() -> (Self, BrokerEvents) {
        MemoryBus::new().connect()
    }

    /// Whether this node currently subscribes to `channel`.
    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.bus
            .lock()
            .get(channel)
            .is_some_and(|nodes| nodes.contains_key(&self.node))
    }

    /// Channels this node currently subscribes to, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .bus
            .lock()
            .iter()
            .filter(|(_, nodes)| nodes.contains_key(&self.node))
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        // Collect senders first; never hold the table lock across an await.
        let targets: Vec<mpsc::Sender<BrokerEvent>> = self
            .bus
            .lock()
            .get(channel)
            .map(|nodes| nodes.values().cloned().collect())
            .unwrap_or_default();

        trace!(
            target: "relay.broker.memory",
            channel = %channel,
            nodes = targets.len(),
            "Publishing"
        );

        for target in targets {
            // A node whose event stream is gone simply misses the message.
            let _ = target
                .send(BrokerEvent::Message {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
                .await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.bus
            .lock()
            .entry(channel.to_string())
            .or_default()
            .insert(self.node, self.events.clone());
        debug!(target: "relay.broker.memory", channel = %channel, node = self.node, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let mut table = self.bus.lock();
        if let Some(nodes) = table.get_mut(channel) {
            nodes.remove(&self.node);
            if nodes.is_empty() {
                table.remove(channel);
            }
        }
        debug!(target: "relay.broker.memory", channel = %channel, node = self.node, "Unsubscribed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribed_nodes_only() {
        let bus = MemoryBus::new();
        let (node_a, mut events_a) = bus.connect();
        let (node_b, mut events_b) = bus.connect();

        node_a.subscribe("room1").await.unwrap();
        node_b
            .publish("room1", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(
            events_a.recv().await,
            Some(BrokerEvent::Message {
                channel: "room1".to_string(),
                payload: Bytes::from_static(b"hello"),
            })
        );
        assert!(events_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubscribe_is_single_subscription() {
        let (broker, mut events) = MemoryBroker::standalone();

        broker.subscribe("room1").await.unwrap();
        broker.subscribe("room1").await.unwrap();
        broker
            .publish("room1", Bytes::from_static(b"once"))
            .await
            .unwrap();

        assert!(events.recv().await.is_some());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_clears_channel() {
        let bus = MemoryBus::new();
        let (broker, _events) = bus.connect();

        broker.subscribe("room1").await.unwrap();
        assert!(broker.is_subscribed("room1"));
        assert_eq!(broker.subscriptions(), vec!["room1"]);

        broker.unsubscribe("room1").await.unwrap();
        assert!(!broker.is_subscribed("room1"));
        assert_eq!(bus.subscriber_count("room1"), 0);

        // Unsubscribing again is harmless.
        broker.unsubscribe("room1").await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_to_dropped_node_is_ignored() {
        let bus = MemoryBus::new();
        let (listener, events) = bus.connect();
        let (publisher, _publisher_events) = bus.connect();

        listener.subscribe("room1").await.unwrap();
        drop(events);

        publisher
            .publish("room1", Bytes::from_static(b"lost"))
            .await
            .unwrap();
    }
}
