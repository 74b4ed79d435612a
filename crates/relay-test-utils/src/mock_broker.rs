//! Scriptable broker mock for relay testing.
//!
//! Records every command the relay issues and lets a test inject faults:
//! - Take the broker offline (every command fails with `Unavailable`)
//! - Fail the next subscribe to a given channel
//! - Delay subscribes, to widen races between lanes and membership changes
//! - Drop the link and bring it back (`Disconnected` / `Reconnected` events)
//!
//! Publishes on a subscribed channel loop back to the event stream, the way
//! Redis delivers a node's own publishes to its subscriber connection.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_test_utils::MockBroker;
//!
//! let (broker, events) = MockBroker::new();
//! broker.fail_next_subscribe("lobby");
//!
//! // Hand `broker.clone()` to the bridge, keep `broker` for assertions
//! assert_eq!(broker.subscribe_count("lobby"), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relay_service::broker::{Broker, BrokerEvent, BrokerEvents, EVENT_CHANNEL_BUFFER};
use relay_service::errors::BrokerError;
use tokio::sync::mpsc;

/// A command the relay sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Publish { channel: String, payload: Bytes },
    Subscribe(String),
    Unsubscribe(String),
}

/// Mock broker. Clones share state.
#[derive(Debug, Clone)]
pub struct MockBroker {
    inner: Arc<Mutex<MockBrokerInner>>,
    events: mpsc::Sender<BrokerEvent>,
}

#[derive(Debug, Default)]
struct MockBrokerInner {
    /// Every command, in arrival order
    calls: Vec<BrokerCall>,
    /// Channels currently subscribed
    subscriptions: HashSet<String>,
    /// When set, every command fails with `Unavailable`
    offline: bool,
    /// Remaining injected subscribe failures per channel
    subscribe_failures: HashMap<String, usize>,
    /// Artificial latency for subscribe round trips
    subscribe_delay: Option<Duration>,
}

impl MockBroker {
    /// Create a mock broker and its event stream.
    #[must_use]
    pub fn new() -> (Self, BrokerEvents) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let broker = Self {
            inner: Arc::new(Mutex::new(MockBrokerInner::default())),
            events,
        };
        (broker, events_rx)
    }

    /// Delay every subscribe by `delay` before it takes effect.
    #[must_use]
    pub fn with_subscribe_delay(self, delay: Duration) -> Self {
        self.lock().subscribe_delay = Some(delay);
        self
    }

    /// Make the next subscribe to `channel` fail with a command error.
    pub fn fail_next_subscribe(&self, channel: &str) {
        *self
            .lock()
            .subscribe_failures
            .entry(channel.to_string())
            .or_default() += 1;
    }

    /// Fail (or stop failing) every command with `Unavailable`, without
    /// emitting link events.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Drop the link: subscriptions are lost, commands fail, and the relay
    /// is told `Disconnected`.
    pub async fn simulate_disconnect(&self) {
        {
            let mut inner = self.lock();
            inner.offline = true;
            inner.subscriptions.clear();
        }
        self.events
            .send(BrokerEvent::Disconnected)
            .await
            .expect("relay dropped the broker event stream");
    }

    /// Restore the link and tell the relay `Reconnected`.
    pub async fn simulate_reconnect(&self) {
        self.lock().offline = false;
        self.events
            .send(BrokerEvent::Reconnected)
            .await
            .expect("relay dropped the broker event stream");
    }

    /// Deliver `payload` on `channel` as if another instance published it.
    ///
    /// Delivered whether or not the channel is subscribed, so tests can check
    /// that the relay ignores traffic for rooms it has no members in.
    pub async fn deliver(&self, channel: &str, payload: impl Into<Bytes>) {
        self.events
            .send(BrokerEvent::Message {
                channel: channel.to_string(),
                payload: payload.into(),
            })
            .await
            .expect("relay dropped the broker event stream");
    }

    /// All recorded commands.
    #[must_use]
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    /// Subscribe commands received for `channel`, including failed ones.
    #[must_use]
    pub fn subscribe_count(&self, channel: &str) -> usize {
        self.count(|call| matches!(call, BrokerCall::Subscribe(c) if c == channel))
    }

    /// Unsubscribe commands received for `channel`, including failed ones.
    #[must_use]
    pub fn unsubscribe_count(&self, channel: &str) -> usize {
        self.count(|call| matches!(call, BrokerCall::Unsubscribe(c) if c == channel))
    }

    /// Payloads published on `channel`, in order.
    #[must_use]
    pub fn published(&self, channel: &str) -> Vec<Bytes> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Publish { channel: c, payload } if c == channel => {
                    Some(payload.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.lock().subscriptions.contains(channel)
    }

    /// Currently subscribed channels, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.lock().subscriptions.iter().cloned().collect();
        channels.sort();
        channels
    }

    fn count(&self, predicate: impl Fn(&BrokerCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    fn lock(&self) -> MutexGuard<'_, MockBrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        let loop_back = {
            let mut inner = self.lock();
            inner.calls.push(BrokerCall::Publish {
                channel: channel.to_string(),
                payload: payload.clone(),
            });
            if inner.offline {
                return Err(BrokerError::Unavailable);
            }
            inner.subscriptions.contains(channel)
        };

        if loop_back {
            let _ = self
                .events
                .send(BrokerEvent::Message {
                    channel: channel.to_string(),
                    payload,
                })
                .await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let delay = {
            let mut inner = self.lock();
            inner
                .calls
                .push(BrokerCall::Subscribe(channel.to_string()));
            inner.subscribe_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if inner.offline {
            return Err(BrokerError::Unavailable);
        }
        if let Some(remaining) = inner.subscribe_failures.get_mut(channel) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrokerError::Command {
                    operation: "subscribe",
                    message: "injected failure".to_string(),
                });
            }
        }
        inner.subscriptions.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let mut inner = self.lock();
        inner
            .calls
            .push(BrokerCall::Unsubscribe(channel.to_string()));
        if inner.offline {
            return Err(BrokerError::Unavailable);
        }
        inner.subscriptions.remove(channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_loops_back_only_when_subscribed() {
        let (broker, mut events) = MockBroker::new();

        broker.publish("lobby", Bytes::from_static(b"one")).await.unwrap();
        assert!(events.try_recv().is_err());

        broker.subscribe("lobby").await.unwrap();
        broker.publish("lobby", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(BrokerEvent::Message {
                channel: "lobby".to_string(),
                payload: Bytes::from_static(b"two"),
            })
        );
        assert_eq!(broker.published("lobby").len(), 2);
    }

    #[tokio::test]
    async fn test_injected_subscribe_failure_is_one_shot() {
        let (broker, _events) = MockBroker::new();
        broker.fail_next_subscribe("lobby");

        assert!(broker.subscribe("lobby").await.is_err());
        assert!(!broker.is_subscribed("lobby"));

        broker.subscribe("lobby").await.unwrap();
        assert!(broker.is_subscribed("lobby"));
        assert_eq!(broker.subscribe_count("lobby"), 2);
    }

    #[tokio::test]
    async fn test_disconnect_drops_subscriptions() {
        let (broker, mut events) = MockBroker::new();
        broker.subscribe("a").await.unwrap();

        broker.simulate_disconnect().await;
        assert_eq!(events.recv().await, Some(BrokerEvent::Disconnected));
        assert!(broker.subscriptions().is_empty());
        assert_eq!(
            broker.subscribe("a").await,
            Err(BrokerError::Unavailable)
        );

        broker.simulate_reconnect().await;
        assert_eq!(events.recv().await, Some(BrokerEvent::Reconnected));
        broker.subscribe("a").await.unwrap();
        assert_eq!(broker.subscriptions(), vec!["a".to_string()]);
    }
}
