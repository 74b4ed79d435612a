//! Broker abstraction: the cross-process publish/subscribe backbone.
//!
//! A broker is consumed through two halves:
//!
//! - the [`Broker`] trait for commands (`publish`, `subscribe`, `unsubscribe`),
//! - a single long-lived [`BrokerEvents`] stream handed out at construction,
//!   carrying every delivered message (tagged with its channel) plus link
//!   loss/recovery notifications.
//!
//! There are no per-subscription handlers. The bridge owns the one listener
//! and demultiplexes deliveries by channel name.
//!
//! # Implementations
//!
//! - [`redis::RedisBroker`] - Redis pub/sub with reconnect-with-backoff
//! - [`memory::MemoryBroker`] - in-process bus for single-node deployments

pub mod backoff;
pub mod memory;
pub mod redis;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::errors::BrokerError;

pub use backoff::{Backoff, BackoffConfig};
pub use memory::{MemoryBroker, MemoryBus};
pub use redis::RedisBroker;

/// Buffer size for the broker event stream.
pub const EVENT_CHANNEL_BUFFER: usize = 1024;

/// Something the broker tells the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// A message delivered on a subscribed channel.
    Message { channel: String, payload: Bytes },
    /// The subscriber link was lost. Subscriptions held by the broker are gone.
    Disconnected,
    /// The subscriber link is back; nothing is subscribed on it yet.
    Reconnected,
}

/// The single delivery stream of a broker.
pub type BrokerEvents = mpsc::Receiver<BrokerEvent>;

/// Broker command interface.
///
/// Implementations guarantee at most one active subscription per channel per
/// instance (re-subscribing an active channel is harmless) and preserve
/// delivery order within a channel. Delivery is best-effort.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Start receiving messages published on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError>;

    /// Stop receiving messages published on `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;
}

/// Observable state of the broker link.
///
/// Updated by the bridge as it consumes [`BrokerEvent`]s; read by the
/// readiness probe.
#[derive(Debug)]
pub struct BrokerStatus {
    connected: AtomicBool,
    reconnects: AtomicU64,
}

impl BrokerStatus {
    /// Create a status that starts connected (brokers are connected before
    /// they are handed to the bridge).
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            reconnects: AtomicU64::new(0),
        })
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn mark_reconnected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_status_transitions() {
        let status = BrokerStatus::new();
        assert!(status.is_connected());
        assert_eq!(status.reconnect_count(), 0);

        status.mark_disconnected();
        assert!(!status.is_connected());

        status.mark_reconnected();
        assert!(status.is_connected());
        assert_eq!(status.reconnect_count(), 1);
    }
}
