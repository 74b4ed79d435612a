//! Broker Bridge.
//!
//! Translates local room-membership transitions into the broker's per-channel
//! subscription lifecycle, and broker deliveries into local fan-out.
//!
//! # Per-room lanes
//!
//! Broker subscribe/unsubscribe calls suspend on a network round trip, so they
//! are not executed by the hub. The hub enqueues a [`LaneCommand`] onto the
//! room's lane while it is still inside its serialized step; each lane is
//! drained by its own worker task, one command at a time, in enqueue order.
//! Lanes of different rooms run concurrently. A lane is created on demand and
//! retires as soon as it is drained.
//!
//! Because lane order equals hub mutation order, the last transition enqueued
//! for a room is the one that determines its final broker state.
//!
//! # Active set
//!
//! `active` holds the rooms with a live broker subscription. Only lane workers
//! write it, and a room's writes are confined to that room's lane.

mod fanout;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::broker::{Broker, BrokerStatus};
use crate::errors::{BrokerError, RelayError};
use crate::membership::MembershipView;
use crate::observability::metrics;
use crate::protocol::BrokerEnvelope;

/// A broker transition queued on a room's lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneCommand {
    /// Subscribe unless already active.
    Subscribe,
    /// Unsubscribe if active.
    Unsubscribe,
    /// Reconcile with current membership after a broker reconnect: subscribe
    /// (even if marked active) when the room has members, otherwise drop it.
    Resubscribe,
}

/// Bridge between room membership and the broker. Cheap to clone.
#[derive(Clone)]
pub struct BrokerBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    broker: Arc<dyn Broker>,
    view: MembershipView,
    status: Arc<BrokerStatus>,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<LaneCommand>>>,
    active: Mutex<HashSet<String>>,
}

impl BrokerBridge {
    /// Create a bridge over `broker`, reading fan-out membership from `view`.
    ///
    /// Deliveries only flow once [`BrokerBridge::spawn_listener`] is called
    /// with the broker's event stream.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, view: MembershipView, status: Arc<BrokerStatus>) -> Self {
        metrics::set_broker_connected(status.is_connected());
        metrics::set_broker_subscriptions_active(0);
        Self {
            inner: Arc::new(BridgeInner {
                broker,
                view,
                status,
                lanes: Mutex::new(HashMap::new()),
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Queue a subscribe for `room`. Idempotent once executed.
    pub fn ensure_subscribed(&self, room: &str) {
        self.enqueue(room, LaneCommand::Subscribe);
    }

    /// Queue an unsubscribe for `room`. Idempotent once executed.
    pub fn ensure_unsubscribed(&self, room: &str) {
        self.enqueue(room, LaneCommand::Unsubscribe);
    }

    /// Re-establish broker subscriptions after the broker lost its state.
    ///
    /// Covers every room that is occupied now or still marked active; each
    /// lane reconciles against membership at execution time.
    pub fn on_broker_reconnect(&self) {
        let mut rooms: HashSet<String> = self.inner.view.occupied_rooms().into_iter().collect();
        rooms.extend(self.inner.lock_active().iter().cloned());

        info!(
            target: "relay.bridge",
            rooms = rooms.len(),
            "Resubscribing rooms after broker reconnect"
        );

        for room in &rooms {
            self.enqueue(room, LaneCommand::Resubscribe);
        }
    }

    /// Publish `message` to `room` through the broker.
    ///
    /// Nothing is queued locally: while the broker link is down, or if the
    /// broker rejects the publish, the message is dropped and an error is
    /// returned.
    #[instrument(skip_all, fields(room = %room))]
    pub async fn publish(&self, room: &str, message: Value) -> Result<(), RelayError> {
        if !self.inner.status.is_connected() {
            metrics::record_publish_dropped();
            warn!(
                target: "relay.bridge",
                room = %room,
                "Broker link down, dropping publish"
            );
            return Err(BrokerError::Unavailable.into());
        }

        let payload = BrokerEnvelope::encode(room, message)?;
        let size = payload.len();

        match self.inner.broker.publish(room, payload).await {
            Ok(()) => {
                metrics::record_message_published();
                debug!(target: "relay.bridge", room = %room, bytes = size, "Published");
                Ok(())
            }
            Err(e) => {
                metrics::record_publish_dropped();
                warn!(
                    target: "relay.bridge",
                    room = %room,
                    error = %e,
                    "Publish failed, message dropped"
                );
                Err(e.into())
            }
        }
    }

    /// Whether a broker subscription is currently active for `room`.
    #[must_use]
    pub fn is_subscribed(&self, room: &str) -> bool {
        self.inner.lock_active().contains(room)
    }

    /// Rooms with an active broker subscription, sorted.
    #[must_use]
    pub fn active_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.inner.lock_active().iter().cloned().collect();
        rooms.sort();
        rooms
    }

    /// No lane has pending or executing transitions.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.lock_lanes().is_empty()
    }

    #[must_use]
    pub fn status(&self) -> &Arc<BrokerStatus> {
        &self.inner.status
    }

    #[must_use]
    pub fn view(&self) -> &MembershipView {
        &self.inner.view
    }

    fn enqueue(&self, room: &str, command: LaneCommand) {
        let mut lanes = self.inner.lock_lanes();

        if let Some(lane) = lanes.get(room) {
            // The worker only drops its receiver after removing the lane under
            // this same lock, so a present lane always accepts the command.
            if lane.send(command).is_ok() {
                return;
            }
        }

        let (lane, receiver) = mpsc::unbounded_channel();
        // Receiver is alive; cannot fail.
        let _ = lane.send(command);
        lanes.insert(room.to_string(), lane);
        drop(lanes);

        tokio::spawn(run_lane(Arc::clone(&self.inner), room.to_string(), receiver));
    }
}

/// Drain one room's lane, then retire it.
async fn run_lane(
    inner: Arc<BridgeInner>,
    room: String,
    mut receiver: mpsc::UnboundedReceiver<LaneCommand>,
) {
    loop {
        let command = match receiver.try_recv() {
            Ok(command) => command,
            Err(_) => {
                let mut lanes = inner.lock_lanes();
                match receiver.try_recv() {
                    Ok(command) => command,
                    Err(_) => {
                        lanes.remove(&room);
                        return;
                    }
                }
            }
        };
        inner.execute(&room, command).await;
    }
}

impl BridgeInner {
    async fn execute(&self, room: &str, command: LaneCommand) {
        match command {
            LaneCommand::Subscribe => {
                if !self.lock_active().contains(room) {
                    self.subscribe(room).await;
                }
            }
            LaneCommand::Unsubscribe => {
                if self.lock_active().contains(room) {
                    self.unsubscribe(room).await;
                }
            }
            LaneCommand::Resubscribe => {
                if self.view.has_members(room) {
                    self.subscribe(room).await;
                } else if self.lock_active().contains(room) {
                    self.unsubscribe(room).await;
                }
            }
        }
    }

    async fn subscribe(&self, room: &str) {
        match self.broker.subscribe(room).await {
            Ok(()) => {
                let count = {
                    let mut active = self.lock_active();
                    active.insert(room.to_string());
                    active.len()
                };
                metrics::set_broker_subscriptions_active(count);
                debug!(target: "relay.bridge", room = %room, "Broker subscription active");
            }
            Err(e) => {
                // The room stays inactive; a later reconnect reconciles it.
                warn!(
                    target: "relay.bridge",
                    room = %room,
                    error = %e,
                    "Broker subscribe failed"
                );
            }
        }
    }

    async fn unsubscribe(&self, room: &str) {
        if let Err(e) = self.broker.unsubscribe(room).await {
            // A subscription left behind only delivers to an empty room.
            warn!(
                target: "relay.bridge",
                room = %room,
                error = %e,
                "Broker unsubscribe failed"
            );
        }
        let count = {
            let mut active = self.lock_active();
            active.remove(room);
            active.len()
        };
        metrics::set_broker_subscriptions_active(count);
        debug!(target: "relay.bridge", room = %room, "Broker subscription removed");
    }

    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<LaneCommand>>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_active(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::membership::Member;
    use crate::registry::{ConnectionHandle, ConnectionId};
    use std::time::Duration;

    fn bridge() -> (BrokerBridge, Arc<MemoryBroker>) {
        let (broker, _events) = MemoryBroker::standalone();
        let broker = Arc::new(broker);
        let bridge = BrokerBridge::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            MembershipView::new(),
            BrokerStatus::new(),
        );
        (bridge, broker)
    }

    async fn settle(bridge: &BrokerBridge) {
        for _ in 0..200 {
            if bridge.is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(bridge.is_idle(), "bridge lanes did not drain");
    }

    fn occupy(view: &MembershipView, room: &str) {
        view.publish(
            room,
            vec![Member {
                id: ConnectionId::new(),
                handle: ConnectionHandle::channel(1).0,
            }],
        );
    }

    #[tokio::test]
    async fn test_ensure_subscribed_is_idempotent() {
        let (bridge, broker) = bridge();

        bridge.ensure_subscribed("room1");
        bridge.ensure_subscribed("room1");
        settle(&bridge).await;

        assert!(bridge.is_subscribed("room1"));
        assert!(broker.is_subscribed("room1"));
        assert_eq!(bridge.active_rooms(), vec!["room1"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_of_inactive_room_is_noop() {
        let (bridge, broker) = bridge();

        bridge.ensure_unsubscribed("room1");
        settle(&bridge).await;

        assert!(!bridge.is_subscribed("room1"));
        assert!(broker.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_last_enqueued_transition_wins() {
        let (bridge, broker) = bridge();

        for _ in 0..10 {
            bridge.ensure_subscribed("room1");
            bridge.ensure_unsubscribed("room1");
        }
        bridge.ensure_subscribed("room1");
        settle(&bridge).await;
        assert!(broker.is_subscribed("room1"));

        bridge.ensure_unsubscribed("room1");
        settle(&bridge).await;
        assert!(!broker.is_subscribed("room1"));
        assert!(!bridge.is_subscribed("room1"));
    }

    #[tokio::test]
    async fn test_resubscribe_reconciles_with_membership() {
        let (bridge, broker) = bridge();
        occupy(bridge.view(), "occupied");

        bridge.ensure_subscribed("occupied");
        bridge.ensure_subscribed("stale");
        settle(&bridge).await;

        bridge.on_broker_reconnect();
        settle(&bridge).await;

        assert_eq!(bridge.active_rooms(), vec!["occupied"]);
        assert_eq!(broker.subscriptions(), vec!["occupied"]);
    }

    #[tokio::test]
    async fn test_publish_drops_while_disconnected() {
        let (bridge, _broker) = bridge();
        bridge.status().mark_disconnected();

        let err = bridge
            .publish("room1", Value::String("hi".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Broker(BrokerError::Unavailable)));
    }
}
