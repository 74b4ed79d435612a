//! `SubscriptionHub` - the single writer for connection and room state.
//!
//! The hub exclusively owns the [`ConnectionRegistry`] and the [`RoomIndex`].
//! Every mutation (register, deregister, subscribe, unsubscribe) is one
//! message, handled to completion before the next one is taken, so:
//!
//! - registry and index always agree on who is in which room,
//! - join/leave transitions are computed against a consistent count,
//! - the broker transitions a step produces are enqueued on the bridge before
//!   the step ends, which keeps each room's lane in mutation order.
//!
//! After each join/leave the hub republishes the room's member list into the
//! shared [`MembershipView`] used by fan-out.
//!
//! Message handling never awaits: broker round trips happen on the bridge's
//! lanes, not here.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::messages::{HubMessage, HubStatus};
use super::metrics::MailboxMonitor;
use crate::bridge::BrokerBridge;
use crate::errors::RelayError;
use crate::membership::{Member, MembershipView};
use crate::observability::metrics;
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::rooms::RoomIndex;

/// Default channel buffer size for the hub mailbox.
const HUB_CHANNEL_BUFFER: usize = 1000;

/// Handle to the `SubscriptionHub`.
///
/// Cheap to clone; every clone talks to the same actor.
#[derive(Clone)]
pub struct SubscriptionHubHandle {
    sender: mpsc::Sender<HubMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl SubscriptionHubHandle {
    /// Spawn the hub actor and return a handle to it.
    ///
    /// The hub publishes membership into the bridge's view and enqueues its
    /// broker transitions on `bridge`. It stops when `cancel_token` is
    /// cancelled.
    #[must_use]
    pub fn new(bridge: BrokerBridge, cancel_token: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel(HUB_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new());

        let actor = SubscriptionHub {
            registry: ConnectionRegistry::new(),
            rooms: RoomIndex::new(),
            view: bridge.view().clone(),
            bridge,
            receiver,
            cancel_token: cancel_token.clone(),
            mailbox: Arc::clone(&mailbox),
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    /// Register a connection's send handle. Never fails while the hub runs.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<ConnectionId, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::Register {
            handle,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Add `room` to the connection's rooms. `Ok(false)` if already a member.
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        room: String,
    ) -> Result<bool, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::Subscribe {
            connection_id,
            room,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove `room` from the connection's rooms. `Ok(false)` if not a member.
    pub async fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        room: String,
    ) -> Result<bool, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::Unsubscribe {
            connection_id,
            room,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove the connection from the registry and from every room it was in.
    ///
    /// Returns the rooms it left; `None` on repeated calls.
    pub async fn deregister(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<Vec<String>>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::Deregister {
            connection_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// The rooms a connection is in, sorted. `None` if not registered.
    pub async fn rooms_of(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<Vec<String>>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::GetRooms {
            connection_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// The members of a room, in no particular order.
    pub async fn members_of(&self, room: String) -> Result<Vec<ConnectionId>, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::GetMembers {
            room,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Current connection and room counts.
    pub async fn get_status(&self) -> Result<HubStatus, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::GetStatus { respond_to: tx }).await?;
        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop the hub.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: HubMessage) -> Result<(), RelayError> {
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|e| {
            self.mailbox.record_dequeue();
            RelayError::Internal(format!("channel send failed: {e}"))
        })
    }
}

/// The actor behind [`SubscriptionHubHandle`].
struct SubscriptionHub {
    registry: ConnectionRegistry,
    rooms: RoomIndex,
    view: MembershipView,
    bridge: BrokerBridge,
    receiver: mpsc::Receiver<HubMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl SubscriptionHub {
    #[instrument(skip_all, name = "relay.actor.hub")]
    async fn run(mut self) {
        info!(target: "relay.actor.hub", "SubscriptionHub started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor.hub",
                        "SubscriptionHub received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message);
                            self.mailbox.record_processed();
                        }
                        None => {
                            info!(
                                target: "relay.actor.hub",
                                "SubscriptionHub channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor.hub",
            connections_remaining = self.registry.len(),
            rooms_remaining = self.rooms.room_count(),
            messages_processed = self.mailbox.messages_processed(),
            "SubscriptionHub stopped"
        );
    }

    fn handle_message(&mut self, message: HubMessage) {
        match message {
            HubMessage::Register { handle, respond_to } => {
                let connection_id = self.register(handle);
                let _ = respond_to.send(connection_id);
            }

            HubMessage::Subscribe {
                connection_id,
                room,
                respond_to,
            } => {
                let result = self.subscribe(connection_id, &room);
                let _ = respond_to.send(result);
            }

            HubMessage::Unsubscribe {
                connection_id,
                room,
                respond_to,
            } => {
                let result = self.unsubscribe(connection_id, &room);
                let _ = respond_to.send(result);
            }

            HubMessage::Deregister {
                connection_id,
                respond_to,
            } => {
                let rooms = self.deregister(connection_id);
                let _ = respond_to.send(rooms);
            }

            HubMessage::GetRooms {
                connection_id,
                respond_to,
            } => {
                let rooms = self
                    .registry
                    .rooms_of(connection_id)
                    .map(|rooms| rooms.iter().cloned().collect());
                let _ = respond_to.send(rooms);
            }

            HubMessage::GetMembers { room, respond_to } => {
                let _ = respond_to.send(self.rooms.members_of(&room));
            }

            HubMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(HubStatus {
                    connections: self.registry.len(),
                    rooms: self.rooms.room_count(),
                    mailbox_peak: self.mailbox.peak_depth(),
                    mailbox_level: self.mailbox.current_level(),
                });
            }
        }
    }

    fn register(&mut self, handle: ConnectionHandle) -> ConnectionId {
        let connection_id = self.registry.register(handle);
        metrics::set_connections_active(self.registry.len());
        debug!(
            target: "relay.actor.hub",
            connection_id = %connection_id,
            connections = self.registry.len(),
            "Connection registered"
        );
        connection_id
    }

    fn subscribe(&mut self, connection_id: ConnectionId, room: &str) -> Result<bool, RelayError> {
        if !self.registry.add_room(connection_id, room)? {
            return Ok(false);
        }

        let outcome = self.rooms.join(room, connection_id);
        self.publish_members(room);

        if outcome.was_first {
            self.bridge.ensure_subscribed(room);
            metrics::set_rooms_active(self.rooms.room_count());
        }

        debug!(
            target: "relay.actor.hub",
            connection_id = %connection_id,
            room = %room,
            first = outcome.was_first,
            "Joined room"
        );
        Ok(true)
    }

    fn unsubscribe(&mut self, connection_id: ConnectionId, room: &str) -> Result<bool, RelayError> {
        if !self.registry.contains(connection_id) {
            return Err(RelayError::UnknownConnection(connection_id));
        }

        let outcome = self.rooms.leave(room, connection_id);
        if !self.registry.remove_room(connection_id, room)? {
            return Ok(false);
        }

        self.publish_members(room);
        if outcome.was_last {
            self.bridge.ensure_unsubscribed(room);
            metrics::set_rooms_active(self.rooms.room_count());
        }

        debug!(
            target: "relay.actor.hub",
            connection_id = %connection_id,
            room = %room,
            last = outcome.was_last,
            "Left room"
        );
        Ok(true)
    }

    /// Full cleanup of one connection, as a single step.
    fn deregister(&mut self, connection_id: ConnectionId) -> Option<Vec<String>> {
        let Some(rooms) = self.registry.deregister(connection_id) else {
            debug!(
                target: "relay.actor.hub",
                connection_id = %connection_id,
                "Deregister of unknown connection ignored"
            );
            return None;
        };

        let mut emptied = 0usize;
        for room in &rooms {
            let outcome = self.rooms.leave(room, connection_id);
            self.publish_members(room);
            if outcome.was_last {
                self.bridge.ensure_unsubscribed(room);
                emptied += 1;
            }
        }

        metrics::set_connections_active(self.registry.len());
        metrics::set_rooms_active(self.rooms.room_count());

        debug!(
            target: "relay.actor.hub",
            connection_id = %connection_id,
            rooms_left = rooms.len(),
            rooms_emptied = emptied,
            "Connection deregistered"
        );

        Some(rooms.into_iter().collect())
    }

    /// Replace the room's fan-out snapshot with its current members.
    fn publish_members(&self, room: &str) {
        let members: Vec<Member> = self
            .rooms
            .members_of(room)
            .into_iter()
            .filter_map(|id| match self.registry.handle(id) {
                Some(handle) => Some(Member {
                    id,
                    handle: handle.clone(),
                }),
                None => {
                    // Registry and index disagree; fan-out skips the orphan.
                    warn!(
                        target: "relay.actor.hub",
                        connection_id = %id,
                        room = %room,
                        "Room member missing from registry"
                    );
                    None
                }
            })
            .collect();
        self.view.publish(room, members);
    }
}
