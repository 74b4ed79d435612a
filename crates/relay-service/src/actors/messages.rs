//! Message types for the subscription hub.
//!
//! Requests travel over `tokio::sync::mpsc`; replies come back on a
//! `tokio::sync::oneshot` carried in the message.

use tokio::sync::oneshot;

use super::metrics::MailboxLevel;
use crate::errors::RelayError;
use crate::registry::{ConnectionHandle, ConnectionId};

/// Messages sent to the `SubscriptionHub`.
#[derive(Debug)]
pub enum HubMessage {
    /// Bind a new connection's send handle and allocate its identity.
    Register {
        handle: ConnectionHandle,
        respond_to: oneshot::Sender<ConnectionId>,
    },

    /// Join a room. Replies `Ok(false)` if the connection was already a member.
    Subscribe {
        connection_id: ConnectionId,
        room: String,
        respond_to: oneshot::Sender<Result<bool, RelayError>>,
    },

    /// Leave a room. Replies `Ok(false)` if the connection was not a member.
    Unsubscribe {
        connection_id: ConnectionId,
        room: String,
        respond_to: oneshot::Sender<Result<bool, RelayError>>,
    },

    /// Remove a connection and leave every room it was in.
    ///
    /// Replies with the rooms it left, or `None` if it was already gone.
    Deregister {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Option<Vec<String>>>,
    },

    /// The rooms a connection is in, sorted.
    GetRooms {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Option<Vec<String>>>,
    },

    /// The members of a room.
    GetMembers {
        room: String,
        respond_to: oneshot::Sender<Vec<ConnectionId>>,
    },

    /// Current counts (for health checks and tests).
    GetStatus {
        respond_to: oneshot::Sender<HubStatus>,
    },
}

/// Hub status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStatus {
    /// Registered connections.
    pub connections: usize,
    /// Rooms with at least one local member.
    pub rooms: usize,
    /// Highest mailbox depth seen since the hub started.
    pub mailbox_peak: usize,
    /// Mailbox depth band at the time of the request.
    pub mailbox_level: MailboxLevel,
}
