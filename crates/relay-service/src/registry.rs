//! Connection Registry.
//!
//! Owns the mapping from connection identity to its live send handle and the
//! set of rooms the connection currently subscribes to. The registry is plain
//! data: it is owned exclusively by the subscription hub actor, which is the
//! only writer (see [`crate::actors::hub`]).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::errors::RelayError;

/// Unique, collision-resistant connection identity (random UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// A payload published to a room the connection is a member of.
    ///
    /// Shared across all recipients of one fan-out.
    Delivery(Arc<str>),
    /// A rejected request, rendered as `{ "kind": "error", "reason": ... }`.
    Error { reason: String },
}

/// Why a non-blocking delivery did not reach a connection's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The connection's outbound queue is full (slow consumer).
    QueueFull,
    /// The connection's writer has gone away.
    Closed,
}

impl DeliveryFailure {
    /// Bounded label for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeliveryFailure::QueueFull => "queue_full",
            DeliveryFailure::Closed => "closed",
        }
    }
}

/// Opaque send handle bound to one connection.
///
/// Cheap to clone; every clone feeds the same bounded outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<OutboundFrame>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }

    /// Queue a frame without waiting. Used on the fan-out path, which must
    /// never block on a single slow connection.
    pub fn try_deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryFailure> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryFailure::QueueFull,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    /// Queue a frame, waiting for queue space. Used for replies to the
    /// connection's own requests.
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), DeliveryFailure> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| DeliveryFailure::Closed)
    }

    /// Whether the receiving side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Registry row for one connection.
#[derive(Debug)]
struct ConnectionEntry {
    handle: ConnectionHandle,
    rooms: BTreeSet<String>,
}

/// Connection identity -> send handle and current room set.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh identity with an empty room set and bind the handle.
    pub fn register(&mut self, handle: ConnectionHandle) -> ConnectionId {
        let mut id = ConnectionId::new();
        while self.connections.contains_key(&id) {
            id = ConnectionId::new();
        }
        self.connections.insert(
            id,
            ConnectionEntry {
                handle,
                rooms: BTreeSet::new(),
            },
        );
        id
    }

    /// Remove the connection and return its prior room set.
    ///
    /// Returns `None` if the connection was already removed.
    pub fn deregister(&mut self, id: ConnectionId) -> Option<BTreeSet<String>> {
        self.connections.remove(&id).map(|entry| entry.rooms)
    }

    /// Add `room` to the connection's set. Returns `false` if already present.
    pub fn add_room(&mut self, id: ConnectionId, room: &str) -> Result<bool, RelayError> {
        let entry = self
            .connections
            .get_mut(&id)
            .ok_or(RelayError::UnknownConnection(id))?;
        if entry.rooms.contains(room) {
            return Ok(false);
        }
        entry.rooms.insert(room.to_string());
        Ok(true)
    }

    /// Remove `room` from the connection's set. Returns `false` if absent.
    pub fn remove_room(&mut self, id: ConnectionId, room: &str) -> Result<bool, RelayError> {
        let entry = self
            .connections
            .get_mut(&id)
            .ok_or(RelayError::UnknownConnection(id))?;
        Ok(entry.rooms.remove(room))
    }

    /// The send handle bound to a connection.
    #[must_use]
    pub fn handle(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections.get(&id).map(|entry| &entry.handle)
    }

    /// The rooms a connection currently subscribes to.
    #[must_use]
    pub fn rooms_of(&self, id: ConnectionId) -> Option<&BTreeSet<String>> {
        self.connections.get(&id).map(|entry| &entry.rooms)
    }

    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
