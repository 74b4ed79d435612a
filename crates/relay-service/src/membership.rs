//! Point-in-time membership snapshots for fan-out.
//!
//! The subscription hub is the only writer: after each complete join/leave it
//! replaces the affected room's member list with a fresh `Arc<[Member]>`.
//! Readers clone the `Arc` under a short read lock and iterate without holding
//! it, so they never see a half-applied mutation and never block the hub for
//! longer than a map lookup.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::registry::{ConnectionHandle, ConnectionId};

/// One room member as seen by fan-out.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: ConnectionId,
    pub handle: ConnectionHandle,
}

/// Shared, read-mostly room -> members table.
#[derive(Debug, Clone, Default)]
pub struct MembershipView {
    rooms: Arc<RwLock<HashMap<String, Arc<[Member]>>>>,
}

impl MembershipView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a room's members, `None` if the room has none.
    #[must_use]
    pub fn members_of(&self, room: &str) -> Option<Arc<[Member]>> {
        self.read().get(room).cloned()
    }

    #[must_use]
    pub fn has_members(&self, room: &str) -> bool {
        self.read().contains_key(room)
    }

    /// Rooms with at least one local member.
    #[must_use]
    pub fn occupied_rooms(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Replace a room's member list. An empty list removes the room.
    pub(crate) fn publish(&self, room: &str, members: Vec<Member>) {
        let mut rooms = self.write();
        if members.is_empty() {
            rooms.remove(room);
        } else {
            rooms.insert(room.to_string(), Arc::from(members));
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<[Member]>>> {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<[Member]>>> {
        self.rooms.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn member() -> Member {
        Member {
            id: ConnectionId::new(),
            handle: ConnectionHandle::channel(1).0,
        }
    }

    #[test]
    fn test_publish_and_read_snapshot() {
        let view = MembershipView::new();
        let a = member();
        let b = member();

        view.publish("room1", vec![a.clone(), b.clone()]);
        let snapshot = view.members_of("room1").unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(view.has_members("room1"));

        // Later updates do not change an already taken snapshot.
        view.publish("room1", vec![b]);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(view.members_of("room1").unwrap().len(), 1);
    }

    #[test]
    fn test_empty_list_removes_room() {
        let view = MembershipView::new();
        view.publish("room1", vec![member()]);
        view.publish("room1", Vec::new());

        assert!(view.members_of("room1").is_none());
        assert!(!view.has_members("room1"));
        assert!(view.occupied_rooms().is_empty());
    }
}
