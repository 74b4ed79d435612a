//! Room Membership Index.
//!
//! Per room, the set of locally subscribed connections. The index is the
//! only source of truth for a room's local subscriber count; the
//! `was_first` / `was_last` transition flags it returns are the only signals
//! that drive broker subscribe/unsubscribe.

use std::collections::{HashMap, HashSet};

use crate::registry::ConnectionId;

/// Result of [`RoomIndex::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The room had no members before this join.
    pub was_first: bool,
}

/// Result of [`RoomIndex::leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// This leave removed the room's final member.
    pub was_last: bool,
}

/// Room name -> member connection ids.
///
/// Empty rooms are never stored, so `rooms.len()` is the number of occupied rooms.
#[derive(Debug, Default)]
pub struct RoomIndex {
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl RoomIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to `room`. Joining a room one is already in changes nothing.
    pub fn join(&mut self, room: &str, id: ConnectionId) -> JoinOutcome {
        match self.rooms.get_mut(room) {
            Some(members) => {
                members.insert(id);
                JoinOutcome { was_first: false }
            }
            None => {
                self.rooms.insert(room.to_string(), HashSet::from([id]));
                JoinOutcome { was_first: true }
            }
        }
    }

    /// Remove `id` from `room`.
    pub fn leave(&mut self, room: &str, id: ConnectionId) -> LeaveOutcome {
        let Some(members) = self.rooms.get_mut(room) else {
            return LeaveOutcome { was_last: false };
        };
        if !members.remove(&id) {
            return LeaveOutcome { was_last: false };
        }
        if members.is_empty() {
            self.rooms.remove(room);
            return LeaveOutcome { was_last: true };
        }
        LeaveOutcome { was_last: false }
    }

    /// Snapshot of a room's members.
    #[must_use]
    pub fn members_of(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    /// Rooms with at least one local member.
    #[must_use]
    pub fn occupied_rooms(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_first_join_and_last_leave_transitions() {
        let mut index = RoomIndex::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        assert!(index.join("room1", a).was_first);
        assert!(!index.join("room1", b).was_first);
        assert_eq!(index.member_count("room1"), 2);

        assert!(!index.leave("room1", a).was_last);
        assert!(index.leave("room1", b).was_last);
        assert_eq!(index.member_count("room1"), 0);
        assert_eq!(index.room_count(), 0);
    }

    #[test]
    fn test_rejoin_is_not_a_transition() {
        let mut index = RoomIndex::new();
        let a = ConnectionId::new();

        assert!(index.join("room1", a).was_first);
        assert!(!index.join("room1", a).was_first);
        assert_eq!(index.member_count("room1"), 1);
    }

    #[test]
    fn test_leave_by_non_member_is_not_a_transition() {
        let mut index = RoomIndex::new();
        let a = ConnectionId::new();
        let outsider = ConnectionId::new();

        assert!(!index.leave("room1", a).was_last);

        index.join("room1", a);
        assert!(!index.leave("room1", outsider).was_last);
        assert_eq!(index.members_of("room1"), vec![a]);
    }

    #[test]
    fn test_room_is_first_again_after_emptying() {
        let mut index = RoomIndex::new();
        let a = ConnectionId::new();

        index.join("room1", a);
        index.leave("room1", a);
        assert!(index.join("room1", a).was_first);
    }

    #[test]
    fn test_members_and_occupied_rooms() {
        let mut index = RoomIndex::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        index.join("room1", a);
        index.join("room1", b);
        index.join("room2", b);

        let mut members = index.members_of("room1");
        members.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(members, expected);
        assert!(index.members_of("missing").is_empty());

        let mut rooms = index.occupied_rooms();
        rooms.sort();
        assert_eq!(rooms, vec!["room1", "room2"]);
    }
}
