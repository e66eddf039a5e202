//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use crate::connection::ConnectionRegistry;
use crate::room::RoomRegistry;

/// Validate that room membership agrees with each connection's room set
pub fn assert_membership_invariants(connections: &ConnectionRegistry, rooms: &RoomRegistry) {
    if !cfg!(debug_assertions) {
        return;
    }

    for (room, members) in rooms.iter() {
        // Rooms are pruned when empty
        debug_assert!(!members.is_empty(), "Room {} is empty but still registered", room);

        for id in members {
            let conn = connections.lookup(id);
            debug_assert!(conn.is_some(), "Room {} lists unknown client {}", room, id);
            if let Some(conn) = conn {
                debug_assert!(
                    conn.rooms.contains(room),
                    "Client {} is in room {} but does not list it",
                    id,
                    room
                );
            }
        }
    }

    for conn in connections.iter() {
        for room in &conn.rooms {
            debug_assert!(
                rooms.contains(room, &conn.id),
                "Client {} lists room {} but is not a member",
                conn.id,
                room
            );
        }
    }
}
