//! Room registry
//!
//! Rooms are created on first join and pruned when their last member leaves.
//! Membership is stored on both sides: the room's member set here, and the
//! room-name set on each [`ClientConnection`](crate::connection::ClientConnection).
//! Every mutation updates both.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::connection::{ClientId, ConnectionRegistry};
use crate::error::{Error, Result};
use crate::invariants::assert_membership_invariants;

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, BTreeSet<ClientId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client to a room. Returns false if it was already a member.
    pub fn join(
        &mut self,
        connections: &mut ConnectionRegistry,
        id: &ClientId,
        room: &str,
    ) -> Result<bool> {
        let conn = connections
            .lookup_mut(id)
            .ok_or_else(|| Error::UnknownClient(id.clone()))?;

        let added = self
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(id.clone());
        conn.rooms.insert(room.to_string());

        if added {
            debug!(client_id = %id, room = %room, "Joined room");
        }
        assert_membership_invariants(connections, self);
        Ok(added)
    }

    /// Remove a client from a room. Returns false if it was not a member.
    pub fn leave(&mut self, connections: &mut ConnectionRegistry, id: &ClientId, room: &str) -> bool {
        let removed = self.detach(id, room);
        if let Some(conn) = connections.lookup_mut(id) {
            conn.rooms.remove(room);
        }

        if removed {
            debug!(client_id = %id, room = %room, "Left room");
        }
        assert_membership_invariants(connections, self);
        removed
    }

    /// Remove a client from every room it belongs to
    pub fn remove_client(&mut self, connections: &mut ConnectionRegistry, id: &ClientId) {
        let rooms = match connections.lookup_mut(id) {
            Some(conn) => std::mem::take(&mut conn.rooms),
            None => return,
        };
        for room in &rooms {
            self.detach(id, room);
        }
        assert_membership_invariants(connections, self);
    }

    /// Current members of a room (empty if the room does not exist)
    pub fn members_of(&self, room: &str) -> BTreeSet<ClientId> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn contains(&self, room: &str, id: &ClientId) -> bool {
        self.rooms.get(room).is_some_and(|members| members.contains(id))
    }

    /// Rooms a client belongs to, according to this registry
    pub fn rooms_of(&self, id: &ClientId) -> BTreeSet<String> {
        self.rooms
            .iter()
            .filter(|(_, members)| members.contains(id))
            .map(|(room, _)| room.clone())
            .collect()
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<ClientId>)> {
        self.rooms.iter()
    }

    fn detach(&mut self, id: &ClientId, room: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }
}
