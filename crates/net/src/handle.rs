//! Server handle passed to every event handler
//!
//! The reactor owns [`ReactorState`]; handlers borrow it through a
//! [`ServerHandle`] for the duration of one call. Sends only queue frames, so
//! a handler never waits on a peer.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::{ClientId, ClientInfo, ConnectionRegistry, Outbound};
use crate::error::{Error, Result};
use crate::frame::{self, Opcode, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use crate::protocol::OutboundMessage;
use crate::room::RoomRegistry;

/// A connection the reactor should tear down after the current dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingClose {
    pub id: ClientId,
    pub code: u16,
    pub reason: String,
}

/// Registries owned by the reactor
#[derive(Default)]
pub(crate) struct ReactorState {
    pub connections: ConnectionRegistry,
    pub rooms: RoomRegistry,
    pub pending_close: Vec<PendingClose>,
}

impl ReactorState {
    pub fn schedule_close(&mut self, id: &ClientId, code: u16, reason: impl Into<String>) {
        if self.is_closing(id) {
            return;
        }
        self.pending_close.push(PendingClose {
            id: id.clone(),
            code,
            reason: reason.into(),
        });
    }

    /// Whether a close is already scheduled for this client
    pub fn is_closing(&self, id: &ClientId) -> bool {
        self.pending_close.iter().any(|p| &p.id == id)
    }

    /// Queue pre-encoded frame bytes for one client
    pub fn deliver(&mut self, id: &ClientId, bytes: &[u8]) -> bool {
        let Some(conn) = self.connections.lookup(id) else {
            return false;
        };
        match conn.queue(Outbound::Frame(bytes.to_vec())) {
            Ok(()) => true,
            Err(Error::QueueFull) => {
                warn!(client_id = %id, "Outbound queue full, closing slow peer");
                self.schedule_close(id, CLOSE_POLICY_VIOLATION, "outbound queue full");
                false
            }
            Err(e) => {
                debug!(client_id = %id, error = %e, "Failed to queue message for client");
                self.schedule_close(id, CLOSE_NORMAL, "");
                false
            }
        }
    }
}

/// Operations available to event handlers
pub struct ServerHandle<'a> {
    state: &'a mut ReactorState,
}

impl<'a> ServerHandle<'a> {
    pub(crate) fn new(state: &'a mut ReactorState) -> Self {
        Self { state }
    }

    /// Send a message to one client. Returns false if it is not connected.
    pub fn send(&mut self, client_id: &ClientId, message: impl Into<OutboundMessage>) -> bool {
        let bytes = encode_text(message.into());
        self.state.deliver(client_id, &bytes)
    }

    /// Send a message to every client except `exclude`. Returns the number queued.
    pub fn broadcast(
        &mut self,
        message: impl Into<OutboundMessage>,
        exclude: Option<&ClientId>,
    ) -> usize {
        let bytes = encode_text(message.into());
        self.state
            .connections
            .ids()
            .into_iter()
            .filter(|id| Some(id) != exclude)
            .filter(|id| self.state.deliver(id, &bytes))
            .count()
    }

    /// Send a message to the members of a room except `exclude`
    pub fn send_to_room(
        &mut self,
        room: &str,
        message: impl Into<OutboundMessage>,
        exclude: Option<&ClientId>,
    ) -> usize {
        let members = self.state.rooms.members_of(room);
        if members.is_empty() {
            return 0;
        }
        let bytes = encode_text(message.into());
        members
            .iter()
            .filter(|id| Some(*id) != exclude)
            .filter(|id| self.state.deliver(id, &bytes))
            .count()
    }

    /// Add a client to a room; fails if the client is unknown
    pub fn join_room(&mut self, client_id: &ClientId, room: &str) -> Result<bool> {
        let ReactorState {
            connections, rooms, ..
        } = &mut *self.state;
        rooms.join(connections, client_id, room)
    }

    pub fn leave_room(&mut self, client_id: &ClientId, room: &str) -> bool {
        let ReactorState {
            connections, rooms, ..
        } = &mut *self.state;
        rooms.leave(connections, client_id, room)
    }

    pub fn members_of(&self, room: &str) -> BTreeSet<ClientId> {
        self.state.rooms.members_of(room)
    }

    pub fn client_count(&self) -> usize {
        self.state.connections.count()
    }

    /// Snapshot of every connected client
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.state.connections.snapshot()
    }

    pub fn client(&self, client_id: &ClientId) -> Option<ClientInfo> {
        self.state.connections.lookup(client_id).map(|c| c.info())
    }

    pub fn set_data(&mut self, client_id: &ClientId, key: &str, value: Value) -> Result<()> {
        self.state.connections.set_data(client_id, key, value)
    }

    pub fn data(&self, client_id: &ClientId, key: &str) -> Option<Value> {
        self.state.connections.data(client_id, key).cloned()
    }

    /// Close a client once the current dispatch finishes
    pub fn disconnect(&mut self, client_id: &ClientId) {
        if self.state.connections.contains(client_id) {
            self.state.schedule_close(client_id, CLOSE_NORMAL, "");
        }
    }
}

fn encode_text(message: OutboundMessage) -> Vec<u8> {
    frame::encode(Opcode::Text, message.to_text().as_bytes())
}
