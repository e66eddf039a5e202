//! Connection registry
//!
//! Maps opaque client ids to live connections. Owned by the reactor; nothing
//! here locks.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque client identifier, unique among live connections
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        ClientId(format!("client_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(s.to_string())
    }
}

/// Reactor-assigned handle for an accepted transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Work item for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-encoded frame bytes
    Frame(Vec<u8>),
    /// Send a close frame and stop writing
    Close { code: u16, reason: String },
}

/// The transport side of a connection as handed to the registry
pub struct ClientTransport {
    pub id: TransportId,
    pub peer: String,
    pub outbound: mpsc::Sender<Outbound>,
    pub reader: Option<AbortHandle>,
    pub writer: Option<JoinHandle<()>>,
}

impl ClientTransport {
    /// A transport with no I/O tasks attached
    pub fn detached(id: TransportId, peer: impl Into<String>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            peer: peer.into(),
            outbound,
            reader: None,
            writer: None,
        }
    }
}

/// A live client connection
pub struct ClientConnection {
    pub id: ClientId,
    pub transport: TransportId,
    pub peer: String,
    pub state: ConnectionState,
    /// Room names this client belongs to (back references)
    pub rooms: BTreeSet<String>,
    pub data: Map<String, Value>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: Instant,
    outbound: mpsc::Sender<Outbound>,
    reader: Option<AbortHandle>,
    writer: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Queue work for the writer without waiting
    pub fn queue(&self, item: Outbound) -> Result<()> {
        self.outbound.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Closed(_) => Error::ConnectionClosed,
        })
    }

    /// Stop reading and hand back the writer so the caller can wait for it to drain
    pub fn release(mut self) -> Option<JoinHandle<()>> {
        self.state = ConnectionState::Closed;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer.take()
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id.clone(),
            peer: self.peer.clone(),
            rooms: self.rooms.iter().cloned().collect(),
            data: self.data.clone(),
            connected_at: self.connected_at,
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Owned copy of a connection's public state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub peer: String,
    pub rooms: Vec<String>,
    pub data: Map<String, Value>,
    pub connected_at: DateTime<Utc>,
}

/// Registry of live connections
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: HashMap<ClientId, ClientConnection>,
    by_transport: HashMap<TransportId, ClientId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an upgraded transport and return its new id
    pub fn register(&mut self, transport: ClientTransport) -> ClientId {
        let mut id = ClientId::generate();
        while self.clients.contains_key(&id) {
            id = ClientId::generate();
        }

        self.by_transport.insert(transport.id, id.clone());
        self.clients.insert(
            id.clone(),
            ClientConnection {
                id: id.clone(),
                transport: transport.id,
                peer: transport.peer,
                state: ConnectionState::Open,
                rooms: BTreeSet::new(),
                data: Map::new(),
                connected_at: Utc::now(),
                last_activity: Instant::now(),
                outbound: transport.outbound,
                reader: transport.reader,
                writer: transport.writer,
            },
        );
        id
    }

    pub fn lookup(&self, id: &ClientId) -> Option<&ClientConnection> {
        self.clients.get(id)
    }

    pub fn lookup_mut(&mut self, id: &ClientId) -> Option<&mut ClientConnection> {
        self.clients.get_mut(id)
    }

    /// Resolve a transport event back to its client
    pub fn lookup_by_transport(&self, transport: TransportId) -> Option<&ClientId> {
        self.by_transport.get(&transport)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Remove a connection. Room membership must already be cleared.
    pub fn remove(&mut self, id: &ClientId) -> Option<ClientConnection> {
        let conn = self.clients.remove(id)?;
        self.by_transport.remove(&conn.transport);
        Some(conn)
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientConnection> {
        self.clients.values()
    }

    /// Ids of every live connection, safe to iterate while removing
    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().cloned().collect()
    }

    /// Copy of every connection's public state; order unspecified
    pub fn snapshot(&self) -> Vec<ClientInfo> {
        self.clients.values().map(ClientConnection::info).collect()
    }

    /// Record inbound activity for idle tracking
    pub fn touch(&mut self, id: &ClientId) {
        if let Some(conn) = self.clients.get_mut(id) {
            conn.last_activity = Instant::now();
        }
    }

    /// Store a value in a client's data bag
    pub fn set_data(&mut self, id: &ClientId, key: impl Into<String>, value: Value) -> Result<()> {
        let conn = self
            .clients
            .get_mut(id)
            .ok_or_else(|| Error::UnknownClient(id.clone()))?;
        conn.data.insert(key.into(), value);
        Ok(())
    }

    pub fn data(&self, id: &ClientId, key: &str) -> Option<&Value> {
        self.clients.get(id)?.data.get(key)
    }
}
