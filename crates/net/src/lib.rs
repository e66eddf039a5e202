//! Switchboard Network Library
//!
//! A WebSocket server written directly against byte streams: handshake,
//! frame codec, connection and room registries, event router and the reactor
//! that drives them.
//!
//! # Architecture
//!
//! - **Frame**: single-frame WebSocket codec (masked in, unmasked out)
//! - **Handshake**: HTTP upgrade negotiation
//! - **Registries**: client ids to connections, rooms to members
//! - **Router**: event name to ordered handlers
//! - **Server**: the reactor loop; owns all of the above
//!
//! # Usage
//!
//! ```ignore
//! let mut server = Server::bind("0.0.0.0:8080", ServerOptions::default()).await?;
//!
//! server.on("join_room", |client_id, payload, server| {
//!     let room = payload["room"].as_str().unwrap_or("general");
//!     server.join_room(client_id, room)?;
//!     server.send_to_room(room, json!({ "event": "user_joined", "client_id": client_id }), None);
//!     Ok(())
//! });
//!
//! let running = server.start();
//! // ...
//! running.stop().await;
//! ```

pub mod client;
pub mod connection;
pub mod error;
pub mod frame;
mod handle;
pub mod handshake;
mod invariants;
pub mod protocol;
pub mod room;
pub mod router;
pub mod server;
pub mod transport;

pub use client::{Client, WsUrl};
pub use connection::{ClientId, ClientInfo, ConnectionRegistry, ConnectionState};
pub use error::{Error, HandlerError, HandlerResult, Result};
pub use handle::ServerHandle;
pub use protocol::{Envelope, OutboundMessage, CONNECTION_EVENT, DISCONNECT_EVENT, MESSAGE_EVENT};
pub use room::RoomRegistry;
pub use router::{DispatchReport, EventRouter};
pub use server::{FrameErrorPolicy, RunningServer, Server, ServerOptions};
pub use transport::{memory_listener, Listener, MemoryConnector, MemoryListener};
