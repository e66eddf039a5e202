//! WebSocket server reactor
//!
//! One reactor task owns every registry. Per-connection tasks only move
//! bytes: a reader runs the handshake and forwards whatever it reads, a
//! writer drains the connection's outbound queue. The reactor waits on the
//! listener, the transport event queue, the shutdown signal and a
//! housekeeping tick.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::connection::{ClientId, ClientTransport, ConnectionState, Outbound, TransportId};
use crate::error::{HandlerResult, Result};
use crate::frame::{
    self, close_code, close_payload, Frame, FrameError, Opcode, CLOSE_GOING_AWAY, CLOSE_NORMAL,
    CLOSE_PROTOCOL_ERROR,
};
use crate::handle::{ReactorState, ServerHandle};
use crate::handshake::{self, HandshakeError};
use crate::protocol::{CONNECTION_EVENT, DISCONNECT_EVENT};
use crate::router::EventRouter;
use crate::transport::{Listener, Transport};

/// Capacity of the queue from connection tasks to the reactor
const EVENT_QUEUE_SIZE: usize = 1024;

/// What to do with a connection that sent an undecodable frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameErrorPolicy {
    /// Drop the bytes and keep the connection open
    Drop,
    /// Close the connection with a protocol error
    #[default]
    Close,
}

/// Reactor tuning
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Live plus handshaking connections allowed at once
    pub max_clients: usize,
    /// Close connections with no inbound traffic for this long
    pub idle_timeout: Option<Duration>,
    /// Housekeeping tick
    pub poll_interval: Duration,
    pub read_buffer_size: usize,
    /// Frames queued per connection before it counts as a slow peer
    pub outbound_capacity: usize,
    pub handshake_timeout: Duration,
    /// How long shutdown waits for writers to drain
    pub shutdown_grace: Duration,
    pub frame_error_policy: FrameErrorPolicy,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_clients: 100,
            idle_timeout: Some(Duration::from_secs(300)),
            poll_interval: Duration::from_millis(200),
            read_buffer_size: 64 * 1024,
            outbound_capacity: 256,
            handshake_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            frame_error_policy: FrameErrorPolicy::Close,
        }
    }
}

/// Messages from connection tasks to the reactor
enum TransportEvent {
    Opened {
        transport: TransportId,
        peer: String,
        outbound: mpsc::Sender<Outbound>,
        writer: JoinHandle<()>,
    },
    Rejected {
        transport: TransportId,
        error: HandshakeError,
    },
    Data {
        transport: TransportId,
        bytes: Vec<u8>,
    },
    Closed {
        transport: TransportId,
        error: Option<io::Error>,
    },
}

/// A transport that has not finished its handshake
struct PendingTransport {
    abort: AbortHandle,
    state: ConnectionState,
    accepted_at: Instant,
}

/// Server builder: register handlers, then start
pub struct Server<L: Listener = TcpListener> {
    listener: L,
    options: ServerOptions,
    router: EventRouter,
}

impl Server<TcpListener> {
    /// Bind a TCP listener
    pub async fn bind(addr: impl ToSocketAddrs, options: ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, max_clients = options.max_clients, "Server listening");

        Ok(Self::with_listener(listener, options))
    }
}

impl<L: Listener> Server<L> {
    pub fn with_listener(listener: L, options: ServerOptions) -> Self {
        Self {
            listener,
            options,
            router: EventRouter::new(),
        }
    }

    /// Register an event handler
    pub fn on<F>(&mut self, event: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&ClientId, &Value, &mut ServerHandle<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.router.on(event, handler);
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the reactor and return a handle to stop it
    pub fn start(self) -> RunningServer {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let addr = self.local_addr();
        let task = tokio::spawn(self.run(shutdown_rx));

        RunningServer {
            addr,
            shutdown_tx,
            task,
        }
    }

    /// Run the reactor until the shutdown signal fires
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let Server {
            mut listener,
            options,
            router,
        } = self;

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let mut tick = tokio::time::interval(options.poll_interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut reactor = Reactor {
            options,
            router,
            state: ReactorState::default(),
            pending: HashMap::new(),
            next_transport: 0,
            events_tx,
        };

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Reactor shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((transport, peer)) => reactor.admit(transport, peer),
                        Err(e) => error!(error = %e, "Accept failed"),
                    }
                }
                Some(event) = events_rx.recv() => {
                    reactor.handle_event(event);
                }
                _ = tick.tick() => {
                    reactor.housekeeping();
                }
            }
        }

        reactor.shutdown().await;
    }
}

/// Handle to a spawned server
pub struct RunningServer {
    addr: Option<SocketAddr>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Ask the reactor to close every connection and stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Server shutdown initiated");
    }

    /// Wait for the reactor to finish
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "Reactor task failed");
        }
    }

    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

struct Reactor {
    options: ServerOptions,
    router: EventRouter,
    state: ReactorState,
    pending: HashMap<TransportId, PendingTransport>,
    next_transport: u64,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl Reactor {
    /// Accept a raw transport and start its handshake
    fn admit<T: Transport>(&mut self, transport: T, peer: String) {
        let in_use = self.state.connections.count() + self.pending.len();
        if in_use >= self.options.max_clients {
            warn!(peer = %peer, max_clients = self.options.max_clients, "Server full, refusing connection");
            return;
        }

        let id = TransportId(self.next_transport);
        self.next_transport += 1;
        debug!(transport = %id, peer = %peer, "New connection");

        let task = tokio::spawn(connection_task(
            transport,
            id,
            peer,
            self.events_tx.clone(),
            TaskOptions::from(&self.options),
        ));
        self.pending.insert(
            id,
            PendingTransport {
                abort: task.abort_handle(),
                state: ConnectionState::Handshaking,
                accepted_at: Instant::now(),
            },
        );
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened {
                transport,
                peer,
                outbound,
                writer,
            } => self.open(transport, peer, outbound, writer),
            TransportEvent::Rejected { transport, error } => {
                if let Some(pending) = self.pending.remove(&transport) {
                    warn!(
                        transport = %transport,
                        state = ?pending.state,
                        error = %error,
                        "Handshake failed"
                    );
                }
            }
            TransportEvent::Data { transport, bytes } => {
                if let Some(id) = self.state.connections.lookup_by_transport(transport).cloned() {
                    self.on_data(&id, &bytes);
                }
            }
            TransportEvent::Closed { transport, error } => {
                if let Some(id) = self.state.connections.lookup_by_transport(transport).cloned() {
                    match error {
                        Some(e) => warn!(client_id = %id, error = %e, "Read error"),
                        None => debug!(client_id = %id, "Connection closed by peer"),
                    }
                    self.close_client(&id, None);
                }
            }
        }
        self.flush_closes();
    }

    fn open(
        &mut self,
        transport: TransportId,
        peer: String,
        outbound: mpsc::Sender<Outbound>,
        writer: JoinHandle<()>,
    ) {
        let Some(pending) = self.pending.remove(&transport) else {
            // Aborted while the handshake finished
            writer.abort();
            return;
        };

        let id = self.state.connections.register(ClientTransport {
            id: transport,
            peer: peer.clone(),
            outbound,
            reader: Some(pending.abort),
            writer: Some(writer),
        });
        info!(
            client_id = %id,
            peer = %peer,
            handshake = ?pending.accepted_at.elapsed(),
            "Client connected"
        );

        self.fire(CONNECTION_EVENT, &id, &json!({}));
    }

    fn on_data(&mut self, id: &ClientId, bytes: &[u8]) {
        self.state.connections.touch(id);

        // Frames never span reads; whatever is left after an error is discarded
        let mut offset = 0;
        while offset < bytes.len() {
            // A handler or a full queue already scheduled this client's close
            if self.state.is_closing(id) {
                return;
            }

            let (frame, used) = match frame::decode(&bytes[offset..]) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.frame_error(id, e);
                    return;
                }
            };
            offset += used;

            match self.on_frame(id, frame) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    self.frame_error(id, e);
                    return;
                }
            }
        }
    }

    /// Handle one decoded frame; returns false once the connection is closing
    fn on_frame(&mut self, id: &ClientId, frame: Frame) -> std::result::Result<bool, FrameError> {
        if frame.is_fragment() {
            return Err(FrameError::Fragmented);
        }

        match frame.opcode {
            Opcode::Text => {
                let text = frame.into_text()?;
                debug!(client_id = %id, len = text.len(), "Message received");
                let mut server = ServerHandle::new(&mut self.state);
                self.router.dispatch_text(id, &text, &mut server);
                Ok(true)
            }
            Opcode::Close => {
                let code = close_code(&frame.payload).unwrap_or(CLOSE_NORMAL);
                debug!(client_id = %id, code = code, "Close frame received");
                self.state.schedule_close(id, CLOSE_NORMAL, "");
                Ok(false)
            }
            Opcode::Ping => {
                let pong = frame::encode(Opcode::Pong, &frame.payload);
                self.state.deliver(id, &pong);
                Ok(true)
            }
            Opcode::Pong => Ok(true),
            Opcode::Binary => {
                debug!(client_id = %id, len = frame.payload.len(), "Ignoring binary frame");
                Ok(true)
            }
            Opcode::Continuation => Err(FrameError::Fragmented),
        }
    }

    fn frame_error(&mut self, id: &ClientId, error: FrameError) {
        match self.options.frame_error_policy {
            FrameErrorPolicy::Drop => {
                warn!(client_id = %id, error = %error, "Dropping malformed frame");
            }
            FrameErrorPolicy::Close => {
                warn!(client_id = %id, error = %error, "Malformed frame, closing connection");
                self.state
                    .schedule_close(id, CLOSE_PROTOCOL_ERROR, error.to_string());
            }
        }
    }

    fn fire(&mut self, event: &str, id: &ClientId, payload: &Value) {
        let mut server = ServerHandle::new(&mut self.state);
        self.router.dispatch(event, id, payload, &mut server);
    }

    /// Tear a client down: rooms first, then the registry, then `disconnect`.
    ///
    /// Returns the writer task so shutdown can wait for it to drain.
    fn close_client(&mut self, id: &ClientId, close: Option<(u16, String)>) -> Option<JoinHandle<()>> {
        let conn = self.state.connections.lookup_mut(id)?;
        conn.state = ConnectionState::Closing;
        if let Some((code, reason)) = close {
            if let Err(e) = conn.queue(Outbound::Close { code, reason }) {
                debug!(client_id = %id, error = %e, "Could not queue close frame");
            }
        }

        let ReactorState {
            connections, rooms, ..
        } = &mut self.state;
        rooms.remove_client(connections, id);
        let writer = connections.remove(id)?.release();

        info!(client_id = %id, clients = self.state.connections.count(), "Client disconnected");
        self.fire(DISCONNECT_EVENT, id, &json!({}));
        writer
    }

    /// Close everything handlers or the reactor scheduled
    fn flush_closes(&mut self) {
        loop {
            let batch = std::mem::take(&mut self.state.pending_close);
            if batch.is_empty() {
                break;
            }
            for pending in batch {
                self.close_client(&pending.id, Some((pending.code, pending.reason)));
            }
        }
    }

    fn housekeeping(&mut self) {
        if let Some(timeout) = self.options.idle_timeout.filter(|t| !t.is_zero()) {
            let idle: Vec<ClientId> = self
                .state
                .connections
                .iter()
                .filter(|conn| conn.last_activity.elapsed() > timeout)
                .map(|conn| conn.id.clone())
                .collect();
            for id in idle {
                info!(client_id = %id, timeout_secs = timeout.as_secs(), "Closing idle connection");
                self.state.schedule_close(&id, CLOSE_NORMAL, "idle timeout");
            }
        }
        self.flush_closes();
    }

    /// Close every connection with a going-away frame and wait for the writers
    async fn shutdown(mut self) {
        for (_, pending) in self.pending.drain() {
            pending.abort.abort();
        }

        let ids = self.state.connections.ids();
        info!(clients = ids.len(), "Closing all connections");

        let mut writers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(writer) =
                self.close_client(&id, Some((CLOSE_GOING_AWAY, "server shutdown".into())))
            {
                writers.push(writer);
            }
        }

        let deadline = tokio::time::Instant::now() + self.options.shutdown_grace;
        for mut writer in writers {
            if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        info!("Server stopped");
    }
}

/// The subset of options a connection task needs
#[derive(Clone, Copy)]
struct TaskOptions {
    handshake_timeout: Duration,
    read_buffer_size: usize,
    outbound_capacity: usize,
}

impl From<&ServerOptions> for TaskOptions {
    fn from(options: &ServerOptions) -> Self {
        Self {
            handshake_timeout: options.handshake_timeout,
            read_buffer_size: options.read_buffer_size.max(1),
            outbound_capacity: options.outbound_capacity.max(1),
        }
    }
}

/// Handshake, then forward every read to the reactor
async fn connection_task<T: Transport>(
    mut transport: T,
    id: TransportId,
    peer: String,
    events: mpsc::Sender<TransportEvent>,
    options: TaskOptions,
) {
    let leftover = match accept_handshake(&mut transport, options.handshake_timeout).await {
        Ok(rest) => rest,
        Err(error) => {
            // Dropping the transport closes it
            let _ = events
                .send(TransportEvent::Rejected {
                    transport: id,
                    error,
                })
                .await;
            return;
        }
    };

    let (mut reader, writer) = tokio::io::split(transport);
    let (outbound, outbound_rx) = mpsc::channel(options.outbound_capacity);
    let writer = tokio::spawn(writer_task(writer, outbound_rx, id, events.clone()));

    let opened = TransportEvent::Opened {
        transport: id,
        peer,
        outbound,
        writer,
    };
    if events.send(opened).await.is_err() {
        return;
    }
    if !leftover.is_empty()
        && events
            .send(TransportEvent::Data {
                transport: id,
                bytes: leftover,
            })
            .await
            .is_err()
    {
        return;
    }

    let mut buf = vec![0u8; options.read_buffer_size];
    loop {
        let event = match reader.read(&mut buf).await {
            Ok(0) => TransportEvent::Closed {
                transport: id,
                error: None,
            },
            Ok(n) => TransportEvent::Data {
                transport: id,
                bytes: buf[..n].to_vec(),
            },
            Err(e) => TransportEvent::Closed {
                transport: id,
                error: Some(e),
            },
        };
        let done = matches!(event, TransportEvent::Closed { .. });
        if events.send(event).await.is_err() || done {
            break;
        }
    }
}

/// Read the upgrade request and answer it; returns bytes read past the request
async fn accept_handshake<T: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut T,
    timeout: Duration,
) -> std::result::Result<Vec<u8>, HandshakeError> {
    let (head, rest) = handshake::read_head(transport, timeout).await?;
    let (request, response) = handshake::negotiate(&head)?;

    transport.write_all(response.as_bytes()).await?;
    transport.flush().await?;

    debug!(path = %request.path, "Handshake complete");
    Ok(rest)
}

/// Writer task - sends queued frames to the client.
///
/// A failed write is reported to the reactor as a close of the transport.
async fn writer_task<T: AsyncWrite>(
    mut writer: WriteHalf<T>,
    mut rx: mpsc::Receiver<Outbound>,
    transport: TransportId,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            Outbound::Frame(bytes) => write_flush(&mut writer, &bytes).await,
            Outbound::Close { code, reason } => {
                let bytes = frame::encode(Opcode::Close, &close_payload(code, &reason));
                if let Err(e) = write_flush(&mut writer, &bytes).await {
                    debug!(transport = %transport, error = %e, "Close frame not delivered");
                }
                let _ = writer.shutdown().await;
                break;
            }
        };
        if let Err(e) = result {
            debug!(transport = %transport, error = %e, "Write failed");
            let _ = events
                .send(TransportEvent::Closed {
                    transport,
                    error: Some(e),
                })
                .await;
            break;
        }
    }
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::transport::{memory_listener, MemoryConnector, MemoryListener};
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;

    const WAIT: Duration = Duration::from_secs(5);

    type Events = Arc<Mutex<Vec<(String, ClientId)>>>;

    /// Lobby server mirroring the demo room handlers
    fn lobby_server(options: ServerOptions) -> (Server<MemoryListener>, MemoryConnector, Events) {
        let (listener, connector) = memory_listener();
        let mut server = Server::with_listener(listener, options);
        let events: Events = Arc::new(Mutex::new(Vec::new()));

        for name in [CONNECTION_EVENT, DISCONNECT_EVENT] {
            let events = events.clone();
            server.on(name, move |id, _, _| {
                events.lock().unwrap().push((name.to_string(), id.clone()));
                Ok(())
            });
        }
        server.on("connection", |id, _, server| {
            server.send(id, json!({ "event": "welcome", "client_id": id }));
            Ok(())
        });
        server.on("join_room", |id, payload, server| {
            let room = payload["room"].as_str().unwrap_or("general");
            server.join_room(id, room)?;
            server.send_to_room(room, json!({ "event": "user_joined", "client_id": id, "room": room }), None);
            Ok(())
        });
        server.on("broadcast", |id, payload, server| {
            server.broadcast(json!({ "event": "broadcast", "message": payload["message"], "from": id }), Some(id));
            Ok(())
        });
        server.on("message", |id, payload, server| {
            server.send(id, json!({ "event": "echo", "original_message": payload["message"] }));
            Ok(())
        });
        server.on("whoami", |id, _, server| {
            let members = server.members_of("lobby");
            server.send(id, json!({ "event": "members", "members": members, "count": server.client_count() }));
            Ok(())
        });
        server.on("quit", |id, _, server| {
            server.disconnect(id);
            Ok(())
        });

        (server, connector, events)
    }

    async fn connect(connector: &MemoryConnector) -> (Client<DuplexStream>, String) {
        let stream = connector.connect().unwrap();
        let mut client = Client::handshake(stream, "localhost", "/").await.unwrap();
        let welcome = next_json(&mut client).await.unwrap();
        assert_eq!(welcome["event"], "welcome");
        let id = welcome["client_id"].as_str().unwrap().to_string();
        (client, id)
    }

    async fn next_json(client: &mut Client<DuplexStream>) -> Option<Value> {
        tokio::time::timeout(WAIT, client.next_json())
            .await
            .expect("timed out waiting for message")
            .unwrap()
    }

    async fn wait_for(events: &Events, name: &str, count: usize) {
        let deadline = Instant::now() + WAIT;
        loop {
            let seen = events.lock().unwrap().iter().filter(|(e, _)| e == name).count();
            if seen >= count {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {} x{}", name, count);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_lobby_end_to_end() {
        let (server, connector, events) = lobby_server(ServerOptions::default());
        let running = server.start();

        let (mut a, a_id) = connect(&connector).await;
        wait_for(&events, CONNECTION_EVENT, 1).await;

        a.send_event("join_room", json!({ "room": "lobby" })).await.unwrap();
        let joined = next_json(&mut a).await.unwrap();
        assert_eq!(joined["event"], "user_joined");
        assert_eq!(joined["client_id"], a_id.as_str());

        let (mut b, b_id) = connect(&connector).await;
        b.send_event("join_room", json!({ "room": "lobby" })).await.unwrap();
        for client in [&mut a, &mut b] {
            let joined = next_json(client).await.unwrap();
            assert_eq!(joined["event"], "user_joined");
            assert_eq!(joined["client_id"], b_id.as_str());
        }

        a.close().await.unwrap();
        wait_for(&events, DISCONNECT_EVENT, 1).await;
        let disconnected = events.lock().unwrap().last().cloned().unwrap();
        assert_eq!(disconnected, (DISCONNECT_EVENT.to_string(), ClientId::from(a_id.as_str())));

        b.send_event("whoami", json!({})).await.unwrap();
        let reply = next_json(&mut b).await.unwrap();
        assert_eq!(reply["members"], json!([b_id]));
        assert_eq!(reply["count"], 1);

        running.stop().await;
    }

    #[tokio::test]
    async fn test_peer_drop_without_close_frame() {
        let (server, connector, events) = lobby_server(ServerOptions::default());
        let running = server.start();

        let (mut a, a_id) = connect(&connector).await;
        a.send_event("join_room", json!({ "room": "lobby" })).await.unwrap();
        next_json(&mut a).await.unwrap();

        let (mut b, b_id) = connect(&connector).await;
        b.send_event("join_room", json!({ "room": "lobby" })).await.unwrap();
        next_json(&mut a).await.unwrap();
        next_json(&mut b).await.unwrap();

        // Stream goes away without a close frame
        drop(a);
        wait_for(&events, DISCONNECT_EVENT, 1).await;
        let disconnected = events.lock().unwrap().last().cloned().unwrap();
        assert_eq!(disconnected, (DISCONNECT_EVENT.to_string(), ClientId::from(a_id.as_str())));

        b.send_event("whoami", json!({})).await.unwrap();
        let reply = next_json(&mut b).await.unwrap();
        assert_eq!(reply["members"], json!([b_id]));
        assert_eq!(reply["count"], 1);

        running.stop().await;
    }

    #[tokio::test]
    async fn test_frames_after_handler_disconnect_are_not_dispatched() {
        let (server, connector, events) = lobby_server(ServerOptions::default());
        let running = server.start();

        let (mut a, _) = connect(&connector).await;
        let mut bytes = frame::encode_masked(Opcode::Text, br#"{"event":"quit"}"#, [9, 8, 7, 6]);
        bytes.extend(frame::encode_masked(Opcode::Text, b"after quit", [1, 2, 3, 4]));
        a.send_raw(&bytes).await.unwrap();

        // The close arrives with no echo ahead of it
        assert_eq!(next_json(&mut a).await, None);
        wait_for(&events, DISCONNECT_EVENT, 1).await;

        running.stop().await;
    }

    #[tokio::test]
    async fn test_writer_reports_failed_write() {
        let (server_end, client_end) = tokio::io::duplex(64);
        drop(client_end);
        let (_reader, writer) = tokio::io::split(server_end);

        let (outbound, outbound_rx) = mpsc::channel(4);
        let (events_tx, mut events_rx) = mpsc::channel(4);
        outbound.send(Outbound::Frame(vec![1, 2, 3])).await.unwrap();

        tokio::time::timeout(WAIT, writer_task(writer, outbound_rx, TransportId(9), events_tx))
            .await
            .unwrap();

        match events_rx.recv().await {
            Some(TransportEvent::Closed { transport, error }) => {
                assert_eq!(transport, TransportId(9));
                assert!(error.is_some());
            }
            _ => panic!("expected a closed event"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let (server, connector, _events) = lobby_server(ServerOptions::default());
        let running = server.start();

        let (mut a, a_id) = connect(&connector).await;
        let (mut b, _) = connect(&connector).await;
        let (mut c, _) = connect(&connector).await;

        a.send_event("broadcast", json!({ "message": "hello all" })).await.unwrap();
        for client in [&mut b, &mut c] {
            let msg = next_json(client).await.unwrap();
            assert_eq!(msg["event"], "broadcast");
            assert_eq!(msg["from"], a_id.as_str());
        }

        // The sender only sees its own echo, never the broadcast
        a.send_text("ping").await.unwrap();
        let echo = next_json(&mut a).await.unwrap();
        assert_eq!(echo, json!({ "event": "echo", "original_message": "ping" }));

        running.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_failure_creates_no_state() {
        let (server, connector, events) = lobby_server(ServerOptions::default());
        let running = server.start();

        let mut raw = connector.connect().unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        let read = tokio::time::timeout(WAIT, raw.read_to_end(&mut buf)).await.unwrap();
        assert!(read.is_ok());
        assert!(buf.is_empty(), "no response expected for a rejected handshake");

        let (mut ok, _) = connect(&connector).await;
        ok.send_event("whoami", json!({})).await.unwrap();
        assert_eq!(next_json(&mut ok).await.unwrap()["count"], 1);
        assert_eq!(
            events
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, _)| e == CONNECTION_EVENT)
                .count(),
            1
        );

        running.stop().await;
    }

    #[tokio::test]
    async fn test_unmasked_frame_closes_connection() {
        let (server, connector, events) = lobby_server(ServerOptions::default());
        let running = server.start();

        let (mut a, _) = connect(&connector).await;
        a.send_raw(&frame::encode(Opcode::Text, b"not masked")).await.unwrap();

        let close = tokio::time::timeout(WAIT, a.recv()).await.unwrap().unwrap().unwrap();
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(close_code(&close.payload), Some(CLOSE_PROTOCOL_ERROR));
        wait_for(&events, DISCONNECT_EVENT, 1).await;

        running.stop().await;
    }

    #[tokio::test]
    async fn test_drop_policy_keeps_connection_open() {
        let options = ServerOptions {
            frame_error_policy: FrameErrorPolicy::Drop,
            ..ServerOptions::default()
        };
        let (server, connector, events) = lobby_server(options);
        let running = server.start();

        let (mut a, _) = connect(&connector).await;
        a.send_raw(&frame::encode(Opcode::Text, b"not masked")).await.unwrap();
        // Keep the two frames in separate reads
        tokio::time::sleep(Duration::from_millis(100)).await;
        a.send_text("still here").await.unwrap();

        let echo = next_json(&mut a).await.unwrap();
        assert_eq!(echo["original_message"], "still here");
        assert_eq!(
            events.lock().unwrap().iter().filter(|(e, _)| e == DISCONNECT_EVENT).count(),
            0
        );

        running.stop().await;
    }

    #[tokio::test]
    async fn test_handler_disconnect_and_ping() {
        let (server, connector, events) = lobby_server(ServerOptions::default());
        let running = server.start();

        let (mut a, _) = connect(&connector).await;
        a.send_raw(&frame::encode_masked(Opcode::Ping, b"hb", [1, 2, 3, 4]))
            .await
            .unwrap();
        let pong = tokio::time::timeout(WAIT, a.recv()).await.unwrap().unwrap().unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(pong.payload, b"hb");

        a.send_event("quit", json!({})).await.unwrap();
        assert_eq!(next_json(&mut a).await, None);
        wait_for(&events, DISCONNECT_EVENT, 1).await;

        running.stop().await;
    }

    #[tokio::test]
    async fn test_max_clients_refuses_extra_connections() {
        let options = ServerOptions {
            max_clients: 1,
            ..ServerOptions::default()
        };
        let (server, connector, _events) = lobby_server(options);
        let running = server.start();

        let (_a, _) = connect(&connector).await;

        let stream = connector.connect().unwrap();
        let refused = tokio::time::timeout(WAIT, Client::handshake(stream, "localhost", "/"))
            .await
            .unwrap();
        assert!(refused.is_err());

        running.stop().await;
    }

    #[tokio::test]
    async fn test_idle_connections_are_closed() {
        let options = ServerOptions {
            idle_timeout: Some(Duration::from_millis(100)),
            poll_interval: Duration::from_millis(20),
            ..ServerOptions::default()
        };
        let (server, connector, events) = lobby_server(options);
        let running = server.start();

        let (mut a, _) = connect(&connector).await;
        assert_eq!(next_json(&mut a).await, None);
        wait_for(&events, DISCONNECT_EVENT, 1).await;

        running.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_sends_going_away() {
        let (server, connector, events) = lobby_server(ServerOptions::default());
        let running = server.start();

        let (mut a, _) = connect(&connector).await;
        let (mut b, _) = connect(&connector).await;
        running.stop().await;

        for client in [&mut a, &mut b] {
            let close = tokio::time::timeout(WAIT, client.recv()).await.unwrap().unwrap().unwrap();
            assert_eq!(close.opcode, Opcode::Close);
            assert_eq!(close_code(&close.payload), Some(CLOSE_GOING_AWAY));
        }
        wait_for(&events, DISCONNECT_EVENT, 2).await;
    }

    #[tokio::test]
    async fn test_tcp_server_start() {
        let mut server = Server::bind("127.0.0.1:0", ServerOptions::default()).await.unwrap();
        server.on("message", |id, payload, server| {
            server.send(id, payload["message"].as_str().unwrap_or_default().to_uppercase());
            Ok(())
        });
        let running = server.start();
        let addr = running.addr().unwrap();
        assert!(addr.port() > 0);

        let mut client = Client::connect(&format!("ws://{}/", addr)).await.unwrap();
        client.send_text("shout").await.unwrap();
        let reply = tokio::time::timeout(WAIT, client.next_text()).await.unwrap().unwrap();
        assert_eq!(reply.as_deref(), Some("SHOUT"));

        running.stop().await;
    }
}
