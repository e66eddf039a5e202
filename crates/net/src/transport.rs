//! Listener abstraction
//!
//! The reactor accepts from any [`Listener`]. TCP is the production
//! implementation; [`MemoryListener`] hands out in-process duplex pipes so
//! tests run without sockets.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A byte stream the reactor can drive
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Source of freshly accepted transports
pub trait Listener: Send + 'static {
    type Transport: Transport;

    /// Wait for the next transport. Must be cancel safe.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Transport, String)>> + Send;

    fn local_addr(&self) -> Option<SocketAddr>;
}

impl Listener for TcpListener {
    type Transport = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, String)>> + Send {
        async move {
            let (stream, addr) = TcpListener::accept(&*self).await?;
            stream.set_nodelay(true)?;
            Ok((stream, addr.to_string()))
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpListener::local_addr(self).ok()
    }
}

/// Default pipe capacity for in-memory connections
pub const MEMORY_PIPE_SIZE: usize = 256 * 1024;

/// In-process listener fed by a [`MemoryConnector`]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    accepted: u64,
}

/// Client side of a [`MemoryListener`]
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
    pipe_size: usize,
}

/// Create a connected listener/connector pair
pub fn memory_listener() -> (MemoryListener, MemoryConnector) {
    let (tx, incoming) = mpsc::unbounded_channel();
    (
        MemoryListener {
            incoming,
            accepted: 0,
        },
        MemoryConnector {
            tx,
            pipe_size: MEMORY_PIPE_SIZE,
        },
    )
}

impl MemoryConnector {
    /// Open a new pipe; the other end is queued for the listener
    pub fn connect(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(self.pipe_size);
        self.tx
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;
        Ok(client)
    }
}

impl Listener for MemoryListener {
    type Transport = DuplexStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(DuplexStream, String)>> + Send {
        async move {
            match self.incoming.recv().await {
                Some(stream) => {
                    self.accepted += 1;
                    Ok((stream, format!("memory:{}", self.accepted)))
                }
                // Every connector is gone; nothing will ever arrive
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
