//! Minimal WebSocket client
//!
//! Speaks the same single-frame profile as the server: masked text frames
//! out, unmasked frames in. Used by the CLI probe and by tests.

use std::time::Duration;

use rand::RngCore;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::frame::{self, close_payload, Frame, FrameError, Opcode, CLOSE_NORMAL};
use crate::handshake;

/// How long the client waits for the 101 response
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed `ws://host:port/path` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl WsUrl {
    /// Parse from URL string
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("ws://").ok_or_else(|| {
            Error::Protocol(format!("Invalid URL '{}': expected ws:// prefix", s))
        })?;

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    Error::Protocol(format!("Invalid URL '{}': bad port '{}'", s, port))
                })?;
                (host, port)
            }
            None => (authority, 80),
        };

        if host.is_empty() {
            return Err(Error::Protocol(format!("Invalid URL '{}': empty host", s)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// Value for the Host header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client connection over any byte stream
pub struct Client<T = TcpStream> {
    stream: T,
    buf: Vec<u8>,
}

impl Client<TcpStream> {
    /// Connect over TCP and perform the handshake
    pub async fn connect(url: &str) -> Result<Self> {
        let url = WsUrl::parse(url)?;
        info!(host = %url.host, port = url.port, path = %url.path, "Connecting to server");

        let stream = TcpStream::connect((url.host.as_str(), url.port)).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, &url.authority(), &url.path).await
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Client<T> {
    /// Perform the opening handshake on an already connected stream
    pub async fn handshake(mut stream: T, host: &str, path: &str) -> Result<Self> {
        let key = handshake::generate_key();
        stream
            .write_all(handshake::client_request(host, path, &key).as_bytes())
            .await?;
        stream.flush().await?;

        let (head, rest) = handshake::read_head(&mut stream, HANDSHAKE_TIMEOUT).await?;
        handshake::verify_response(&head, &key)?;
        debug!(host = %host, "Handshake accepted");

        Ok(Self { stream, buf: rest })
    }

    /// Send a raw text frame
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.send_frame(Opcode::Text, text.as_bytes()).await
    }

    /// Send an event envelope; object fields of `fields` are merged in
    pub async fn send_event(&mut self, event: &str, fields: Value) -> Result<()> {
        let mut envelope = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".into(), other);
                map
            }
        };
        envelope.insert("event".into(), Value::String(event.to_string()));
        self.send_text(&Value::Object(envelope).to_string()).await
    }

    /// Send a masked frame with a fresh key
    pub async fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mut mask = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut mask);
        self.send_raw(&frame::encode_masked(opcode, payload, mask))
            .await
    }

    /// Write bytes exactly as given
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next frame from the server, or None once the stream ends
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        let mut chunk = [0u8; 4096];
        loop {
            match frame::decode_unmasked(&self.buf) {
                Ok((frame, used)) => {
                    self.buf.drain(..used);
                    return Ok(Some(frame));
                }
                Err(FrameError::Truncated { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Next text message; None once the server closes
    pub async fn next_text(&mut self) -> Result<Option<String>> {
        loop {
            let Some(frame) = self.recv().await? else {
                return Ok(None);
            };
            match frame.opcode {
                Opcode::Text => return Ok(Some(frame.into_text()?)),
                Opcode::Close => return Ok(None),
                Opcode::Ping => self.send_frame(Opcode::Pong, &frame.payload).await?,
                _ => {}
            }
        }
    }

    /// Next text message parsed as JSON
    pub async fn next_json(&mut self) -> Result<Option<Value>> {
        match self.next_text().await? {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| Error::Protocol(format!("Invalid JSON: {}", e))),
            None => Ok(None),
        }
    }

    /// Send a close frame and shut the stream down
    pub async fn close(mut self) -> Result<()> {
        self.send_frame(Opcode::Close, &close_payload(CLOSE_NORMAL, ""))
            .await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
