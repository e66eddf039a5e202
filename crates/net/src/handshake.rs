//! HTTP upgrade handshake
//!
//! The server reads the client's `GET` request, checks `Sec-WebSocket-Key`
//! and answers with a fixed `101 Switching Protocols` response. No
//! subprotocol or extension negotiation takes place.

use std::io;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

/// GUID appended to the client key before hashing
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum size of a request or response head
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Handshake errors
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("Invalid Sec-WebSocket-Key")]
    InvalidKey,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Head exceeds {MAX_HEAD_SIZE} bytes")]
    TooLarge,

    #[error("Timed out waiting for handshake")]
    Timeout,

    #[error("Connection closed during handshake")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A validated upgrade request
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Compute the Sec-WebSocket-Accept value for a client key
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Parse and validate a raw upgrade request
pub fn parse_request(raw: &[u8]) -> Result<UpgradeRequest, HandshakeError> {
    let head = head_str(raw).map_err(HandshakeError::InvalidRequest)?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version)) if version.starts_with("HTTP/") => {
            (method, path)
        }
        _ => {
            return Err(HandshakeError::InvalidRequest(format!(
                "bad request line '{}'",
                request_line
            )))
        }
    };
    if method != "GET" {
        return Err(HandshakeError::InvalidRequest(format!(
            "method {} not allowed",
            method
        )));
    }

    let headers = parse_headers(lines);

    let key = find_header(&headers, "sec-websocket-key")
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingKey)?
        .to_string();

    match STANDARD.decode(&key) {
        Ok(nonce) if nonce.len() == 16 => {}
        _ => return Err(HandshakeError::InvalidKey),
    }

    Ok(UpgradeRequest {
        path: path.to_string(),
        key,
        headers,
    })
}

/// Build the 101 response for an accepted key
pub fn accept_response(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        compute_accept_key(client_key)
    )
}

/// Validate a request and produce the response to write back
pub fn negotiate(raw: &[u8]) -> Result<(UpgradeRequest, String), HandshakeError> {
    let request = parse_request(raw)?;
    let response = accept_response(&request.key);
    Ok((request, response))
}

/// Read an HTTP head (request or response) up to the blank line.
///
/// Returns the head and any bytes that arrived after it.
pub async fn read_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<(Vec<u8>, Vec<u8>), HandshakeError> {
    tokio::time::timeout(timeout, read_head_inner(reader))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn read_head_inner<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(Vec<u8>, Vec<u8>), HandshakeError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }

        // Resume the search just before the new bytes in case the terminator straddles reads
        let search_from = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_terminator(&buf[search_from..]) {
            let end = search_from + pos + HEAD_TERMINATOR.len();
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(HandshakeError::TooLarge);
        }
    }
}

/// Generate a random client nonce
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    STANDARD.encode(nonce)
}

/// Build the client's upgrade request
pub fn client_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        path, host, key
    )
}

/// Check the server's response against the key we sent
pub fn verify_response(raw: &[u8], key: &str) -> Result<(), HandshakeError> {
    let head = head_str(raw).map_err(HandshakeError::InvalidResponse)?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    if status_line.split_whitespace().nth(1) != Some("101") {
        return Err(HandshakeError::InvalidResponse(format!(
            "unexpected status '{}'",
            status_line
        )));
    }

    let headers = parse_headers(lines);
    let expected = compute_accept_key(key);
    match find_header(&headers, "sec-websocket-accept") {
        Some(accept) if accept == expected => Ok(()),
        Some(accept) => Err(HandshakeError::InvalidResponse(format!(
            "accept key mismatch: expected {}, got {}",
            expected, accept
        ))),
        None => Err(HandshakeError::InvalidResponse(
            "missing Sec-WebSocket-Accept".into(),
        )),
    }
}

fn head_str(raw: &[u8]) -> Result<&str, String> {
    let end = find_terminator(raw).ok_or_else(|| "incomplete head".to_string())?;
    std::str::from_utf8(&raw[..end]).map_err(|_| "head is not valid UTF-8".to_string())
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}
