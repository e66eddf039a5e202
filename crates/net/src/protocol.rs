//! Application envelope
//!
//! Inbound text frames carry a JSON object with a string `event` field; the
//! whole object is handed to the handlers as the payload. Anything else is
//! delivered as a `message` event carrying the raw text.

use serde_json::{json, Value};

/// Fired after a successful handshake
pub const CONNECTION_EVENT: &str = "connection";

/// Fired after a connection has been torn down
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Synthesized for text that is not an event envelope
pub const MESSAGE_EVENT: &str = "message";

/// A routed inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: String,
    pub payload: Value,
}

impl Envelope {
    /// Parse inbound text, falling back to a `message` event
    pub fn parse(text: &str) -> Self {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
            if let Some(Value::String(event)) = map.get("event") {
                return Envelope {
                    event: event.clone(),
                    payload: Value::Object(map),
                };
            }
        }

        Envelope {
            event: MESSAGE_EVENT.to_string(),
            payload: json!({ "message": text }),
        }
    }
}

/// A message queued for delivery; JSON values are serialized on send
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text(String),
    Json(Value),
}

impl OutboundMessage {
    pub fn to_text(&self) -> String {
        match self {
            OutboundMessage::Text(text) => text.clone(),
            OutboundMessage::Json(value) => value.to_string(),
        }
    }
}

impl From<String> for OutboundMessage {
    fn from(text: String) -> Self {
        OutboundMessage::Text(text)
    }
}

impl From<&str> for OutboundMessage {
    fn from(text: &str) -> Self {
        OutboundMessage::Text(text.to_string())
    }
}

impl From<Value> for OutboundMessage {
    fn from(value: Value) -> Self {
        OutboundMessage::Json(value)
    }
}
