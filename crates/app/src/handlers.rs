//! Demo application handlers
//!
//! Welcome, echo, broadcast and room chat on top of the server core.

use chrono::Utc;
use serde_json::{json, Value};
use switchboard_core::RoomsConfig;
use switchboard_net::{
    Listener, Server, CONNECTION_EVENT, DISCONNECT_EVENT, MESSAGE_EVENT,
};
use tracing::info;

pub const WELCOME_MESSAGE: &str = "Connected to WebSocket server";

/// Register the demo handlers; room handlers only when rooms are enabled
pub fn register<L: Listener>(server: &mut Server<L>, rooms: &RoomsConfig) {
    server.on(CONNECTION_EVENT, |id, _, server| {
        info!(client_id = %id, "Client connected");
        server.send(
            id,
            json!({
                "event": "welcome",
                "message": WELCOME_MESSAGE,
                "client_id": id,
                "timestamp": timestamp(),
            }),
        );
        Ok(())
    });

    server.on(DISCONNECT_EVENT, |id, _, _| {
        info!(client_id = %id, "Client disconnected");
        Ok(())
    });

    server.on(MESSAGE_EVENT, |id, payload, server| {
        server.send(
            id,
            json!({
                "event": "echo",
                "original_message": field(payload, "message"),
                "timestamp": timestamp(),
            }),
        );
        Ok(())
    });

    server.on("broadcast", |id, payload, server| {
        let reached = server.broadcast(
            json!({
                "event": "broadcast",
                "message": text_field(payload, "message"),
                "from": id,
                "timestamp": timestamp(),
            }),
            Some(id),
        );
        info!(client_id = %id, reached, "Broadcast");
        Ok(())
    });

    if !rooms.enabled {
        return;
    }

    let default_room = rooms.default_room.clone();
    server.on("join_room", move |id, payload, server| {
        let room = room_name(payload, &default_room);
        server.join_room(id, &room)?;
        server.send_to_room(
            &room,
            json!({
                "event": "user_joined",
                "client_id": id,
                "room": room,
                "timestamp": timestamp(),
            }),
            None,
        );
        Ok(())
    });

    let default_room = rooms.default_room.clone();
    server.on("leave_room", move |id, payload, server| {
        let room = room_name(payload, &default_room);
        server.leave_room(id, &room);
        server.send_to_room(
            &room,
            json!({
                "event": "user_left",
                "client_id": id,
                "room": room,
                "timestamp": timestamp(),
            }),
            None,
        );
        Ok(())
    });

    let default_room = rooms.default_room.clone();
    server.on("room_message", move |id, payload, server| {
        let room = room_name(payload, &default_room);
        server.send_to_room(
            &room,
            json!({
                "event": "room_message",
                "message": text_field(payload, "message"),
                "from": id,
                "room": room,
                "timestamp": timestamp(),
            }),
            Some(id),
        );
        Ok(())
    });
}

fn timestamp() -> i64 {
    Utc::now().timestamp()
}

fn field(payload: &Value, key: &str) -> Value {
    payload.get(key).cloned().unwrap_or(Value::Null)
}

/// A field that falls back to an empty string
fn text_field(payload: &Value, key: &str) -> Value {
    match payload.get(key) {
        Some(Value::Null) | None => Value::String(String::new()),
        Some(value) => value.clone(),
    }
}

fn room_name(payload: &Value, default_room: &str) -> String {
    match payload.get("room").and_then(Value::as_str) {
        Some(room) if !room.is_empty() => room.to_string(),
        _ => default_room.to_string(),
    }
}
