//! Realtime frames exchanged with the pub/sub provider, and the outbound
//! publish contract of the backend trigger endpoint.
//!
//! Frame flow:
//!   1. Client opens the socket and sends `{ op: "auth", token }`
//!   2. Provider answers `{ op: "connected", socketId }` or `{ op: "unauthorized" }`
//!   3. Client binds channels with `{ op: "bind", channel }`
//!   4. Provider pushes `{ op: "event", channel, event, data }`

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Event name the backend uses to acknowledge a published message.
pub const ACK_EVENT: &str = "ack";

// ─────────────────────────────────────────────────────────────────────────────
// Client → Provider
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth { token: String },
    Bind { channel: String },
    Unbind { channel: String },
    Ping,
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider → Client
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        #[serde(rename = "socketId")]
        socket_id: String,
    },
    Unauthorized {
        #[serde(default)]
        message: String,
    },
    Bound {
        channel: String,
    },
    SubscriptionError {
        channel: String,
        #[serde(default)]
        message: String,
    },
    Event(RealtimeEvent),
    Pong,
    Error {
        #[serde(default)]
        message: String,
    },
}

/// An event delivered on a bound channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl RealtimeEvent {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: JsonValue) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            data,
        }
    }

    /// The message id this event acknowledges, if it is an ack.
    pub fn acked_message_id(&self) -> Option<&str> {
        if self.event != ACK_EVENT {
            return None;
        }
        self.data.get("messageId").and_then(|v| v.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound publish
// ─────────────────────────────────────────────────────────────────────────────

/// Body posted to the backend trigger endpoint. The client never publishes to
/// the provider directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub channel: String,
    pub event: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: JsonValue,
    pub message_id: String,
}

/// Acknowledgement for a published message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub message_id: String,
    #[serde(default)]
    pub data: JsonValue,
}
