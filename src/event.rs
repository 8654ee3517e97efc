//! Realtime event vocabulary.
//!
//! DESIGN
//! ======
//! Inbound payloads are parsed into [`InboundEvent`] at the edge; anything
//! that does not parse is a malformed event and never reaches the merge
//! logic. Outbound commands are built as [`Outbound`] values so the event
//! name and payload shape live in one place.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Message, PresenceState, UserId};

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_STATUS_CHANGE: &str = "user_status_change";
pub const EVENT_TYPING_STATUS: &str = "typing_status";

pub const EVENT_SEND_MESSAGE: &str = "sendMessage";
pub const EVENT_START_TYPING: &str = "start_typing";
pub const EVENT_STOP_TYPING: &str = "stop_typing";
pub const EVENT_USER_CONNECTED: &str = "user_connected";
pub const EVENT_JOIN: &str = "join";

/// Inbound event names the engine subscribes to.
pub const INBOUND_EVENTS: [&str; 3] = [EVENT_MESSAGE, EVENT_STATUS_CHANGE, EVENT_TYPING_STATUS];

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("unknown inbound event: {0}")]
    Unknown(String),

    #[error("malformed {event} payload: {source}")]
    Malformed {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A validated inbound realtime event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(Message),
    StatusChange { user_id: UserId, status: PresenceState },
    Typing { user_id: UserId, is_typing: bool },
}

#[derive(Deserialize)]
struct StatusPayload {
    #[serde(rename = "userId", alias = "user_id")]
    user_id: UserId,
    status: PresenceState,
}

#[derive(Deserialize)]
struct TypingPayload {
    #[serde(rename = "userId", alias = "user_id", alias = "fromId")]
    user_id: UserId,
    #[serde(rename = "isTyping", alias = "is_typing")]
    is_typing: bool,
}

impl InboundEvent {
    /// Parse a named payload into a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Unknown`] for event names outside
    /// [`INBOUND_EVENTS`] and [`EventError::Malformed`] for payloads missing
    /// required fields.
    pub fn parse(event: &str, data: &Value) -> Result<Self, EventError> {
        match event {
            EVENT_MESSAGE => Message::deserialize(data)
                .map(Self::Message)
                .map_err(|source| EventError::Malformed { event: EVENT_MESSAGE, source }),
            EVENT_STATUS_CHANGE => StatusPayload::deserialize(data)
                .map(|p| Self::StatusChange { user_id: p.user_id, status: p.status })
                .map_err(|source| EventError::Malformed { event: EVENT_STATUS_CHANGE, source }),
            EVENT_TYPING_STATUS => TypingPayload::deserialize(data)
                .map(|p| Self::Typing { user_id: p.user_id, is_typing: p.is_typing })
                .map_err(|source| EventError::Malformed { event: EVENT_TYPING_STATUS, source }),
            other => Err(EventError::Unknown(other.to_owned())),
        }
    }
}

/// An outbound command: event name plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub event: &'static str,
    pub data: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessagePayload<'a> {
    sender_id: UserId,
    recipient_id: UserId,
    content: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TypingCommandPayload {
    user_id: UserId,
    recipient_id: UserId,
}

impl Outbound {
    #[must_use]
    pub fn send_message(sender_id: UserId, recipient_id: UserId, content: &str) -> Self {
        let payload = SendMessagePayload { sender_id, recipient_id, content };
        Self { event: EVENT_SEND_MESSAGE, data: to_value(&payload) }
    }

    #[must_use]
    pub fn start_typing(user_id: UserId, recipient_id: UserId) -> Self {
        Self { event: EVENT_START_TYPING, data: to_value(&TypingCommandPayload { user_id, recipient_id }) }
    }

    #[must_use]
    pub fn stop_typing(user_id: UserId, recipient_id: UserId) -> Self {
        Self { event: EVENT_STOP_TYPING, data: to_value(&TypingCommandPayload { user_id, recipient_id }) }
    }

    /// Session announcement frames sent on every (re)connect.
    #[must_use]
    pub fn announce(user_id: UserId) -> [Self; 2] {
        let data = serde_json::json!({ "userId": user_id });
        [
            Self { event: EVENT_USER_CONNECTED, data: data.clone() },
            Self { event: EVENT_JOIN, data },
        ]
    }
}

// Serializing these plain structs cannot fail.
fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
