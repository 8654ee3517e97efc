//! Chat data model shared by every engine component.
//!
//! Ids are plain integers on the wire; they are wrapped in newtypes here so a
//! user id can never be confused with a message id.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Identifier of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The locally authenticated user. Issued out-of-band by the login flow.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub username: String,
    pub auth_token: String,
}

impl Session {
    #[must_use]
    pub fn new(user_id: UserId, username: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self { user_id, username: username.into(), auth_token: auth_token.into() }
    }

    /// A session is usable only when it carries a non-blank token.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !self.auth_token.trim().is_empty()
    }
}

// Keep the bearer token out of logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

/// A remote user, as listed by the directory API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(alias = "userId", alias = "user_id")]
    pub id: UserId,
    pub username: String,
}

impl Peer {
    #[must_use]
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self { id, username: username.into() }
    }
}

/// One chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(alias = "senderId")]
    pub sender_id: UserId,
    #[serde(alias = "recipientId")]
    pub recipient_id: UserId,
    pub content: String,
    /// Server timestamp. Display-only; never used for ordering.
    #[serde(default, alias = "createdAt")]
    pub created_at: String,
}

impl Message {
    /// Conversation this message belongs to.
    #[must_use]
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id, self.recipient_id)
    }
}

/// Unordered pair of participants identifying a one-to-one conversation.
///
/// Stored normalized (lower id first) so `{a, b}` and `{b, a}` compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b { Self { low: a, high: b } } else { Self { low: b, high: a } }
    }

    /// True when `message` was exchanged between exactly these two users.
    #[must_use]
    pub fn contains(&self, message: &Message) -> bool {
        message.key() == *self
    }

    #[must_use]
    pub fn participants(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }
}

/// Online status of a peer. Unknown peers are treated as offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    #[default]
    Offline,
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Whether a peer is currently composing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TypingState {
    #[default]
    Idle,
    Typing,
}

impl TypingState {
    #[must_use]
    pub fn from_flag(is_typing: bool) -> Self {
        if is_typing { Self::Typing } else { Self::Idle }
    }
}

/// Lifecycle of the realtime transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
