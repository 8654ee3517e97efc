//! Realtime one-to-one chat synchronization engine.
//!
//! ARCHITECTURE
//! ============
//! Three asynchronous sources feed one active conversation: pushed realtime
//! events from [`transport`], backlog fetches from [`history`], and local
//! actions from the caller. [`engine::Engine`] serializes all of them through
//! a single event loop that owns the [`conversation`], [`presence`] and
//! [`typing`] state, and publishes a race-free [`engine::Snapshot`].
//!
//! Transport and REST access sit behind traits ([`transport::Connector`],
//! [`history::MessageApi`]) so the engine runs against in-memory fakes in
//! tests and against tokio-tungstenite / reqwest in production.

pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod event;
pub mod history;
pub mod model;
pub mod presence;
pub mod transport;
pub mod typing;

pub use config::EngineConfig;
pub use engine::{Engine, EngineEvent, Snapshot};
pub use error::{EngineError, ErrorCode};
pub use history::{ApiClient, ApiError, HistoryLoader, MessageApi};
pub use model::{ConnectionState, ConversationKey, Message, MessageId, Peer, PresenceState, Session, TypingState, UserId};
pub use transport::{Transport, TransportError, WsConnector};
