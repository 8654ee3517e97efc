//! Engine-level errors and the structured error-code contract.
//!
//! Component errors (`ApiError`, `TransportError`, `EventError`,
//! `ConfigError`) live next to the code that produces them; this module holds
//! what callers of the engine see directly.

use crate::config::ConfigError;
use crate::history::ApiError;
use crate::transport::TransportError;

/// Grepable error code and retryable flag for errors surfaced to callers.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Errors returned by [`crate::engine::Engine`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No session, or a session without a usable token, was supplied.
    #[error("not authenticated: a session with a valid token is required")]
    AuthenticationMissing,

    /// The engine's event loop has shut down (logout or teardown).
    #[error("engine is stopped")]
    Stopped,

    /// An operation that needs an active conversation ran without one.
    #[error("no peer selected")]
    NoActivePeer,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ErrorCode for EngineError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AuthenticationMissing => "E_AUTH_MISSING",
            Self::Stopped => "E_ENGINE_STOPPED",
            Self::NoActivePeer => "E_NO_ACTIVE_PEER",
            Self::Config(_) => "E_CONFIG",
            Self::Api(e) => e.error_code(),
            Self::Transport(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Api(e) => e.retryable(),
            Self::Transport(e) => e.retryable(),
            _ => false,
        }
    }
}
