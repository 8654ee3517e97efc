//! Engine configuration parsed from environment variables.

use std::time::Duration;

pub const DEFAULT_TYPING_QUIET_MS: u64 = 1000;
pub const DEFAULT_TYPING_WATCHDOG_MS: u64 = 0;
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),

    #[error("invalid URL in {var}: {value}")]
    InvalidUrl { var: &'static str, value: String },
}

/// Bounded exponential backoff for transport reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << shift).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingConfig {
    /// Quiet period after the last local keystroke before `stop_typing`.
    pub quiet_period: Duration,
    /// Inbound staleness bound; `None` trusts the remote side entirely.
    pub watchdog: Option<Duration>,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self { quiet_period: Duration::from_millis(DEFAULT_TYPING_QUIET_MS), watchdog: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// REST base URL without trailing slash.
    pub api_url: String,
    /// Websocket URL; derived from `api_url` when absent.
    pub ws_url: Option<String>,
    pub typing: TypingConfig,
    pub reconnect: ReconnectPolicy,
    pub http_timeout: Duration,
    pub connect_timeout: Duration,
}

impl EngineConfig {
    /// Config with defaults for everything but the API base URL.
    #[must_use]
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_owned(),
            ws_url: None,
            typing: TypingConfig::default(),
            reconnect: ReconnectPolicy::default(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `CHAT_API_URL`
    ///
    /// Optional:
    /// - `CHAT_WS_URL`: derived from `CHAT_API_URL` when absent
    /// - `CHAT_TYPING_QUIET_MS`: default 1000
    /// - `CHAT_TYPING_WATCHDOG_MS`: default 0 (disabled)
    /// - `CHAT_RECONNECT_BASE_MS`: default 1000
    /// - `CHAT_RECONNECT_MAX_MS`: default 10000
    /// - `CHAT_RECONNECT_MAX_ATTEMPTS`: default 5
    /// - `CHAT_HTTP_TIMEOUT_SECS`: default 15
    /// - `CHAT_CONNECT_TIMEOUT_SECS`: default 5
    ///
    /// # Errors
    ///
    /// Returns an error if `CHAT_API_URL` is missing or no websocket URL can
    /// be derived from it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = std::env::var("CHAT_API_URL").map_err(|_| ConfigError::Missing("CHAT_API_URL"))?;
        let mut config = Self::new(api_url);
        config.ws_url = std::env::var("CHAT_WS_URL").ok().filter(|v| !v.trim().is_empty());

        let watchdog_ms = env_parse("CHAT_TYPING_WATCHDOG_MS", DEFAULT_TYPING_WATCHDOG_MS);
        config.typing = TypingConfig {
            quiet_period: Duration::from_millis(env_parse("CHAT_TYPING_QUIET_MS", DEFAULT_TYPING_QUIET_MS)),
            watchdog: (watchdog_ms > 0).then(|| Duration::from_millis(watchdog_ms)),
        };
        config.reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(env_parse("CHAT_RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS)),
            max_delay: Duration::from_millis(env_parse("CHAT_RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)),
            max_attempts: env_parse("CHAT_RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS),
        };
        config.http_timeout = Duration::from_secs(env_parse("CHAT_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS));
        config.connect_timeout =
            Duration::from_secs(env_parse("CHAT_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS));

        config.websocket_url()?;
        Ok(config)
    }

    /// Websocket endpoint for the realtime transport.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] when `api_url` is neither `http`
    /// nor `https` and no explicit websocket URL is configured.
    pub fn websocket_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = &self.ws_url {
            return Ok(url.clone());
        }
        if let Some(rest) = self.api_url.strip_prefix("http://") {
            return Ok(format!("ws://{rest}/ws"));
        }
        if let Some(rest) = self.api_url.strip_prefix("https://") {
            return Ok(format!("wss://{rest}/ws"));
        }
        Err(ConfigError::InvalidUrl { var: "CHAT_API_URL", value: self.api_url.clone() })
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
