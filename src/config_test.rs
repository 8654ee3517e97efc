use super::*;

/// # Safety
/// Env mutation races with other tests reading the same keys; every key used
/// here is only read by this file.
unsafe fn clear_chat_env() {
    unsafe {
        for key in [
            "CHAT_API_URL",
            "CHAT_WS_URL",
            "CHAT_TYPING_QUIET_MS",
            "CHAT_TYPING_WATCHDOG_MS",
            "CHAT_RECONNECT_BASE_MS",
            "CHAT_RECONNECT_MAX_MS",
            "CHAT_RECONNECT_MAX_ATTEMPTS",
            "CHAT_HTTP_TIMEOUT_SECS",
            "CHAT_CONNECT_TIMEOUT_SECS",
        ] {
            std::env::remove_var(key);
        }
    }
}

// Env-driven cases share process state, so they run sequentially in one test.
#[test]
fn from_env_defaults_overrides_and_errors() {
    unsafe {
        clear_chat_env();
    }
    let err = EngineConfig::from_env().unwrap_err();
    assert!(matches!(err, ConfigError::Missing("CHAT_API_URL")));

    unsafe {
        std::env::set_var("CHAT_API_URL", "http://localhost:3000/");
    }
    let cfg = EngineConfig::from_env().unwrap();
    assert_eq!(cfg.api_url, "http://localhost:3000");
    assert_eq!(cfg.ws_url, None);
    assert_eq!(cfg.typing, TypingConfig::default());
    assert_eq!(cfg.reconnect, ReconnectPolicy::default());
    assert_eq!(cfg.http_timeout, Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS));

    unsafe {
        std::env::set_var("CHAT_WS_URL", "wss://rt.example.test/socket");
        std::env::set_var("CHAT_TYPING_QUIET_MS", "250");
        std::env::set_var("CHAT_TYPING_WATCHDOG_MS", "5000");
        std::env::set_var("CHAT_RECONNECT_MAX_ATTEMPTS", "2");
        std::env::set_var("CHAT_RECONNECT_BASE_MS", "not-a-number");
    }
    let cfg = EngineConfig::from_env().unwrap();
    assert_eq!(cfg.websocket_url().unwrap(), "wss://rt.example.test/socket");
    assert_eq!(cfg.typing.quiet_period, Duration::from_millis(250));
    assert_eq!(cfg.typing.watchdog, Some(Duration::from_millis(5000)));
    assert_eq!(cfg.reconnect.max_attempts, 2);
    assert_eq!(cfg.reconnect.base_delay, Duration::from_millis(DEFAULT_RECONNECT_BASE_MS));

    unsafe {
        clear_chat_env();
        std::env::set_var("CHAT_API_URL", "ftp://nope");
    }
    let err = EngineConfig::from_env().unwrap_err();
    assert!(err.to_string().contains("ftp://nope"));

    unsafe { clear_chat_env() };
}

#[test]
fn websocket_url_is_derived_from_api_url() {
    assert_eq!(EngineConfig::new("http://127.0.0.1:3000").websocket_url().unwrap(), "ws://127.0.0.1:3000/ws");
    assert_eq!(EngineConfig::new("https://chat.example.test").websocket_url().unwrap(), "wss://chat.example.test/ws");
}

#[test]
fn reconnect_delay_doubles_and_caps() {
    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(1000),
        max_attempts: 10,
    };
    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(4), Duration::from_millis(800));
    assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
    assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
}
