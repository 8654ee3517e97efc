//! Transport connection: one shared realtime channel per session.
//!
//! ARCHITECTURE
//! ============
//! `connect` spawns a supervisor task that owns the socket lifecycle:
//! open a [`Link`] through the injected [`Connector`], announce the session,
//! dispatch inbound frames to subscribers, and on unexpected loss retry with
//! bounded exponential backoff. `disconnect` stops the supervisor.
//!
//! ORDERING
//! ========
//! Event handlers and state handlers are invoked from the supervisor task in
//! the order things happen on the wire, so a consumer that forwards both into
//! one queue observes a loss after every frame that preceded it.
//!
//! ERROR HANDLING
//! ==============
//! Connect failures are retried until `max_attempts` consecutive failures,
//! after which the state settles on `Disconnected` and the supervisor exits.
//! Sending while not connected fails fast; nothing is queued offline.

pub mod ws;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use frames::Frame;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ReconnectPolicy;
use crate::error::ErrorCode;
use crate::event::Outbound;
use crate::model::{ConnectionState, UserId};

pub use ws::WsConnector;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("timed out connecting to {0}")]
    Timeout(String),

    #[error("invalid websocket request: {0}")]
    InvalidRequest(String),

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport channel closed")]
    Closed,
}

impl ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "E_WS_CONNECT",
            Self::Timeout(_) => "E_WS_TIMEOUT",
            Self::InvalidRequest(_) => "E_WS_REQUEST",
            Self::NotConnected => "E_NOT_CONNECTED",
            Self::Closed => "E_CHANNEL_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_))
    }
}

// =============================================================================
// CONNECTOR SEAM
// =============================================================================

/// A live socket, reduced to a pair of frame channels.
///
/// The link is considered lost when `inbound` closes.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Opens realtime links. Implemented over websockets by [`WsConnector`];
/// tests supply in-memory fakes.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Link, TransportError>;
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Returned by `subscribe`/`on_state_change`; pass to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Shared {
    state: ConnectionState,
    link: Option<mpsc::UnboundedSender<Frame>>,
    handlers: HashMap<String, Vec<(SubscriptionToken, EventHandler)>>,
    state_handlers: Vec<(SubscriptionToken, StateHandler)>,
    next_token: u64,
    shutdown: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Handle to the realtime channel. Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Shared {
            state: ConnectionState::Disconnected,
            link: None,
            handlers: HashMap::new(),
            state_handlers: Vec::new(),
            next_token: 0,
            shutdown: None,
            supervisor: None,
        };
        Self { inner: Arc::new(Inner { connector, policy, shared: Mutex::new(shared), state_tx }) }
    }

    /// Start the connection lifecycle for `user_id`. No-op while a
    /// supervisor is already running.
    pub fn connect(&self, user_id: UserId) {
        let mut shared = self.inner.lock();
        if shared.supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(%user_id, "transport: connect ignored, already running");
            return;
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        shared.shutdown = Some(shutdown_tx);
        drop(shared);

        self.inner.set_state(ConnectionState::Connecting);
        let task = tokio::spawn(supervise(Arc::clone(&self.inner), user_id, shutdown_rx));
        self.inner.lock().supervisor = Some(task);
    }

    /// Stop the lifecycle and wait for the supervisor to exit. The state is
    /// `Disconnected` when this returns.
    pub async fn disconnect(&self) {
        let (shutdown, supervisor) = {
            let mut shared = self.inner.lock();
            (shared.shutdown.take(), shared.supervisor.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Emit one event on the live socket.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] unless the state is
    /// `Connected`, and [`TransportError::Closed`] if the socket went away
    /// underneath the send.
    pub fn send(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        let link = {
            let shared = self.inner.lock();
            if !shared.state.is_connected() {
                return Err(TransportError::NotConnected);
            }
            shared.link.clone().ok_or(TransportError::NotConnected)?
        };
        link.send(Frame::new(event, payload)).map_err(|_| TransportError::Closed)
    }

    /// Convenience for sending a prepared [`Outbound`] command.
    ///
    /// # Errors
    ///
    /// Same as [`Transport::send`].
    pub fn emit(&self, command: Outbound) -> Result<(), TransportError> {
        self.send(command.event, command.data)
    }

    /// Register `handler` for inbound frames named `event`.
    pub fn subscribe(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> SubscriptionToken {
        let mut shared = self.inner.lock();
        let token = shared.issue_token();
        shared
            .handlers
            .entry(event.to_owned())
            .or_default()
            .push((token, Arc::new(handler)));
        token
    }

    /// Register `handler` for connection state transitions.
    pub fn on_state_change(&self, handler: impl Fn(ConnectionState) + Send + Sync + 'static) -> SubscriptionToken {
        let mut shared = self.inner.lock();
        let token = shared.issue_token();
        shared.state_handlers.push((token, Arc::new(handler)));
        token
    }

    /// Remove a subscription. Returns `false` if the token was unknown.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut shared = self.inner.lock();
        let before = shared.subscription_count();
        for handlers in shared.handlers.values_mut() {
            handlers.retain(|(t, _)| *t != token);
        }
        shared.handlers.retain(|_, handlers| !handlers.is_empty());
        shared.state_handlers.retain(|(t, _)| *t != token);
        shared.subscription_count() < before
    }

    /// Number of live subscriptions of either kind.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscription_count()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Watch channel mirroring the connection state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }
}

impl Shared {
    fn issue_token(&mut self) -> SubscriptionToken {
        self.next_token += 1;
        SubscriptionToken(self.next_token)
    }

    fn subscription_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum::<usize>() + self.state_handlers.len()
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let handlers = {
            let mut shared = self.lock();
            if shared.state == next {
                return;
            }
            let prev = shared.state;
            shared.state = next;
            info!(from = %prev, to = %next, "transport: state changed");
            shared.state_handlers.iter().map(|(_, h)| Arc::clone(h)).collect::<Vec<_>>()
        };
        self.state_tx.send_replace(next);
        for handler in handlers {
            handler(next);
        }
    }

    fn dispatch(&self, frame: &Frame) {
        let handlers = {
            let shared = self.lock();
            shared
                .handlers
                .get(&frame.event)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect::<Vec<_>>())
                .unwrap_or_default()
        };
        if handlers.is_empty() {
            trace!(event = %frame.event, "transport: no subscribers for frame");
            return;
        }
        for handler in handlers {
            handler(&frame.data);
        }
    }

    fn attach(&self, outbound: Option<mpsc::UnboundedSender<Frame>>) {
        self.lock().link = outbound;
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

enum LinkEnd {
    Shutdown,
    Lost,
}

async fn supervise(inner: Arc<Inner>, user_id: UserId, mut shutdown: oneshot::Receiver<()>) {
    let policy = inner.policy;
    let max_attempts = policy.max_attempts.max(1);
    let mut failures: u32 = 0;

    loop {
        let attempt = tokio::select! {
            _ = &mut shutdown => break,
            result = inner.connector.connect() => result,
        };

        match attempt {
            Ok(link) => {
                failures = 0;
                match run_link(&inner, user_id, link, &mut shutdown).await {
                    LinkEnd::Shutdown => break,
                    LinkEnd::Lost => {
                        warn!(%user_id, "transport: connection lost, reconnecting");
                        inner.set_state(ConnectionState::Reconnecting);
                    }
                }
            }
            Err(error) => {
                failures += 1;
                warn!(%user_id, attempt = failures, max_attempts, %error, "transport: connect failed");
                if failures >= max_attempts {
                    warn!(%user_id, "transport: reconnect attempts exhausted");
                    break;
                }
            }
        }

        let delay = with_jitter(policy.delay_for(failures.max(1)));
        debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "transport: backing off");
        tokio::select! {
            _ = &mut shutdown => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    inner.attach(None);
    inner.set_state(ConnectionState::Disconnected);
}

async fn run_link(inner: &Inner, user_id: UserId, link: Link, shutdown: &mut oneshot::Receiver<()>) -> LinkEnd {
    let Link { outbound, mut inbound } = link;
    // Announce is queued before any state handler can send on the link.
    for command in Outbound::announce(user_id) {
        if outbound.send(Frame::new(command.event, command.data)).is_err() {
            warn!(%user_id, "transport: announce failed, link already closed");
        }
    }
    info!(%user_id, "transport: session announced");
    inner.attach(Some(outbound));
    inner.set_state(ConnectionState::Connected);

    let end = loop {
        tokio::select! {
            _ = &mut *shutdown => break LinkEnd::Shutdown,
            frame = inbound.recv() => match frame {
                Some(frame) => inner.dispatch(&frame),
                None => break LinkEnd::Lost,
            },
        }
    };

    inner.attach(None);
    end
}

/// Add up to 10% random jitter so reconnecting clients spread out.
fn with_jitter(delay: Duration) -> Duration {
    let max_ms = u64::try_from(delay.as_millis() / 10).unwrap_or(0);
    if max_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
