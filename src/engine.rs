//! Synchronization engine: the single serialized event loop.
//!
//! ARCHITECTURE
//! ============
//! [`Engine::start`] spawns one task that owns the conversation, presence and
//! typing state. Everything that can change that state is turned into an
//! [`Input`] on one unbounded queue:
//!
//! - transport frames and connection transitions (from transport handlers),
//! - typing timer expiries (from the controller's timer sink),
//! - history completions (from loader tasks),
//! - caller commands (from the [`Engine`] handle).
//!
//! The loop applies inputs one at a time, so a history completion can never
//! interleave with a live message, and a disconnect reset lands exactly where
//! the transport reported it relative to the frames around it.
//!
//! Observers read a [`Snapshot`] through a watch channel and discrete
//! [`EngineEvent`]s through a broadcast channel.
//!
//! TEARDOWN
//! ========
//! `logout` removes every transport subscription before disconnecting, so no
//! handler outlives the session, then cancels timers, clears state and stops
//! the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, TypingConfig};
use crate::conversation::{Conversation, HistoryOutcome, HistoryTicket};
use crate::error::{EngineError, ErrorCode};
use crate::event::{INBOUND_EVENTS, InboundEvent, Outbound};
use crate::history::{ApiClient, HistoryLoaded, HistoryLoader};
use crate::model::{ConnectionState, Message, Peer, PresenceState, Session, TypingState, UserId};
use crate::presence::{PresenceChange, PresenceTracker};
use crate::transport::{SubscriptionToken, Transport, WsConnector};
use crate::typing::{TimerSink, TypingController, TypingTimer};

const EVENT_BUFFER: usize = 256;

// =============================================================================
// OBSERVABLE STATE
// =============================================================================

/// Point-in-time view of everything the engine tracks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub connection: ConnectionState,
    pub active_peer: Option<Peer>,
    pub messages: Vec<Message>,
    pub presence: HashMap<UserId, PresenceState>,
    pub typing: HashMap<UserId, TypingState>,
    /// A backlog fetch for the active peer is outstanding.
    pub loading: bool,
    /// Inbound events dropped because their payload did not parse.
    pub malformed_events: u64,
}

impl Snapshot {
    #[must_use]
    pub fn status_of(&self, user_id: UserId) -> PresenceState {
        self.presence.get(&user_id).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn typing_of(&self, user_id: UserId) -> TypingState {
        self.typing.get(&user_id).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn message_ids(&self) -> Vec<i64> {
        self.messages.iter().map(|m| m.id.0).collect()
    }
}

/// Discrete changes, for callers that react rather than poll.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    MessageAppended(Message),
    /// The backlog for `peer_id` was applied; the sequence was replaced.
    HistoryApplied { peer_id: UserId, count: usize },
    HistoryFailed { peer_id: UserId, code: &'static str, message: String, retryable: bool },
    Presence(PresenceChange),
    Typing { user_id: UserId, state: TypingState },
    /// Every listed peer went idle at once because the connection dropped.
    TypingReset { user_ids: Vec<UserId> },
    Connection(ConnectionState),
    /// Reconnection gave up; the caller decides whether to re-authenticate.
    TransportLost,
    LoggedOut,
}

// =============================================================================
// INPUT QUEUE
// =============================================================================

enum Input {
    Frame { event: &'static str, data: Value },
    Connection(ConnectionState),
    Timer(TypingTimer),
    History(HistoryLoaded),
    Command(Command),
}

enum Command {
    SelectPeer { peer: Peer, reply: oneshot::Sender<PresenceState> },
    Send { content: String, reply: oneshot::Sender<Result<bool, EngineError>> },
    TypingActivity,
    RetryHistory { reply: oneshot::Sender<Result<(), EngineError>> },
    Logout { reply: Option<oneshot::Sender<()>> },
}

// =============================================================================
// HANDLE
// =============================================================================

/// Handle to a running engine. Dropping it without [`Engine::logout`] still
/// tears the session down, just without waiting for it.
pub struct Engine {
    session: Session,
    input: mpsc::UnboundedSender<Input>,
    snapshot: watch::Receiver<Snapshot>,
    events: broadcast::Sender<EngineEvent>,
    task: Option<JoinHandle<()>>,
}

impl Engine {
    /// Wire the websocket transport and REST client from `config` and start.
    ///
    /// # Errors
    ///
    /// [`EngineError::AuthenticationMissing`] without a usable session, or a
    /// config/API error if the collaborators cannot be built.
    pub fn from_config(config: &EngineConfig, session: Option<Session>) -> Result<Self, EngineError> {
        let session = authenticated(session)?;
        let connector = WsConnector::new(config.websocket_url()?, session.auth_token.clone(), config.connect_timeout);
        let transport = Transport::new(Arc::new(connector), config.reconnect);
        let loader = HistoryLoader::new(Arc::new(ApiClient::new(config)?));
        Self::start(Some(session), config.typing, transport, loader)
    }

    /// Start the event loop and connect `transport` for the session.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AuthenticationMissing`] when `session` is absent
    /// or carries a blank token; nothing is started in that case.
    pub fn start(
        session: Option<Session>,
        typing: TypingConfig,
        transport: Transport,
        loader: HistoryLoader,
    ) -> Result<Self, EngineError> {
        let session = authenticated(session)?;
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let mut subscriptions = Vec::with_capacity(INBOUND_EVENTS.len() + 1);
        for event in INBOUND_EVENTS {
            let tx = input_tx.clone();
            subscriptions.push(transport.subscribe(event, move |data| {
                let _ = tx.send(Input::Frame { event, data: data.clone() });
            }));
        }
        let tx = input_tx.clone();
        subscriptions.push(transport.on_state_change(move |state| {
            let _ = tx.send(Input::Connection(state));
        }));

        let tx = input_tx.clone();
        let sink: TimerSink = Arc::new(move |timer| {
            let _ = tx.send(Input::Timer(timer));
        });

        let mut presence = PresenceTracker::new();
        let bus = events.clone();
        presence.on_change(move |change| {
            let _ = bus.send(EngineEvent::Presence(change.clone()));
        });

        let connection = transport.state();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot { connection, ..Snapshot::default() });

        let actor = Actor {
            session: session.clone(),
            transport: transport.clone(),
            loader,
            input: input_tx.clone(),
            conversation: Conversation::new(session.user_id),
            presence,
            typing: TypingController::new(session.user_id, typing, sink),
            connection,
            connected_once: connection.is_connected(),
            subscriptions,
            fetches: Vec::new(),
            malformed: 0,
            snapshot: snapshot_tx,
            events: events.clone(),
        };
        let task = tokio::spawn(actor.run(input_rx));

        info!(user_id = %session.user_id, "engine: started");
        transport.connect(session.user_id);

        Ok(Self { session, input: input_tx, snapshot: snapshot_rx, events, task: Some(task) })
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Make `peer` the active conversation. Returns the peer's current
    /// presence.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] after logout.
    pub async fn select_peer(&self, peer: Peer) -> Result<PresenceState, EngineError> {
        self.request(|reply| Command::SelectPeer { peer, reply }).await
    }

    /// Send `content` to the active peer. Returns `Ok(false)` for blank
    /// content, which sends nothing. The message shows up in the sequence
    /// once the server echoes it back.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoActivePeer`] without a selection, a transport error
    /// when the channel is not connected, or [`EngineError::Stopped`].
    pub async fn send_message(&self, content: impl Into<String>) -> Result<bool, EngineError> {
        let content = content.into();
        self.request(|reply| Command::Send { content, reply }).await?
    }

    /// Signal local typing activity toward the active peer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stopped`] after logout.
    pub fn typing_activity(&self) -> Result<(), EngineError> {
        self.input.send(Input::Command(Command::TypingActivity)).map_err(|_| EngineError::Stopped)
    }

    /// Re-issue the backlog fetch for the active peer.
    ///
    /// # Errors
    ///
    /// [`EngineError::NoActivePeer`] or [`EngineError::Stopped`].
    pub async fn retry_history(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::RetryHistory { reply }).await?
    }

    /// Tear the session down and wait for the loop to exit.
    pub async fn logout(mut self) {
        let (reply, done) = oneshot::channel();
        if self.input.send(Input::Command(Command::Logout { reply: Some(reply) })).is_ok() {
            let _ = done.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn status_of(&self, user_id: UserId) -> PresenceState {
        self.snapshot.borrow().status_of(user_id)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.input.send(Input::Command(build(reply))).map_err(|_| EngineError::Stopped)?;
        response.await.map_err(|_| EngineError::Stopped)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.input.send(Input::Command(Command::Logout { reply: None }));
        }
    }
}

fn authenticated(session: Option<Session>) -> Result<Session, EngineError> {
    match session {
        Some(session) if session.is_authenticated() => Ok(session),
        _ => {
            warn!("engine: refusing to start without an authenticated session");
            Err(EngineError::AuthenticationMissing)
        }
    }
}

// =============================================================================
// EVENT LOOP
// =============================================================================

struct Actor {
    session: Session,
    transport: Transport,
    loader: HistoryLoader,
    input: mpsc::UnboundedSender<Input>,
    conversation: Conversation,
    presence: PresenceTracker,
    typing: TypingController,
    connection: ConnectionState,
    connected_once: bool,
    subscriptions: Vec<SubscriptionToken>,
    fetches: Vec<JoinHandle<()>>,
    malformed: u64,
    snapshot: watch::Sender<Snapshot>,
    events: broadcast::Sender<EngineEvent>,
}

impl Actor {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inputs.recv().await {
            match input {
                Input::Frame { event, data } => self.on_frame(event, &data),
                Input::Connection(state) => self.on_connection(state),
                Input::Timer(timer) => self.on_timer(timer),
                Input::History(loaded) => self.on_history(loaded),
                Input::Command(Command::Logout { reply }) => {
                    self.teardown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
                Input::Command(command) => self.on_command(command),
            }
            self.publish();
        }
        debug!(user_id = %self.session.user_id, "engine: event loop exited");
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    fn on_frame(&mut self, event: &'static str, data: &Value) {
        let parsed = match InboundEvent::parse(event, data) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.malformed += 1;
                warn!(%error, total = self.malformed, "engine: dropping malformed event");
                return;
            }
        };
        match parsed {
            InboundEvent::Message(message) => {
                if self.conversation.receive(message.clone()) {
                    self.emit(EngineEvent::MessageAppended(message));
                }
            }
            InboundEvent::StatusChange { user_id, status } => {
                self.presence.apply(user_id, status);
            }
            InboundEvent::Typing { user_id, is_typing } => {
                if self.typing.apply_remote(user_id, is_typing, self.connection.is_connected()) {
                    self.emit(EngineEvent::Typing { user_id, state: TypingState::from_flag(is_typing) });
                }
            }
        }
    }

    fn on_connection(&mut self, next: ConnectionState) {
        let previous = std::mem::replace(&mut self.connection, next);
        if previous == next {
            return;
        }
        self.emit(EngineEvent::Connection(next));

        if previous.is_connected() {
            // Presence and typing reset in the same step the loss is observed.
            self.presence.reset_all();
            let idle = self.typing.reset_remote();
            if !idle.is_empty() {
                self.emit(EngineEvent::TypingReset { user_ids: idle });
            }
            self.typing.reset_outbound();
        }

        match next {
            ConnectionState::Connected if self.connected_once => {
                info!(user_id = %self.session.user_id, "engine: reconnected, resyncing");
                if let Some(ticket) = self.conversation.reload() {
                    self.spawn_fetch(ticket);
                }
            }
            ConnectionState::Connected => self.connected_once = true,
            ConnectionState::Disconnected => {
                warn!(user_id = %self.session.user_id, "engine: transport lost");
                self.emit(EngineEvent::TransportLost);
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        }
    }

    // -------------------------------------------------------------------------
    // Timers and history
    // -------------------------------------------------------------------------

    fn on_timer(&mut self, timer: TypingTimer) {
        match timer {
            TypingTimer::Quiet { epoch } => {
                if let Some(stop) = self.typing.quiet_elapsed(epoch) {
                    self.send_best_effort(stop);
                }
            }
            TypingTimer::Watchdog { user_id, epoch } => {
                if self.typing.watchdog_elapsed(user_id, epoch) {
                    self.emit(EngineEvent::Typing { user_id, state: TypingState::Idle });
                }
            }
        }
    }

    fn on_history(&mut self, loaded: HistoryLoaded) {
        let HistoryLoaded { ticket, result } = loaded;
        match self.conversation.apply_history(ticket, result) {
            HistoryOutcome::Applied { count } => {
                info!(peer_id = %ticket.peer_id, count, "engine: history applied");
                self.emit(EngineEvent::HistoryApplied { peer_id: ticket.peer_id, count });
            }
            HistoryOutcome::Stale => {}
            HistoryOutcome::Failed(error) => {
                warn!(peer_id = %ticket.peer_id, %error, "engine: history failed");
                self.emit(EngineEvent::HistoryFailed {
                    peer_id: ticket.peer_id,
                    code: error.error_code(),
                    message: error.to_string(),
                    retryable: error.retryable(),
                });
            }
        }
    }

    fn spawn_fetch(&mut self, ticket: HistoryTicket) {
        self.fetches.retain(|task| !task.is_finished());
        let input = self.input.clone();
        let task = self.loader.spawn_fetch(ticket, self.session.auth_token.clone(), move |loaded| {
            let _ = input.send(Input::History(loaded));
        });
        self.fetches.push(task);
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SelectPeer { peer, reply } => {
                if let Some(stop) = self.typing.force_stop() {
                    self.send_best_effort(stop);
                }
                let status = self.presence.status_of(peer.id);
                let ticket = self.conversation.select_peer(peer);
                self.spawn_fetch(ticket);
                let _ = reply.send(status);
            }
            Command::Send { content, reply } => {
                let _ = reply.send(self.send_message(&content));
            }
            Command::TypingActivity => {
                let Some(peer_id) = self.conversation.active_peer().map(|p| p.id) else {
                    return;
                };
                if !self.connection.is_connected() {
                    debug!("engine: typing activity ignored while disconnected");
                    return;
                }
                for command in self.typing.activity(peer_id) {
                    self.send_best_effort(command);
                }
            }
            Command::RetryHistory { reply } => {
                let result = match self.conversation.reload() {
                    Some(ticket) => {
                        self.spawn_fetch(ticket);
                        Ok(())
                    }
                    None => Err(EngineError::NoActivePeer),
                };
                let _ = reply.send(result);
            }
            Command::Logout { .. } => {}
        }
    }

    fn send_message(&mut self, content: &str) -> Result<bool, EngineError> {
        let Some(command) = self.conversation.prepare_send(content)? else {
            return Ok(false);
        };
        let sent = self.transport.emit(command);
        if let Some(stop) = self.typing.force_stop() {
            self.send_best_effort(stop);
        }
        sent?;
        Ok(true)
    }

    async fn teardown(&mut self) {
        info!(user_id = %self.session.user_id, "engine: logging out");
        if let Some(stop) = self.typing.force_stop() {
            self.send_best_effort(stop);
        }
        for token in self.subscriptions.drain(..) {
            self.transport.unsubscribe(token);
        }
        self.transport.disconnect().await;
        for task in self.fetches.drain(..) {
            task.abort();
        }

        self.typing.shutdown();
        self.presence.clear();
        self.conversation.clear();
        self.connection = ConnectionState::Disconnected;
        self.malformed = 0;
        self.publish();
        self.emit(EngineEvent::LoggedOut);
    }

    // -------------------------------------------------------------------------
    // Output
    // -------------------------------------------------------------------------

    fn send_best_effort(&self, command: Outbound) {
        let event = command.event;
        if let Err(error) = self.transport.emit(command) {
            debug!(event, %error, "engine: command not sent");
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(Snapshot {
            connection: self.connection,
            active_peer: self.conversation.active_peer().cloned(),
            messages: self.conversation.messages().to_vec(),
            presence: self.presence.statuses(),
            typing: self.typing.states(),
            loading: self.conversation.is_loading(),
            malformed_events: self.malformed,
        });
    }
}

/// Wait until `engine`'s snapshot satisfies `predicate`, up to `limit`.
///
/// Returns the matching snapshot, or `None` on timeout or shutdown.
pub async fn wait_for_snapshot(
    engine: &Engine,
    limit: Duration,
    predicate: impl FnMut(&Snapshot) -> bool,
) -> Option<Snapshot> {
    let mut watch = engine.watch();
    let result = tokio::time::timeout(limit, watch.wait_for(predicate)).await;
    match result {
        Ok(Ok(snapshot)) => Some(snapshot.clone()),
        _ => None,
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
