//! Conversation synchronizer: the merged message view for the active peer.
//!
//! DESIGN
//! ======
//! This is plain synchronous state; the engine's event loop is the only
//! caller, so every method sees a consistent view.
//!
//! - Selecting a peer bumps the [`Generation`], clears the sequence and
//!   returns a [`HistoryTicket`]. Any completion carrying an older ticket is
//!   stale and is dropped without touching the sequence.
//! - A live message is appended iff it belongs to the active
//!   [`ConversationKey`] and its id is new.
//! - Applying history makes the backlog the prefix of the sequence. Entries
//!   already shown that the backlog does not contain (live arrivals during
//!   the fetch) follow it, in their existing order. The visible sequence is
//!   the only record kept.
//! - Sends are echo-based: nothing is appended until the server relays the
//!   stored message back as a live `message` event.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::EngineError;
use crate::event::Outbound;
use crate::history::ApiError;
use crate::model::{ConversationKey, Message, MessageId, Peer, UserId};

/// Monotonic tag invalidating history results after a peer switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

/// Identifies one issued backlog request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryTicket {
    pub generation: Generation,
    pub peer_id: UserId,
}

#[derive(Debug)]
pub enum HistoryOutcome {
    Applied { count: usize },
    Stale,
    Failed(ApiError),
}

pub struct Conversation {
    self_id: UserId,
    active: Option<Peer>,
    generation: Generation,
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    loading: bool,
}

impl Conversation {
    #[must_use]
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            active: None,
            generation: Generation::default(),
            messages: Vec::new(),
            seen: HashSet::new(),
            loading: false,
        }
    }

    /// Make `peer` the active conversation and issue its backlog request.
    pub fn select_peer(&mut self, peer: Peer) -> HistoryTicket {
        info!(peer_id = %peer.id, "conversation: peer selected");
        self.messages.clear();
        self.seen.clear();
        let peer_id = peer.id;
        self.active = Some(peer);
        self.issue_ticket(peer_id)
    }

    /// Re-request the active backlog without clearing the current view
    /// (retry after failure, resync after reconnect).
    pub fn reload(&mut self) -> Option<HistoryTicket> {
        let peer_id = self.active.as_ref()?.id;
        Some(self.issue_ticket(peer_id))
    }

    /// Apply a backlog completion.
    pub fn apply_history(
        &mut self,
        ticket: HistoryTicket,
        result: Result<Vec<Message>, ApiError>,
    ) -> HistoryOutcome {
        if !self.is_current(ticket) {
            debug!(
                peer_id = %ticket.peer_id,
                generation = ticket.generation.0,
                current = self.generation.0,
                "conversation: dropping stale history"
            );
            return HistoryOutcome::Stale;
        }
        self.loading = false;

        let history = match result {
            Ok(history) => history,
            Err(error) => return HistoryOutcome::Failed(error),
        };
        let Some(key) = self.key() else {
            return HistoryOutcome::Stale;
        };

        let shown = std::mem::take(&mut self.messages);
        self.seen.clear();
        let mut foreign = 0_usize;
        for message in history {
            if !key.contains(&message) {
                foreign += 1;
                continue;
            }
            self.push_unique(message);
        }
        let count = self.messages.len();
        for message in shown {
            self.push_unique(message);
        }
        if foreign > 0 {
            debug!(foreign, "conversation: backlog contained messages outside the conversation");
        }
        HistoryOutcome::Applied { count }
    }

    /// Offer a live message. Returns `true` if it was appended.
    pub fn receive(&mut self, message: Message) -> bool {
        let Some(key) = self.key() else {
            return false;
        };
        if !key.contains(&message) || self.seen.contains(&message.id) {
            return false;
        }
        self.push_unique(message)
    }

    /// Build the `sendMessage` command for `content`.
    ///
    /// Returns `Ok(None)` for blank content. The command carries the content
    /// as typed; only the emptiness check trims.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActivePeer`] when no peer is selected.
    pub fn prepare_send(&self, content: &str) -> Result<Option<Outbound>, EngineError> {
        let peer = self.active.as_ref().ok_or(EngineError::NoActivePeer)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Outbound::send_message(self.self_id, peer.id, content)))
    }

    /// Drop the active conversation entirely (logout).
    pub fn clear(&mut self) {
        self.active = None;
        self.messages.clear();
        self.seen.clear();
        self.loading = false;
        self.generation = Generation(self.generation.0 + 1);
    }

    #[must_use]
    pub fn key(&self) -> Option<ConversationKey> {
        self.active.as_ref().map(|peer| ConversationKey::new(self.self_id, peer.id))
    }

    #[must_use]
    pub fn active_peer(&self) -> Option<&Peer> {
        self.active.as_ref()
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    fn issue_ticket(&mut self, peer_id: UserId) -> HistoryTicket {
        self.generation = Generation(self.generation.0 + 1);
        self.loading = true;
        HistoryTicket { generation: self.generation, peer_id }
    }

    fn is_current(&self, ticket: HistoryTicket) -> bool {
        ticket.generation == self.generation && self.active.as_ref().is_some_and(|p| p.id == ticket.peer_id)
    }

    fn push_unique(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

#[cfg(test)]
#[path = "conversation_test.rs"]
mod tests;
