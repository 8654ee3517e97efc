//! Presence tracker: per-peer online/offline state.
//!
//! Listeners hear about actual changes only. A connection loss resets every
//! online peer to offline and produces a single batched [`PresenceChange::Reset`]
//! rather than one notification per peer.

use std::collections::HashMap;

use crate::model::{PresenceState, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Peer { user_id: UserId, state: PresenceState },
    /// These peers went offline together because the connection dropped.
    Reset { user_ids: Vec<UserId> },
}

pub type PresenceListener = Box<dyn Fn(&PresenceChange) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct PresenceTracker {
    states: HashMap<UserId, PresenceState>,
    listeners: Vec<(ListenerId, PresenceListener)>,
    next_listener: u64,
}

impl PresenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status; peers never heard from are offline.
    #[must_use]
    pub fn status_of(&self, user_id: UserId) -> PresenceState {
        self.states.get(&user_id).copied().unwrap_or_default()
    }

    pub fn on_change(&mut self, listener: impl Fn(&PresenceChange) + Send + 'static) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(l, _)| *l != id);
        self.listeners.len() < before
    }

    /// Record a status signal. Returns `true` and notifies only when the
    /// stored value changed.
    pub fn apply(&mut self, user_id: UserId, state: PresenceState) -> bool {
        let previous = self.states.insert(user_id, state).unwrap_or_default();
        if previous == state {
            return false;
        }
        self.notify(&PresenceChange::Peer { user_id, state });
        true
    }

    /// Mark every tracked peer offline in one step. Returns the peers that
    /// changed; listeners are notified once if there were any.
    pub fn reset_all(&mut self) -> Vec<UserId> {
        let mut changed: Vec<UserId> = self
            .states
            .iter_mut()
            .filter(|(_, state)| **state != PresenceState::Offline)
            .map(|(user_id, state)| {
                *state = PresenceState::Offline;
                *user_id
            })
            .collect();
        if changed.is_empty() {
            return changed;
        }
        changed.sort_unstable();
        self.notify(&PresenceChange::Reset { user_ids: changed.clone() });
        changed
    }

    /// Snapshot of every tracked peer.
    #[must_use]
    pub fn statuses(&self) -> HashMap<UserId, PresenceState> {
        self.states.clone()
    }

    /// Forget all state and listeners (logout).
    pub fn clear(&mut self) {
        self.states.clear();
        self.listeners.clear();
    }

    fn notify(&self, change: &PresenceChange) {
        for (_, listener) in &self.listeners {
            listener(change);
        }
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
