//! Typing controller: outbound debounce and inbound typing state.
//!
//! DESIGN
//! ======
//! Outbound is a two-state machine, `Idle` and `Pending { to }`. The first
//! activity after idle emits `start_typing`; every activity replaces the
//! single quiet-period timer. When the timer expires the controller emits
//! `stop_typing` and returns to idle.
//!
//! Timers never mutate the controller. On expiry they hand an epoch-tagged
//! [`TypingTimer`] to the injected sink, which the owner feeds back through
//! [`TypingController::quiet_elapsed`] / [`TypingController::watchdog_elapsed`].
//! A timer whose epoch no longer matches was superseded and is ignored, so a
//! cancel that races an already-queued expiry is still exact.
//!
//! Inbound state is set straight from the remote flag. The optional watchdog
//! bounds how long a `typing` peer can stay stale without a stop signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::TypingConfig;
use crate::event::Outbound;
use crate::model::{TypingState, UserId};

/// Expiry notice produced by a controller timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingTimer {
    Quiet { epoch: u64 },
    Watchdog { user_id: UserId, epoch: u64 },
}

pub type TimerSink = Arc<dyn Fn(TypingTimer) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundState {
    Idle,
    Pending { to: UserId, epoch: u64 },
}

struct Watchdog {
    epoch: u64,
    handle: JoinHandle<()>,
}

pub struct TypingController {
    self_id: UserId,
    config: TypingConfig,
    sink: TimerSink,
    outbound: OutboundState,
    quiet_timer: Option<JoinHandle<()>>,
    next_epoch: u64,
    remote: HashMap<UserId, TypingState>,
    watchdogs: HashMap<UserId, Watchdog>,
}

impl TypingController {
    #[must_use]
    pub fn new(self_id: UserId, config: TypingConfig, sink: TimerSink) -> Self {
        Self {
            self_id,
            config,
            sink,
            outbound: OutboundState::Idle,
            quiet_timer: None,
            next_epoch: 0,
            remote: HashMap::new(),
            watchdogs: HashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Local typing activity aimed at `to`. Returns the commands to emit:
    /// nothing while already pending for `to`, `start_typing` on the edge
    /// from idle, and `stop_typing` + `start_typing` when the target changed.
    pub fn activity(&mut self, to: UserId) -> Vec<Outbound> {
        let mut commands = Vec::new();
        match self.outbound {
            OutboundState::Pending { to: current, .. } if current == to => {}
            OutboundState::Pending { to: previous, .. } => {
                commands.push(Outbound::stop_typing(self.self_id, previous));
                commands.push(Outbound::start_typing(self.self_id, to));
            }
            OutboundState::Idle => commands.push(Outbound::start_typing(self.self_id, to)),
        }

        let epoch = self.bump_epoch();
        self.cancel_quiet_timer();
        self.quiet_timer = Some(self.arm(self.config.quiet_period, TypingTimer::Quiet { epoch }));
        self.outbound = OutboundState::Pending { to, epoch };
        commands
    }

    /// The quiet-period timer tagged `epoch` expired.
    pub fn quiet_elapsed(&mut self, epoch: u64) -> Option<Outbound> {
        match self.outbound {
            OutboundState::Pending { to, epoch: current } if current == epoch => {
                self.quiet_timer = None;
                self.outbound = OutboundState::Idle;
                Some(Outbound::stop_typing(self.self_id, to))
            }
            _ => {
                debug!(epoch, "typing: ignoring superseded quiet timer");
                None
            }
        }
    }

    /// Cancel the quiet timer and stop immediately if typing had started
    /// (message submitted, or the conversation changed).
    pub fn force_stop(&mut self) -> Option<Outbound> {
        self.cancel_quiet_timer();
        match std::mem::replace(&mut self.outbound, OutboundState::Idle) {
            OutboundState::Pending { to, .. } => Some(Outbound::stop_typing(self.self_id, to)),
            OutboundState::Idle => None,
        }
    }

    /// Drop outbound state without emitting anything (the channel is gone).
    pub fn reset_outbound(&mut self) {
        self.cancel_quiet_timer();
        self.outbound = OutboundState::Idle;
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.outbound, OutboundState::Pending { .. })
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Apply a remote `typing_status`. Ignored unless `connected`. Returns
    /// `true` when the stored state changed.
    pub fn apply_remote(&mut self, user_id: UserId, is_typing: bool, connected: bool) -> bool {
        if !connected {
            debug!(%user_id, "typing: ignoring remote signal while disconnected");
            return false;
        }
        let next = TypingState::from_flag(is_typing);
        let previous = self.remote.insert(user_id, next).unwrap_or_default();

        if let Some(old) = self.watchdogs.remove(&user_id) {
            old.handle.abort();
        }
        if next == TypingState::Typing
            && let Some(after) = self.config.watchdog
        {
            let epoch = self.bump_epoch();
            let handle = self.arm(after, TypingTimer::Watchdog { user_id, epoch });
            self.watchdogs.insert(user_id, Watchdog { epoch, handle });
        }
        previous != next
    }

    /// The inbound watchdog for `user_id` expired. Returns `true` when the
    /// peer was flipped back to idle.
    pub fn watchdog_elapsed(&mut self, user_id: UserId, epoch: u64) -> bool {
        if self.watchdogs.get(&user_id).is_none_or(|w| w.epoch != epoch) {
            return false;
        }
        self.watchdogs.remove(&user_id);
        debug!(%user_id, "typing: watchdog expired without stop signal");
        self.remote.insert(user_id, TypingState::Idle) == Some(TypingState::Typing)
    }

    /// Every typing peer back to idle. Returns the peers that changed.
    pub fn reset_remote(&mut self) -> Vec<UserId> {
        for (_, watchdog) in self.watchdogs.drain() {
            watchdog.handle.abort();
        }
        let mut changed: Vec<UserId> = self
            .remote
            .iter_mut()
            .filter(|(_, state)| **state == TypingState::Typing)
            .map(|(user_id, state)| {
                *state = TypingState::Idle;
                *user_id
            })
            .collect();
        changed.sort_unstable();
        changed
    }

    #[must_use]
    pub fn state_of(&self, user_id: UserId) -> TypingState {
        self.remote.get(&user_id).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn states(&self) -> HashMap<UserId, TypingState> {
        self.remote.clone()
    }

    /// Cancel every timer and forget all state (logout).
    pub fn shutdown(&mut self) {
        self.reset_outbound();
        self.reset_remote();
        self.remote.clear();
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn cancel_quiet_timer(&mut self) {
        if let Some(timer) = self.quiet_timer.take() {
            timer.abort();
        }
    }

    fn arm(&self, after: Duration, timer: TypingTimer) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            sink(timer);
        })
    }
}

impl Drop for TypingController {
    fn drop(&mut self) {
        self.cancel_quiet_timer();
        for (_, watchdog) in self.watchdogs.drain() {
            watchdog.handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod tests;
