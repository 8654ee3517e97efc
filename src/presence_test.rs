use super::*;
use std::sync::{Arc, Mutex};

fn recording(tracker: &mut PresenceTracker) -> Arc<Mutex<Vec<PresenceChange>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    tracker.on_change(move |change| sink.lock().unwrap().push(change.clone()));
    seen
}

#[test]
fn unknown_peer_is_offline() {
    let tracker = PresenceTracker::new();
    assert_eq!(tracker.status_of(UserId(42)), PresenceState::Offline);
}

#[test]
fn apply_notifies_only_on_change() {
    let mut tracker = PresenceTracker::new();
    let seen = recording(&mut tracker);

    assert!(tracker.apply(UserId(2), PresenceState::Online));
    assert!(!tracker.apply(UserId(2), PresenceState::Online));
    assert!(!tracker.apply(UserId(3), PresenceState::Offline));
    assert!(tracker.apply(UserId(2), PresenceState::Offline));

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            PresenceChange::Peer { user_id: UserId(2), state: PresenceState::Online },
            PresenceChange::Peer { user_id: UserId(2), state: PresenceState::Offline },
        ]
    );
}

#[test]
fn reset_all_batches_into_one_notification() {
    let mut tracker = PresenceTracker::new();
    tracker.apply(UserId(3), PresenceState::Online);
    tracker.apply(UserId(2), PresenceState::Online);
    tracker.apply(UserId(4), PresenceState::Offline);
    let seen = recording(&mut tracker);

    let changed = tracker.reset_all();

    assert_eq!(changed, vec![UserId(2), UserId(3)]);
    assert_eq!(*seen.lock().unwrap(), vec![PresenceChange::Reset { user_ids: vec![UserId(2), UserId(3)] }]);
    assert_eq!(tracker.status_of(UserId(2)), PresenceState::Offline);
    assert_eq!(tracker.status_of(UserId(3)), PresenceState::Offline);
}

#[test]
fn reset_with_nobody_online_is_silent() {
    let mut tracker = PresenceTracker::new();
    tracker.apply(UserId(2), PresenceState::Offline);
    let seen = recording(&mut tracker);

    assert!(tracker.reset_all().is_empty());
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn removed_listener_stops_hearing() {
    let mut tracker = PresenceTracker::new();
    let seen = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&seen);
    let id = tracker.on_change(move |_| *sink.lock().unwrap() += 1);

    tracker.apply(UserId(2), PresenceState::Online);
    assert!(tracker.remove_listener(id));
    tracker.apply(UserId(2), PresenceState::Offline);

    assert_eq!(*seen.lock().unwrap(), 1);
    assert!(!tracker.remove_listener(id));
}

#[test]
fn clear_forgets_everything() {
    let mut tracker = PresenceTracker::new();
    let seen = recording(&mut tracker);
    tracker.apply(UserId(2), PresenceState::Online);
    tracker.clear();

    assert_eq!(tracker.status_of(UserId(2)), PresenceState::Offline);
    assert!(tracker.statuses().is_empty());
    tracker.apply(UserId(2), PresenceState::Online);
    assert_eq!(seen.lock().unwrap().len(), 1);
}
