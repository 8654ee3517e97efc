use super::*;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};

fn controller(watchdog: Option<Duration>) -> (TypingController, mpsc::UnboundedReceiver<TypingTimer>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: TimerSink = Arc::new(move |timer| {
        let _ = tx.send(timer);
    });
    let config = TypingConfig { quiet_period: Duration::from_millis(1000), watchdog };
    (TypingController::new(UserId(1), config, sink), rx)
}

async fn next_timer(rx: &mut mpsc::UnboundedReceiver<TypingTimer>) -> TypingTimer {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timer did not fire")
        .expect("sink dropped")
}

fn events(commands: &[Outbound]) -> Vec<&'static str> {
    commands.iter().map(|c| c.event).collect()
}

#[tokio::test(start_paused = true)]
async fn burst_of_keystrokes_sends_one_start_and_one_stop() {
    let (mut typing, mut timers) = controller(None);
    let mut sent = Vec::new();

    sent.extend(typing.activity(UserId(2)));
    for _ in 0..2 {
        sleep(Duration::from_millis(200)).await;
        sent.extend(typing.activity(UserId(2)));
    }
    let last_activity = Instant::now();
    assert_eq!(events(&sent), vec!["start_typing"]);

    let TypingTimer::Quiet { epoch } = next_timer(&mut timers).await else { panic!("expected quiet timer") };
    assert!(last_activity.elapsed() >= Duration::from_millis(1000));
    let stop = typing.quiet_elapsed(epoch).expect("stop after quiet period");
    assert_eq!(stop.event, "stop_typing");
    assert_eq!(stop.data, serde_json::json!({"userId": 1, "recipientId": 2}));
    assert!(!typing.is_pending());

    // Replaced timers were cancelled, not merely ignored.
    sleep(Duration::from_secs(5)).await;
    assert!(timers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn activity_after_stop_starts_again() {
    let (mut typing, mut timers) = controller(None);
    typing.activity(UserId(2));
    let TypingTimer::Quiet { epoch } = next_timer(&mut timers).await else { panic!() };
    assert!(typing.quiet_elapsed(epoch).is_some());

    assert_eq!(events(&typing.activity(UserId(2))), vec!["start_typing"]);
}

#[tokio::test(start_paused = true)]
async fn superseded_epoch_is_ignored() {
    let (mut typing, _timers) = controller(None);
    typing.activity(UserId(2));
    typing.activity(UserId(2));
    assert!(typing.quiet_elapsed(1).is_none());
    assert!(typing.is_pending());
}

#[tokio::test(start_paused = true)]
async fn force_stop_cancels_timer_and_emits_stop_once() {
    let (mut typing, mut timers) = controller(None);
    typing.activity(UserId(2));

    let stop = typing.force_stop().expect("pending typing should stop");
    assert_eq!(stop.event, "stop_typing");
    assert!(typing.force_stop().is_none());

    sleep(Duration::from_secs(3)).await;
    assert!(timers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn force_stop_when_idle_sends_nothing() {
    let (mut typing, _timers) = controller(None);
    assert!(typing.force_stop().is_none());
}

#[tokio::test(start_paused = true)]
async fn switching_target_stops_previous_peer() {
    let (mut typing, _timers) = controller(None);
    typing.activity(UserId(2));
    let commands = typing.activity(UserId(3));
    assert_eq!(events(&commands), vec!["stop_typing", "start_typing"]);
    assert_eq!(commands[0].data["recipientId"], 2);
    assert_eq!(commands[1].data["recipientId"], 3);
}

#[tokio::test(start_paused = true)]
async fn reset_outbound_is_silent() {
    let (mut typing, mut timers) = controller(None);
    typing.activity(UserId(2));
    typing.reset_outbound();
    assert!(!typing.is_pending());
    assert!(typing.force_stop().is_none());
    sleep(Duration::from_secs(3)).await;
    assert!(timers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn remote_flag_sets_state_directly() {
    let (mut typing, _timers) = controller(None);
    assert!(typing.apply_remote(UserId(2), true, true));
    assert!(!typing.apply_remote(UserId(2), true, true));
    assert_eq!(typing.state_of(UserId(2)), TypingState::Typing);
    assert!(typing.apply_remote(UserId(2), false, true));
    assert_eq!(typing.state_of(UserId(2)), TypingState::Idle);
}

#[tokio::test(start_paused = true)]
async fn remote_signal_ignored_while_disconnected() {
    let (mut typing, _timers) = controller(None);
    assert!(!typing.apply_remote(UserId(2), true, false));
    assert_eq!(typing.state_of(UserId(2)), TypingState::Idle);
}

#[tokio::test(start_paused = true)]
async fn reset_remote_returns_only_typing_peers() {
    let (mut typing, _timers) = controller(None);
    typing.apply_remote(UserId(3), true, true);
    typing.apply_remote(UserId(2), true, true);
    typing.apply_remote(UserId(4), false, true);

    assert_eq!(typing.reset_remote(), vec![UserId(2), UserId(3)]);
    assert!(typing.states().values().all(|s| *s == TypingState::Idle));
}

#[tokio::test(start_paused = true)]
async fn watchdog_expires_stale_remote_typing() {
    let (mut typing, mut timers) = controller(Some(Duration::from_secs(5)));
    typing.apply_remote(UserId(2), true, true);

    let TypingTimer::Watchdog { user_id, epoch } = next_timer(&mut timers).await else {
        panic!("expected watchdog")
    };
    assert_eq!(user_id, UserId(2));
    assert!(typing.watchdog_elapsed(user_id, epoch));
    assert_eq!(typing.state_of(UserId(2)), TypingState::Idle);
    assert!(!typing.watchdog_elapsed(user_id, epoch));
}

#[tokio::test(start_paused = true)]
async fn remote_stop_disarms_watchdog() {
    let (mut typing, mut timers) = controller(Some(Duration::from_secs(5)));
    typing.apply_remote(UserId(2), true, true);
    typing.apply_remote(UserId(2), false, true);

    sleep(Duration::from_secs(10)).await;
    assert!(timers.try_recv().is_err());
}
