//! End-to-end supervision scenarios over the in-memory transport

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::mpsc;

use quakefeed_connector_lib::test_helpers::*;
use quakefeed_connector_lib::{
    Clock, FeedConnection, FeedListener, FeedTransport, MessageCache, MemoryStateStore,
    NetworkEvent, NotificationSink, RelaunchTimer, ReplayQuery, ScheduleMode, StateStore,
    Supervisor, SupervisorConfig, SupervisorState, TeardownOutcome,
};

const P2P: &str = "wss://p2p.test/ws";
const WOLFX: &str = "wss://wolfx.test/ws";

struct Harness {
    transport: Arc<MockTransport>,
    state: Arc<MemoryStateStore>,
    timer: Arc<RecordingTimer>,
    supervisor: Supervisor,
}

fn harness_with(cache: MessageCache, exact_allowed: bool) -> Harness {
    let transport = Arc::new(MockTransport::new());
    let state = Arc::new(MemoryStateStore::default());
    let timer = Arc::new(RecordingTimer::new(exact_allowed));
    let config = SupervisorConfig {
        feeds: vec![test_spec("P2P", P2P), test_spec("Wolfx", WOLFX)],
        watchdog_interval: Duration::from_secs(33),
        status_refresh: Duration::from_secs(10),
        relaunch_delay: Duration::from_secs(3),
    };
    let supervisor = Supervisor::new(
        config,
        Arc::clone(&transport) as Arc<dyn FeedTransport>,
        Arc::new(cache),
        Arc::new(RecordingSink::default()) as Arc<dyn NotificationSink>,
        Arc::clone(&state) as Arc<dyn StateStore>,
        Arc::clone(&timer) as Arc<dyn RelaunchTimer>,
    );
    Harness {
        transport,
        state,
        timer,
        supervisor,
    }
}

fn harness() -> Harness {
    harness_with(MessageCache::new(), true)
}

#[tokio::test(start_paused = true)]
async fn reconnect_delays_double_then_cap() {
    let transport = Arc::new(MockTransport::new());
    transport.refuse(P2P);
    let listener = Arc::new(RecordingListener::default());
    let mut conn = FeedConnection::new(
        test_spec("P2P", P2P),
        Arc::clone(&transport) as Arc<dyn FeedTransport>,
        Arc::clone(&listener) as Arc<dyn FeedListener>,
    );

    conn.start();
    wait_until(|| transport.attempts(P2P) >= 8).await;
    conn.stop().await;

    let gaps: Vec<u64> = transport
        .attempt_gaps(P2P)
        .iter()
        .take(7)
        .map(|d| d.as_millis() as u64)
        .collect();
    assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 16000, 16000, 16000]);
}

#[tokio::test(start_paused = true)]
async fn stop_then_timer_fire_makes_no_attempt() {
    let transport = Arc::new(MockTransport::new());
    transport.refuse(P2P);
    let mut conn = FeedConnection::new(
        test_spec("P2P", P2P),
        Arc::clone(&transport) as Arc<dyn FeedTransport>,
        Arc::new(RecordingListener::default()) as Arc<dyn FeedListener>,
    );

    conn.start();
    wait_until(|| transport.attempts(P2P) == 2).await;
    conn.stop().await;

    assert!(!conn.on_reconnect_timer());
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.attempts(P2P), 2);
}

#[tokio::test(start_paused = true)]
async fn watchdog_rebuilds_only_the_failed_feed() {
    let h = harness();
    h.transport.refuse(WOLFX);
    h.supervisor.activate(None).await;
    wait_until(|| h.transport.live_streams(P2P) == 1).await;

    // P2P receives traffic the whole time
    h.transport.push_text(P2P, "before");
    tokio::time::sleep(Duration::from_secs(34)).await;
    h.transport.push_text(P2P, "after");
    wait_until(|| h.supervisor.cache().size("P2P") == 2).await;

    let feeds = h.supervisor.status().feeds;
    let p2p = feeds.iter().find(|f| f.feed == "P2P").unwrap();
    let wolfx = feeds.iter().find(|f| f.feed == "Wolfx").unwrap();
    assert_eq!(p2p.generation, 1);
    assert!(p2p.connected);
    assert_eq!(wolfx.generation, 2);
    assert_eq!(h.transport.attempts(P2P), 1);

    h.supervisor.deactivate().await;
}

#[tokio::test(start_paused = true)]
async fn replay_pop_returns_messages_once() {
    let h = harness();
    h.supervisor.activate(None).await;
    wait_until(|| h.supervisor.board().all_connected()).await;

    h.transport.push_text(P2P, "m1");
    h.transport.push_text(P2P, "m2");
    wait_until(|| h.supervisor.cache().size("P2P") == 2).await;

    assert_eq!(h.supervisor.pop_messages("P2P"), vec!["m1", "m2"]);
    assert!(h.supervisor.pop_messages("P2P").is_empty());
    h.supervisor.deactivate().await;
}

#[tokio::test(start_paused = true)]
async fn yesterdays_messages_are_not_replayed() {
    let clock = Arc::new(ManualClock::new(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
    let h = harness_with(
        MessageCache::with_clock(Arc::clone(&clock) as Arc<dyn Clock>),
        true,
    );
    h.supervisor.activate(None).await;
    wait_until(|| h.supervisor.board().all_connected()).await;

    h.transport.push_text(WOLFX, "old");
    wait_until(|| h.supervisor.cache().size("Wolfx") == 1).await;

    clock.set(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
    h.transport.push_text(WOLFX, "new");
    wait_until(|| h.supervisor.status().messages_received == 2).await;

    assert_eq!(h.supervisor.all_messages(), vec!["new"]);
    h.supervisor.deactivate().await;
}

#[tokio::test(start_paused = true)]
async fn teardown_schedules_relaunch_unless_stopped_intentionally() {
    let h = harness();
    h.supervisor.activate(None).await;
    assert_eq!(
        h.supervisor.on_teardown_signal(),
        TeardownOutcome::Scheduled(ScheduleMode::Exact)
    );
    h.supervisor.deactivate().await;

    let h = harness();
    h.supervisor.activate(None).await;
    h.supervisor.stop_intentionally().await;
    assert_eq!(h.supervisor.on_teardown_signal(), TeardownOutcome::Suppressed);
    assert!(!h
        .timer
        .calls()
        .iter()
        .any(|c| matches!(c, TimerCall::Exact(_) | TimerCall::Inexact(_))));
}

#[tokio::test(start_paused = true)]
async fn persisted_intentional_stop_suppresses_relaunch() {
    let h = harness();
    h.state
        .save(&SupervisorState {
            intentional_stop: true,
            ..SupervisorState::default()
        })
        .unwrap();

    assert_eq!(h.supervisor.on_teardown_signal(), TeardownOutcome::Suppressed);
    assert!(h.timer.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn denied_exact_schedule_degrades_to_inexact() {
    let h = harness_with(MessageCache::new(), false);
    h.supervisor.activate(None).await;

    assert_eq!(
        h.supervisor.on_teardown_signal(),
        TeardownOutcome::Scheduled(ScheduleMode::Inexact)
    );
    assert_eq!(h.timer.calls(), vec![TimerCall::Inexact(Duration::from_secs(3))]);
    h.supervisor.deactivate().await;
}

#[tokio::test(start_paused = true)]
async fn network_available_recovers_without_waiting_for_watchdog() {
    let h = harness();
    h.transport.refuse(P2P);
    let (events_tx, events_rx) = mpsc::channel(4);
    h.supervisor.activate(Some(events_rx)).await;
    wait_until(|| h.transport.attempts(P2P) >= 1).await;

    h.transport.accept(P2P);
    events_tx.send(NetworkEvent::Available).await.unwrap();
    // Well before the first watchdog tick and the next backoff retry
    wait_until(|| h.supervisor.board().all_connected()).await;

    let p2p = h
        .supervisor
        .status()
        .feeds
        .into_iter()
        .find(|f| f.feed == "P2P")
        .unwrap();
    assert_eq!(p2p.generation, 2);
    h.supervisor.deactivate().await;
}

#[tokio::test(start_paused = true)]
async fn rebuilds_never_leak_sockets() {
    let h = harness();
    h.supervisor.activate(None).await;
    wait_until(|| h.supervisor.board().all_connected()).await;

    for _ in 0..5 {
        h.transport.drop_streams(WOLFX);
        // Let the watchdog race the connection's own reconnect
        tokio::time::sleep(Duration::from_secs(33)).await;
        assert!(h.transport.live_streams(WOLFX) <= 1);
    }
    wait_until(|| h.transport.live_streams(WOLFX) == 1).await;

    h.supervisor.deactivate().await;
    assert_eq!(h.transport.live_streams(P2P), 0);
    assert_eq!(h.transport.live_streams(WOLFX), 0);
}
