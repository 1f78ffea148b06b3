//! Ingestion supervisor
//!
//! Owns both feed connections, the message cache and the background tasks
//! (watchdog, status refresh, network listener). Host lifecycle events map
//! onto `activate`, `on_teardown_signal`, `stop_intentionally` and
//! `deactivate`.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use quakefeed_metadata::{Environment, FeedList};

use crate::cache::MessageCache;
use crate::connection::FeedSpec;
use crate::error::RelaunchError;
use crate::feeds::{FeedSet, Recovery};
use crate::metrics;
use crate::state::StateStore;
use crate::status::{StatusBoard, StatusSnapshot};
use crate::traits::{FeedListener, FeedTransport, NotificationSink, RelaunchTimer, ReplayQuery};
use crate::watchdog::Watchdog;

/// Host network reachability change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Available,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Exact,
    Inexact,
}

impl ScheduleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleMode::Exact => "exact",
            ScheduleMode::Inexact => "inexact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Stopped on purpose, nothing scheduled
    Suppressed,
    Scheduled(ScheduleMode),
    /// Neither exact nor inexact scheduling succeeded
    Failed,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub feeds: Vec<FeedSpec>,
    pub watchdog_interval: Duration,
    pub status_refresh: Duration,
    pub relaunch_delay: Duration,
}

impl SupervisorConfig {
    /// Active feeds from the list, periods from the environment
    pub fn from_environment(feeds: &FeedList, env: &Environment) -> Self {
        Self {
            feeds: feeds.active().map(FeedSpec::from).collect(),
            watchdog_interval: env.watchdog_interval(),
            status_refresh: env.status_refresh(),
            relaunch_delay: env.relaunch.delay(),
        }
    }
}

/// Per-feed listener: status board, then cache, then the notification sink
struct FeedRouter {
    feed_id: String,
    cache: Arc<MessageCache>,
    sink: Arc<dyn NotificationSink>,
    board: Arc<StatusBoard>,
}

impl FeedListener for FeedRouter {
    fn on_message(&self, payload: &str) {
        self.board.record_message();
        metrics::inc_messages(&self.feed_id);

        if let Err(e) = self.cache.add(&self.feed_id, payload) {
            warn!(feed = %self.feed_id, error = %e, "Message not cached");
        }

        match catch_unwind(AssertUnwindSafe(|| self.sink.notify(&self.feed_id, payload))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(feed = %self.feed_id, error = %e, "Notification sink failed"),
            Err(_) => error!(feed = %self.feed_id, "Notification sink panicked"),
        }
    }

    fn on_status_changed(&self, connected: bool) {
        info!(feed = %self.feed_id, connected, "Feed status changed");
        self.board.set_connected(&self.feed_id, connected);
    }
}

struct Running {
    feeds: Arc<FeedSet>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    transport: Arc<dyn FeedTransport>,
    cache: Arc<MessageCache>,
    sink: Arc<dyn NotificationSink>,
    state: Arc<dyn StateStore>,
    relaunch: Arc<dyn RelaunchTimer>,
    board: Arc<StatusBoard>,
    intentional_stop: AtomicBool,
    runtime: Mutex<Option<Running>>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        transport: Arc<dyn FeedTransport>,
        cache: Arc<MessageCache>,
        sink: Arc<dyn NotificationSink>,
        state: Arc<dyn StateStore>,
        relaunch: Arc<dyn RelaunchTimer>,
    ) -> Self {
        Self {
            config,
            transport,
            cache,
            sink,
            state,
            relaunch,
            board: Arc::new(StatusBoard::new()),
            intentional_stop: AtomicBool::new(false),
            runtime: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    pub fn status(&self) -> StatusSnapshot {
        self.board.snapshot()
    }

    pub async fn is_active(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// Start ingestion: both feeds, the watchdog, the status refresher and,
    /// when given, the network listener. Does nothing if already active.
    pub async fn activate(&self, network: Option<mpsc::Receiver<NetworkEvent>>) {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            debug!("activate() ignored: supervisor already active");
            return;
        }

        self.intentional_stop.store(false, Ordering::SeqCst);
        if let Err(e) = self.state.update(&mut |s| {
            s.intentional_stop = false;
            s.is_running = true;
        }) {
            warn!(error = %e, "Failed to persist running state");
        }

        let listeners: Vec<(FeedSpec, Arc<dyn FeedListener>)> = self
            .config
            .feeds
            .iter()
            .map(|spec| {
                let router = FeedRouter {
                    feed_id: spec.feed_id.clone(),
                    cache: Arc::clone(&self.cache),
                    sink: Arc::clone(&self.sink),
                    board: Arc::clone(&self.board),
                };
                (spec.clone(), Arc::new(router) as Arc<dyn FeedListener>)
            })
            .collect();

        let feeds = Arc::new(FeedSet::new(Arc::clone(&self.transport), listeners));
        feeds.start_all().await;
        self.board.update(feeds.snapshot().await);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            Watchdog::new(
                Arc::clone(&feeds),
                Arc::clone(&self.board),
                self.config.watchdog_interval,
            )
            .spawn(shutdown_rx.clone()),
            self.board.spawn_refresher(
                Arc::clone(&feeds),
                self.config.status_refresh,
                shutdown_rx.clone(),
            ),
        ];
        if let Some(events) = network {
            tasks.push(spawn_network_listener(
                Arc::clone(&feeds),
                Arc::clone(&self.board),
                events,
                shutdown_rx,
            ));
        }

        info!(
            feeds = ?feeds.feed_ids(),
            watchdog_secs = self.config.watchdog_interval.as_secs(),
            "Supervisor activated"
        );
        *runtime = Some(Running {
            feeds,
            shutdown_tx,
            tasks,
        });
    }

    /// Same recovery as a watchdog tick, run as soon as the network returns
    pub async fn on_network_available(&self) -> Vec<Recovery> {
        let runtime = self.runtime.lock().await;
        match runtime.as_ref() {
            Some(running) => {
                let recoveries = running.feeds.ensure_connected().await;
                self.board.update(running.feeds.snapshot().await);
                recoveries
            }
            None => Vec::new(),
        }
    }

    fn is_intentionally_stopped(&self) -> bool {
        if self.intentional_stop.load(Ordering::SeqCst) {
            return true;
        }
        match self.state.load() {
            Ok(state) => state.intentional_stop,
            Err(e) => {
                warn!(error = %e, "Failed to read supervisor state");
                false
            }
        }
    }

    /// The host is tearing ingestion down. Unless it was stopped on purpose,
    /// schedule a one-shot relaunch, preferring exact timing.
    pub fn on_teardown_signal(&self) -> TeardownOutcome {
        if self.is_intentionally_stopped() {
            info!("Teardown after intentional stop, no relaunch scheduled");
            return TeardownOutcome::Suppressed;
        }

        let delay = self.config.relaunch_delay;
        let mode = match self.relaunch.schedule_exact(delay) {
            Ok(()) => ScheduleMode::Exact,
            Err(e) => {
                match e {
                    RelaunchError::ExactDenied => {
                        info!("Exact relaunch denied, falling back to inexact")
                    }
                    ref other => warn!(error = %other, "Exact relaunch failed, falling back to inexact"),
                }
                if let Err(e) = self.relaunch.schedule_inexact(delay) {
                    error!(error = %e, "Failed to schedule relaunch");
                    return TeardownOutcome::Failed;
                }
                ScheduleMode::Inexact
            }
        };

        metrics::inc_relaunch_scheduled(mode.as_str());
        info!(mode = mode.as_str(), delay_ms = delay.as_millis() as u64, "Relaunch scheduled");
        TeardownOutcome::Scheduled(mode)
    }

    /// Explicit stop request. The intent is recorded before anything is torn
    /// down so no restart path can race it.
    pub async fn stop_intentionally(&self) {
        info!("Intentional stop requested");
        self.intentional_stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.state.update(&mut |s| s.intentional_stop = true) {
            error!(error = %e, "Failed to persist intentional stop");
        }

        self.shutdown_runtime().await;

        if let Err(e) = self.relaunch.cancel_all() {
            warn!(error = %e, "Failed to cancel scheduled relaunches");
        }
        self.mark_stopped();
    }

    /// Stop feeds and timers without recording an intentional stop
    pub async fn deactivate(&self) {
        self.shutdown_runtime().await;
        self.mark_stopped();
    }

    fn mark_stopped(&self) {
        if let Err(e) = self.state.update(&mut |s| s.is_running = false) {
            warn!(error = %e, "Failed to persist stopped state");
        }
    }

    async fn shutdown_runtime(&self) {
        let Some(running) = self.runtime.lock().await.take() else {
            debug!("Supervisor not active");
            return;
        };

        running.feeds.stop_all().await;
        let _ = running.shutdown_tx.send(true);
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
        }
        info!("Supervisor deactivated");
    }

    /// Every buffered message, removed from the cache
    pub fn drain_all(&self) -> BTreeMap<String, Vec<String>> {
        self.cache.drain_all()
    }
}

impl ReplayQuery for Supervisor {
    fn pop_messages(&self, feed_type: &str) -> Vec<String> {
        self.cache.pop_messages(feed_type)
    }

    fn all_messages(&self) -> Vec<String> {
        self.cache.all_messages()
    }
}

fn spawn_network_listener(
    feeds: Arc<FeedSet>,
    board: Arc<StatusBoard>,
    mut events: mpsc::Receiver<NetworkEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(NetworkEvent::Available) => {
                        info!("Network available, checking feeds");
                        let rebuilt = feeds
                            .ensure_connected()
                            .await
                            .iter()
                            .filter(|r| r.is_rebuilt())
                            .count();
                        debug!(rebuilt, "Network recovery done");
                        board.update(feeds.snapshot().await);
                    }
                    Some(NetworkEvent::Lost) => info!("Network lost"),
                    None => {
                        debug!("Network event source closed");
                        break;
                    }
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStateStore, SupervisorState};
    use crate::test_helpers::{
        test_spec, wait_until, MockTransport, RecordingSink, RecordingTimer, TimerCall,
    };

    const P2P: &str = "wss://p2p.test/ws";
    const WOLFX: &str = "wss://wolfx.test/ws";

    struct Harness {
        transport: Arc<MockTransport>,
        sink: Arc<RecordingSink>,
        state: Arc<MemoryStateStore>,
        timer: Arc<RecordingTimer>,
        supervisor: Supervisor,
    }

    fn harness(exact_allowed: bool) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let sink = Arc::new(RecordingSink::default());
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
            Arc::new(MessageCache::new()),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
            Arc::clone(&state) as Arc<dyn StateStore>,
            Arc::clone(&timer) as Arc<dyn RelaunchTimer>,
        );
        Harness {
            transport,
            sink,
            state,
            timer,
            supervisor,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_reach_cache_then_sink() {
        let h = harness(true);
        h.supervisor.activate(None).await;
        wait_until(|| h.supervisor.board().all_connected()).await;

        h.transport.push_text(P2P, r#"{"code":551}"#);
        h.transport.push_text(WOLFX, r#"{"type":"jma_eew"}"#);
        wait_until(|| h.sink.calls().len() == 2).await;

        assert_eq!(h.supervisor.cache().get_messages("P2P"), vec![r#"{"code":551}"#]);
        assert_eq!(h.supervisor.cache().size("Wolfx"), 1);
        assert!(h.sink.calls().contains(&("P2P".to_string(), r#"{"code":551}"#.to_string())));
        assert_eq!(h.supervisor.status().messages_received, 2);

        h.supervisor.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_does_not_stop_ingestion() {
        let h = harness(true);
        h.sink.fail(true);
        h.supervisor.activate(None).await;
        wait_until(|| h.supervisor.board().all_connected()).await;

        h.transport.push_text(P2P, "m1");
        h.transport.push_text(P2P, "m2");
        wait_until(|| h.supervisor.cache().size("P2P") == 2).await;

        assert_eq!(h.supervisor.pop_messages("P2P"), vec!["m1", "m2"]);
        assert_eq!(h.transport.attempts(P2P), 1);
        h.supervisor.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_clears_intentional_stop() {
        let h = harness(true);
        h.state
            .save(&SupervisorState {
                intentional_stop: true,
                ..SupervisorState::default()
            })
            .unwrap();

        h.supervisor.activate(None).await;
        let state = h.state.load().unwrap();
        assert!(!state.intentional_stop);
        assert!(state.is_running);
        assert!(h.supervisor.is_active().await);

        // second activate is a no-op
        h.supervisor.activate(None).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.transport.attempts(P2P), 1);
        h.supervisor.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_prefers_exact() {
        let h = harness(true);
        h.supervisor.activate(None).await;

        assert_eq!(
            h.supervisor.on_teardown_signal(),
            TeardownOutcome::Scheduled(ScheduleMode::Exact)
        );
        assert_eq!(h.timer.calls(), vec![TimerCall::Exact(Duration::from_secs(3))]);
        h.supervisor.deactivate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_intentionally_ordering() {
        let h = harness(true);
        h.supervisor.activate(None).await;
        wait_until(|| h.supervisor.board().all_connected()).await;

        h.supervisor.stop_intentionally().await;

        let state = h.state.load().unwrap();
        assert!(state.intentional_stop);
        assert!(!state.is_running);
        assert_eq!(h.timer.calls(), vec![TimerCall::CancelAll]);
        assert_eq!(h.transport.live_streams(P2P), 0);
        assert_eq!(h.transport.live_streams(WOLFX), 0);
        assert_eq!(h.transport.graceful_closes(P2P), 1);
        assert!(!h.supervisor.is_active().await);

        assert_eq!(h.supervisor.on_teardown_signal(), TeardownOutcome::Suppressed);
        assert_eq!(h.timer.calls(), vec![TimerCall::CancelAll]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_keeps_intent() {
        let h = harness(true);
        h.supervisor.activate(None).await;
        h.supervisor.deactivate().await;

        let state = h.state.load().unwrap();
        assert!(!state.intentional_stop);
        assert!(!state.is_running);
        assert!(h.timer.calls().is_empty());

        let attempts = h.transport.attempts(P2P);
        assert!(attempts <= 1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.attempts(P2P), attempts);
    }
}
