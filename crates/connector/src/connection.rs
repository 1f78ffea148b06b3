//! Feed connection lifecycle
//!
//! One `FeedConnection` owns at most one open socket for one feed. A driver
//! task opens the socket, pumps frames to the listener, and on failure waits
//! out the backoff delay before trying again. `stop()` cancels all of it.
//!
//! ```text
//! Disconnected --start--> Connecting --open ok--> Connected
//!      ^                      |                      |
//!      |                 open failed          closed / error / timeout
//!      +---- backoff delay ---+----------------------+
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backoff::Backoff;
use crate::error::ConnectorError;
use crate::metrics;
use crate::traits::{ConnectionTimeouts, FeedListener, FeedStream, FeedTransport, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        }
    }
}

/// Identity and endpoint of one feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSpec {
    pub feed_id: String,
    pub endpoint: String,
    pub timeouts: ConnectionTimeouts,
}

impl FeedSpec {
    pub fn new(feed_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            feed_id: feed_id.into(),
            endpoint: endpoint.into(),
            timeouts: ConnectionTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: ConnectionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl From<&quakefeed_metadata::Feed> for FeedSpec {
    fn from(feed: &quakefeed_metadata::Feed) -> Self {
        Self {
            feed_id: feed.name.clone(),
            endpoint: feed.endpoint.clone(),
            timeouts: ConnectionTimeouts::from(&feed.timeouts),
        }
    }
}

/// State shared between the handle and its driver task
struct Shared {
    spec: FeedSpec,
    listener: Arc<dyn FeedListener>,
    state: Mutex<ConnectionState>,
    should_reconnect: AtomicBool,
    backoff: Mutex<Backoff>,
    attempts: AtomicU64,
}

impl Shared {
    fn feed(&self) -> &str {
        &self.spec.feed_id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_reconnect(&self) -> bool {
        self.should_reconnect.load(Ordering::SeqCst)
    }

    /// Replace the state without notifying the listener
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *state, next)
    }

    /// Replace the state and notify when connectedness changed
    fn transition(&self, next: ConnectionState) {
        let prev = self.set_state(next);
        let was_connected = prev == ConnectionState::Connected;
        let now_connected = next == ConnectionState::Connected;
        if was_connected != now_connected {
            metrics::set_feed_connected(self.feed(), now_connected);
            self.listener.on_status_changed(now_connected);
        }
    }

    fn backoff_delay(&self) -> Duration {
        self.backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current()
    }

    fn reset_backoff(&self) {
        self.backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    /// A scheduled reconnect delay elapsed. Re-checks intent before acting,
    /// since a stop may have landed while the timer was pending.
    fn reconnect_timer_fired(&self) -> bool {
        if !self.should_reconnect() {
            debug!(feed = %self.feed(), "Reconnect cancelled: connection stopped during delay");
            return false;
        }
        let next = self
            .backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .advance();
        trace!(feed = %self.feed(), next_delay_ms = next.as_millis() as u64, "Backoff advanced");
        true
    }
}

struct Driver {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One logical subscription to one streaming endpoint
pub struct FeedConnection {
    shared: Arc<Shared>,
    transport: Arc<dyn FeedTransport>,
    driver: Option<Driver>,
}

impl FeedConnection {
    pub fn new(
        spec: FeedSpec,
        transport: Arc<dyn FeedTransport>,
        listener: Arc<dyn FeedListener>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                spec,
                listener,
                state: Mutex::new(ConnectionState::Disconnected),
                should_reconnect: AtomicBool::new(false),
                backoff: Mutex::new(Backoff::new()),
                attempts: AtomicU64::new(0),
            }),
            transport,
            driver: None,
        }
    }

    pub fn feed_id(&self) -> &str {
        self.shared.feed()
    }

    pub fn spec(&self) -> &FeedSpec {
        &self.shared.spec
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// True only while the last lifecycle event left the socket Connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Delay the next reconnect would wait
    pub fn backoff_delay(&self) -> Duration {
        self.shared.backoff_delay()
    }

    /// Number of open attempts made since construction
    pub fn attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Start connecting. Does nothing while a driver is already running.
    pub fn start(&mut self) {
        if self
            .driver
            .as_ref()
            .is_some_and(|d| !d.handle.is_finished())
        {
            debug!(feed = %self.feed_id(), state = self.state().as_str(), "start() ignored: already running");
            return;
        }

        info!(feed = %self.feed_id(), endpoint = %self.shared.spec.endpoint, "Starting feed connection");
        self.shared.should_reconnect.store(true, Ordering::SeqCst);
        self.shared.reset_backoff();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(drive(
            Arc::clone(&self.shared),
            Arc::clone(&self.transport),
            stop_rx,
        ));
        self.driver = Some(Driver { stop_tx, handle });
    }

    /// Stop for good: no reconnect is scheduled after this returns, an open
    /// socket is closed with a normal status code, and the listener sees
    /// exactly one final disconnect notification.
    pub async fn stop(&mut self) {
        info!(feed = %self.feed_id(), "Stopping feed connection");
        self.shared.should_reconnect.store(false, Ordering::SeqCst);

        if let Some(driver) = self.driver.take() {
            let _ = driver.stop_tx.send(true);
            if let Err(e) = driver.handle.await {
                warn!(feed = %self.feed_id(), error = %e, "Feed driver task ended abnormally");
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
        metrics::set_feed_connected(self.feed_id(), false);
        self.shared.listener.on_status_changed(false);
    }

    /// Entry point of a fired reconnect timer; returns whether an attempt may
    /// proceed. Not a query: when it returns true the backoff has advanced to
    /// the next delay, exactly as the driver does after each sleep.
    pub fn on_reconnect_timer(&self) -> bool {
        self.shared.reconnect_timer_fired()
    }
}

impl Drop for FeedConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            self.shared.should_reconnect.store(false, Ordering::SeqCst);
            let _ = driver.stop_tx.send(true);
        }
    }
}

/// Resolves once a stop was requested or the handle went away
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

enum PumpExit {
    Stopped,
    Lost(ConnectorError),
}

async fn drive(
    shared: Arc<Shared>,
    transport: Arc<dyn FeedTransport>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if !shared.should_reconnect() {
            break;
        }

        shared.set_state(ConnectionState::Connecting);
        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(feed = %shared.feed(), attempt, "Connecting to feed");

        let opened = tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => break,
            result = transport.open(&shared.spec.endpoint, &shared.spec.timeouts) => result,
        };

        match opened {
            Ok(mut stream) => {
                shared.reset_backoff();
                shared.transition(ConnectionState::Connected);
                info!(feed = %shared.feed(), attempt, "Feed connected");

                match pump(&shared, stream.as_mut(), &mut stop_rx).await {
                    PumpExit::Stopped => {
                        shared.set_state(ConnectionState::Closing);
                        if let Err(e) = stream.close().await {
                            debug!(feed = %shared.feed(), error = %e, "Error closing feed socket");
                        }
                        break;
                    }
                    PumpExit::Lost(e) => {
                        drop(stream);
                        warn!(feed = %shared.feed(), error = %e, "Feed connection lost");
                        shared.transition(ConnectionState::Disconnected);
                    }
                }
            }
            Err(e) => {
                warn!(feed = %shared.feed(), attempt, error = %e, "Feed connection attempt failed");
                shared.transition(ConnectionState::Disconnected);
            }
        }

        if !shared.should_reconnect() {
            debug!(feed = %shared.feed(), "Reconnect not scheduled: connection stopped");
            break;
        }

        let delay = shared.backoff_delay();
        info!(feed = %shared.feed(), delay_ms = delay.as_millis() as u64, "Scheduling feed reconnect");
        metrics::inc_reconnects(shared.feed());

        tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if !shared.reconnect_timer_fired() {
            break;
        }
    }
    trace!(feed = %shared.feed(), "Feed driver exited");
}

/// Deliver frames until the socket fails or a stop is requested
async fn pump(
    shared: &Shared,
    stream: &mut dyn FeedStream,
    stop_rx: &mut watch::Receiver<bool>,
) -> PumpExit {
    let read_timeout = shared.spec.timeouts.read;
    let mut awaiting_pong = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = stop_requested(stop_rx) => return PumpExit::Stopped,
            next = tokio::time::timeout(read_timeout, stream.next_frame()) => next,
        };

        let frame = match next {
            Err(_) if !awaiting_pong => {
                trace!(feed = %shared.feed(), "Feed idle, sending keepalive ping");
                if let Err(e) = stream.send_ping().await {
                    return PumpExit::Lost(e);
                }
                awaiting_pong = true;
                continue;
            }
            Err(_) => {
                return PumpExit::Lost(ConnectorError::Timeout("read", read_timeout.as_secs()));
            }
            Ok(None) => {
                return PumpExit::Lost(ConnectorError::Disconnected("stream ended".to_string()))
            }
            Ok(Some(Err(e))) => return PumpExit::Lost(e),
            Ok(Some(Ok(frame))) => frame,
        };
        awaiting_pong = false;

        match frame {
            Frame::Text(text) => {
                trace!(feed = %shared.feed(), len = text.len(), "Feed message received");
                shared.listener.on_message(&text);
            }
            Frame::Binary(data) => {
                debug!(feed = %shared.feed(), len = data.len(), "Discarding binary frame");
            }
            Frame::Ping(data) => {
                if let Err(e) = stream.send_pong(data).await {
                    return PumpExit::Lost(e);
                }
            }
            Frame::Pong => trace!(feed = %shared.feed(), "Pong received"),
            Frame::Close(reason) => {
                return PumpExit::Lost(ConnectorError::Disconnected(format!(
                    "closed by peer: {}",
                    reason.unwrap_or_else(|| "no reason".to_string())
                )));
            }
        }
    }
}
