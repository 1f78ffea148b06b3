//! Test helpers for feed supervision testing.
//!
//! Provides an in-memory `MockTransport` implementing `FeedTransport` with
//! per-endpoint accept/refuse behavior, plus recording implementations of the
//! collaborator traits.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cache::Clock;
use crate::connection::FeedSpec;
use crate::error::{ConnectorError, RelaunchError, SinkError};
use crate::traits::{
    ConnectionTimeouts, FeedListener, FeedStream, FeedTransport, Frame, Launcher, LivenessProbe,
    NotificationSink, RelaunchTimer,
};

/// Feed spec with a read timeout long enough that idle pings never fire
pub fn test_spec(feed_id: &str, endpoint: &str) -> FeedSpec {
    FeedSpec::new(feed_id, endpoint).with_timeouts(ConnectionTimeouts {
        connect: Duration::from_secs(10),
        read: Duration::from_secs(3600),
        write: Duration::from_secs(10),
    })
}

const POLL: Duration = Duration::from_millis(10);
const MAX_POLLS: usize = 60_000;

/// Poll `cond` until it holds. Meant for paused-clock tests.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..MAX_POLLS {
        if cond() {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("condition not met");
}

pub async fn wait_until_async<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..MAX_POLLS {
        if cond().await {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("condition not met");
}

#[derive(Default)]
struct EndpointState {
    refuse: bool,
    attempts: Vec<Instant>,
    senders: Vec<mpsc::UnboundedSender<Frame>>,
    live: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

/// In-memory transport. Endpoints accept by default.
#[derive(Default)]
pub struct MockTransport {
    endpoints: Mutex<HashMap<String, EndpointState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_endpoint<R>(&self, endpoint: &str, f: impl FnOnce(&mut EndpointState) -> R) -> R {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        f(endpoints.entry(endpoint.to_string()).or_default())
    }

    /// Fail every subsequent open of `endpoint`
    pub fn refuse(&self, endpoint: &str) {
        self.with_endpoint(endpoint, |e| e.refuse = true);
    }

    pub fn accept(&self, endpoint: &str) {
        self.with_endpoint(endpoint, |e| e.refuse = false);
    }

    /// Deliver a frame to every open stream of `endpoint`
    pub fn push(&self, endpoint: &str, frame: Frame) {
        self.with_endpoint(endpoint, |e| {
            e.senders.retain(|tx| tx.send(frame.clone()).is_ok());
        });
    }

    pub fn push_text(&self, endpoint: &str, text: &str) {
        self.push(endpoint, Frame::Text(text.to_string()));
    }

    /// End every open stream of `endpoint` as if the peer vanished
    pub fn drop_streams(&self, endpoint: &str) {
        self.with_endpoint(endpoint, |e| e.senders.clear());
    }

    pub fn attempts(&self, endpoint: &str) -> usize {
        self.with_endpoint(endpoint, |e| e.attempts.len())
    }

    /// Time between consecutive open attempts
    pub fn attempt_gaps(&self, endpoint: &str) -> Vec<Duration> {
        self.with_endpoint(endpoint, |e| {
            e.attempts.windows(2).map(|w| w[1] - w[0]).collect()
        })
    }

    /// Streams opened and not yet dropped
    pub fn live_streams(&self, endpoint: &str) -> usize {
        self.with_endpoint(endpoint, |e| e.live.load(Ordering::SeqCst))
    }

    pub fn pings(&self, endpoint: &str) -> usize {
        self.with_endpoint(endpoint, |e| e.pings.load(Ordering::SeqCst))
    }

    pub fn graceful_closes(&self, endpoint: &str) -> usize {
        self.with_endpoint(endpoint, |e| e.closes.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl FeedTransport for MockTransport {
    async fn open(
        &self,
        endpoint: &str,
        _timeouts: &ConnectionTimeouts,
    ) -> Result<Box<dyn FeedStream>, ConnectorError> {
        self.with_endpoint(endpoint, |e| {
            e.attempts.push(Instant::now());
            if e.refuse {
                return Err(ConnectorError::ConnectionFailed(
                    "connection refused".to_string(),
                ));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            e.senders.push(tx);
            e.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockStream {
                rx,
                live: Arc::clone(&e.live),
                pings: Arc::clone(&e.pings),
                closes: Arc::clone(&e.closes),
            }) as Box<dyn FeedStream>)
        })
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Frame>,
    live: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl FeedStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, ConnectorError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn send_ping(&mut self) -> Result<(), ConnectorError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_pong(&mut self, _data: Vec<u8>) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.rx.close();
        Ok(())
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<String>>,
    statuses: Mutex<Vec<bool>>,
}

impl RecordingListener {
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn statuses(&self) -> Vec<bool> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FeedListener for RecordingListener {
    fn on_message(&self, payload: &str) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.to_string());
    }

    fn on_status_changed(&self, connected: bool) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connected);
    }
}

/// Records every notification; optionally fails them all
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, feed_type: &str, payload: &str) -> Result<(), SinkError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((feed_type.to_string(), payload.to_string()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::WriteFailed("sink unavailable".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerCall {
    Exact(Duration),
    Inexact(Duration),
    CancelAll,
}

/// Records accepted schedules. Exact requests are denied unless allowed.
pub struct RecordingTimer {
    exact_allowed: bool,
    calls: Mutex<Vec<TimerCall>>,
}

impl RecordingTimer {
    pub fn new(exact_allowed: bool) -> Self {
        Self {
            exact_allowed,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<TimerCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: TimerCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl RelaunchTimer for RecordingTimer {
    fn schedule_exact(&self, delay: Duration) -> Result<(), RelaunchError> {
        if !self.exact_allowed {
            return Err(RelaunchError::ExactDenied);
        }
        self.record(TimerCall::Exact(delay));
        Ok(())
    }

    fn schedule_inexact(&self, delay: Duration) -> Result<(), RelaunchError> {
        self.record(TimerCall::Inexact(delay));
        Ok(())
    }

    fn cancel_all(&self) -> Result<(), RelaunchError> {
        self.record(TimerCall::CancelAll);
        Ok(())
    }
}

/// Settable calendar date
pub struct ManualClock {
    today: Mutex<NaiveDate>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: Mutex::new(today),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        *self.today.lock().unwrap_or_else(PoisonError::into_inner) = today;
    }
}

impl Clock for ManualClock {
    fn today(&self) -> NaiveDate {
        *self.today.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct StaticProbe {
    alive: AtomicBool,
}

impl StaticProbe {
    pub fn new(alive: bool) -> Self {
        Self {
            alive: AtomicBool::new(alive),
        }
    }

    pub fn set(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

impl LivenessProbe for StaticProbe {
    fn is_process_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct CountingLauncher {
    launches: AtomicUsize,
}

impl CountingLauncher {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl Launcher for CountingLauncher {
    fn launch(&self) -> Result<(), RelaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
