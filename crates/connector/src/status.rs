//! Ingestion status board
//!
//! A running summary of how each feed is doing, refreshed on a timer and
//! served by the health endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::feeds::FeedSet;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FeedHealth {
    pub feed: String,
    pub connected: bool,
    pub state: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub uptime: String,
    pub uptime_secs: u64,
    pub messages_received: u64,
    pub feeds: Vec<FeedHealth>,
    pub last_refresh_secs_ago: Option<u64>,
}

#[derive(Default)]
struct Board {
    feeds: Vec<FeedHealth>,
    refreshed_at: Option<Instant>,
}

pub struct StatusBoard {
    started_at: Instant,
    messages: AtomicU64,
    board: Mutex<Board>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            messages: AtomicU64::new(0),
            board: Mutex::new(Board::default()),
        }
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_received(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Live update from a connection callback
    pub fn set_connected(&self, feed: &str, connected: bool) {
        let mut board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        match board.feeds.iter_mut().find(|h| h.feed == feed) {
            Some(health) => {
                health.connected = connected;
                health.state = if connected { "connected" } else { "disconnected" }.to_string();
            }
            None => board.feeds.push(FeedHealth {
                feed: feed.to_string(),
                connected,
                state: if connected { "connected" } else { "disconnected" }.to_string(),
                generation: 1,
            }),
        }
    }

    /// Replace every row with a fresh snapshot
    pub fn update(&self, feeds: Vec<FeedHealth>) {
        let mut board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        board.feeds = feeds;
        board.refreshed_at = Some(Instant::now());
    }

    pub fn all_connected(&self) -> bool {
        let board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        !board.feeds.is_empty() && board.feeds.iter().all(|h| h.connected)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        let uptime = self.started_at.elapsed();
        StatusSnapshot {
            uptime: format_uptime(uptime),
            uptime_secs: uptime.as_secs(),
            messages_received: self.messages_received(),
            feeds: board.feeds.clone(),
            last_refresh_secs_ago: board.refreshed_at.map(|t| t.elapsed().as_secs()),
        }
    }

    /// Refresh from the feed set every `period` until shutdown
    pub fn spawn_refresher(
        self: &Arc<Self>,
        feeds: Arc<FeedSet>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let board = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs(), "Status refresher started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        debug!("Status refresher stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        board.update(feeds.snapshot().await);
                    }
                }
            }
        })
    }
}

/// Human uptime: "2d 3h", "4h 12m" or "7m"
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}
