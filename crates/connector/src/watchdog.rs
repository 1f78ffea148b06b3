//! Cross-feed health watchdog
//!
//! A connection can sit in a non-connected state without its own reconnect
//! logic ever recovering it. Every period the watchdog rebuilds any feed that
//! is not connected, then refreshes the status board.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::feeds::{FeedSet, Recovery};
use crate::status::StatusBoard;

pub struct Watchdog {
    feeds: Arc<FeedSet>,
    board: Arc<StatusBoard>,
    period: Duration,
}

impl Watchdog {
    pub fn new(feeds: Arc<FeedSet>, board: Arc<StatusBoard>, period: Duration) -> Self {
        Self {
            feeds,
            board,
            period,
        }
    }

    pub async fn tick(&self) -> Vec<Recovery> {
        let recoveries = self.feeds.ensure_connected().await;
        let rebuilt = recoveries.iter().filter(|r| r.is_rebuilt()).count();
        if rebuilt > 0 {
            info!(rebuilt, "Watchdog rebuilt feed connections");
        } else {
            debug!("Watchdog: all feeds connected");
        }
        self.board.update(self.feeds.snapshot().await);
        recoveries
    }

    /// Run until shutdown. The first tick fires one period after start.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = self.period.as_secs(), "Health watchdog started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        debug!("Health watchdog stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::FeedSpec;
    use crate::test_helpers::{test_spec, wait_until, MockTransport, RecordingListener};
    use crate::traits::{FeedListener, FeedTransport};

    const P2P: &str = "wss://p2p.test/ws";
    const WOLFX: &str = "wss://wolfx.test/ws";

    fn setup(transport: &Arc<MockTransport>) -> (Arc<FeedSet>, Arc<StatusBoard>) {
        let feeds: Vec<(FeedSpec, Arc<dyn FeedListener>)> = vec![
            (test_spec("P2P", P2P), Arc::new(RecordingListener::default()) as Arc<dyn FeedListener>),
            (test_spec("Wolfx", WOLFX), Arc::new(RecordingListener::default()) as Arc<dyn FeedListener>),
        ];
        let feeds = Arc::new(FeedSet::new(
            Arc::clone(transport) as Arc<dyn FeedTransport>,
            feeds,
        ));
        (feeds, Arc::new(StatusBoard::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_refreshes_board() {
        let transport = Arc::new(MockTransport::new());
        let (feeds, board) = setup(&transport);
        feeds.start_all().await;
        wait_until(|| transport.live_streams(P2P) == 1 && transport.live_streams(WOLFX) == 1)
            .await;

        let watchdog = Watchdog::new(Arc::clone(&feeds), Arc::clone(&board), Duration::from_secs(33));
        let recoveries = watchdog.tick().await;
        assert!(recoveries.iter().all(|r| !r.is_rebuilt()));
        assert!(board.all_connected());
        feeds.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_rebuild_failed_feed() {
        let transport = Arc::new(MockTransport::new());
        transport.refuse(WOLFX);
        let (feeds, board) = setup(&transport);
        feeds.start_all().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Watchdog::new(Arc::clone(&feeds), board, Duration::from_secs(33))
            .spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(feeds.generation("Wolfx").await, Some(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(feeds.generation("Wolfx").await, Some(2));
        assert_eq!(feeds.generation("P2P").await, Some(1));

        tokio::time::sleep(Duration::from_secs(33)).await;
        assert_eq!(feeds.generation("Wolfx").await, Some(3));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        feeds.stop_all().await;
    }
}
