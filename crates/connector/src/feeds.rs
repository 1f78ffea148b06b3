//! The set of supervised feed connections
//!
//! Each feed lives in its own slot. A slot holds the current connection and a
//! generation number that increases every time the connection is rebuilt.
//! Slots are locked independently so recovering one feed never blocks the other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::connection::{FeedConnection, FeedSpec};
use crate::metrics;
use crate::status::FeedHealth;
use crate::traits::{FeedListener, FeedTransport};

/// Outcome of checking one feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    Healthy {
        feed_id: String,
        generation: u64,
    },
    Rebuilt {
        feed_id: String,
        previous: u64,
        current: u64,
    },
}

impl Recovery {
    pub fn feed_id(&self) -> &str {
        match self {
            Recovery::Healthy { feed_id, .. } | Recovery::Rebuilt { feed_id, .. } => feed_id,
        }
    }

    pub fn is_rebuilt(&self) -> bool {
        matches!(self, Recovery::Rebuilt { .. })
    }
}

struct LiveConnection {
    generation: u64,
    connection: FeedConnection,
}

struct FeedSlot {
    spec: FeedSpec,
    listener: Arc<dyn FeedListener>,
    live: Mutex<LiveConnection>,
}

pub struct FeedSet {
    transport: Arc<dyn FeedTransport>,
    slots: Vec<FeedSlot>,
    active: AtomicBool,
}

impl FeedSet {
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        feeds: Vec<(FeedSpec, Arc<dyn FeedListener>)>,
    ) -> Self {
        let slots = feeds
            .into_iter()
            .map(|(spec, listener)| {
                let connection = FeedConnection::new(
                    spec.clone(),
                    Arc::clone(&transport),
                    Arc::clone(&listener),
                );
                FeedSlot {
                    spec,
                    listener,
                    live: Mutex::new(LiveConnection {
                        generation: 1,
                        connection,
                    }),
                }
            })
            .collect();

        Self {
            transport,
            slots,
            active: AtomicBool::new(false),
        }
    }

    pub fn feed_ids(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.spec.feed_id.clone()).collect()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn start_all(&self) {
        self.active.store(true, Ordering::SeqCst);
        for slot in &self.slots {
            slot.live.lock().await.connection.start();
        }
    }

    /// Rebuild every feed that is not connected
    pub async fn ensure_connected(&self) -> Vec<Recovery> {
        let mut recoveries = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            if let Some(recovery) = self.ensure_slot(slot).await {
                recoveries.push(recovery);
            }
        }
        recoveries
    }

    pub async fn ensure_feed_connected(&self, feed_id: &str) -> Option<Recovery> {
        let slot = self.slots.iter().find(|s| s.spec.feed_id == feed_id)?;
        self.ensure_slot(slot).await
    }

    async fn ensure_slot(&self, slot: &FeedSlot) -> Option<Recovery> {
        let mut live = slot.live.lock().await;
        // Checked under the slot lock so a concurrent stop_all wins
        if !self.is_active() {
            return None;
        }

        let feed_id = slot.spec.feed_id.clone();
        if live.connection.is_connected() {
            return Some(Recovery::Healthy {
                feed_id,
                generation: live.generation,
            });
        }

        let previous = live.generation;
        warn!(
            feed = %feed_id,
            state = live.connection.state().as_str(),
            generation = previous,
            "Feed not connected, rebuilding connection"
        );

        live.connection.stop().await;
        let mut connection = FeedConnection::new(
            slot.spec.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&slot.listener),
        );
        connection.start();
        live.connection = connection;
        live.generation += 1;
        metrics::inc_watchdog_rebuilds(&feed_id);

        info!(feed = %feed_id, generation = live.generation, "Feed connection rebuilt");
        Some(Recovery::Rebuilt {
            feed_id,
            previous,
            current: live.generation,
        })
    }

    pub async fn stop_all(&self) {
        self.active.store(false, Ordering::SeqCst);
        for slot in &self.slots {
            slot.live.lock().await.connection.stop().await;
        }
    }

    pub async fn snapshot(&self) -> Vec<FeedHealth> {
        let mut health = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let live = slot.live.lock().await;
            health.push(FeedHealth {
                feed: slot.spec.feed_id.clone(),
                connected: live.connection.is_connected(),
                state: live.connection.state().as_str().to_string(),
                generation: live.generation,
            });
        }
        health
    }

    pub async fn generation(&self, feed_id: &str) -> Option<u64> {
        let slot = self.slots.iter().find(|s| s.spec.feed_id == feed_id)?;
        let generation = slot.live.lock().await.generation;
        Some(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{test_spec, wait_until_async, MockTransport, RecordingListener};

    const P2P: &str = "wss://p2p.test/ws";
    const WOLFX: &str = "wss://wolfx.test/ws";

    fn feed_set(transport: &Arc<MockTransport>) -> FeedSet {
        let feeds: Vec<(FeedSpec, Arc<dyn FeedListener>)> = vec![
            (
                test_spec("P2P", P2P),
                Arc::new(RecordingListener::default()) as Arc<dyn FeedListener>,
            ),
            (
                test_spec("Wolfx", WOLFX),
                Arc::new(RecordingListener::default()) as Arc<dyn FeedListener>,
            ),
        ];
        FeedSet::new(Arc::clone(transport) as Arc<dyn FeedTransport>, feeds)
    }

    async fn all_connected(feeds: &FeedSet) -> bool {
        feeds.snapshot().await.iter().all(|h| h.connected)
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_feeds_are_left_alone() {
        let transport = Arc::new(MockTransport::new());
        let feeds = feed_set(&transport);
        feeds.start_all().await;
        wait_until_async(|| all_connected(&feeds)).await;

        let recoveries = feeds.ensure_connected().await;
        assert_eq!(
            recoveries,
            vec![
                Recovery::Healthy { feed_id: "P2P".into(), generation: 1 },
                Recovery::Healthy { feed_id: "Wolfx".into(), generation: 1 },
            ]
        );
        assert_eq!(transport.attempts(P2P), 1);
        feeds.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuilds_only_the_disconnected_feed() {
        let transport = Arc::new(MockTransport::new());
        transport.refuse(WOLFX);
        let feeds = feed_set(&transport);
        feeds.start_all().await;
        wait_until_async(|| async { feeds.snapshot().await[0].connected }).await;

        let recoveries = feeds.ensure_connected().await;
        assert!(!recoveries[0].is_rebuilt());
        assert_eq!(
            recoveries[1],
            Recovery::Rebuilt { feed_id: "Wolfx".into(), previous: 1, current: 2 }
        );
        assert_eq!(feeds.generation("P2P").await, Some(1));
        assert_eq!(feeds.generation("Wolfx").await, Some(2));
        assert_eq!(transport.attempts(P2P), 1);
        assert_eq!(transport.live_streams(P2P), 1);
        feeds.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_rebuild_after_stop_all() {
        let transport = Arc::new(MockTransport::new());
        let feeds = feed_set(&transport);
        feeds.start_all().await;
        feeds.stop_all().await;

        assert!(feeds.ensure_connected().await.is_empty());
        assert_eq!(feeds.ensure_feed_connected("P2P").await, None);
        assert_eq!(feeds.generation("P2P").await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_feed_is_ignored() {
        let transport = Arc::new(MockTransport::new());
        let feeds = feed_set(&transport);
        feeds.start_all().await;
        assert_eq!(feeds.ensure_feed_connected("nope").await, None);
        assert_eq!(feeds.feed_ids(), vec!["P2P", "Wolfx"]);
        feeds.stop_all().await;
    }
}
