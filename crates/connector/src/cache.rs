//! Same-day message cache
//!
//! Buffers raw feed messages per feed type so a consumer that attaches late
//! can replay what arrived earlier today. Entries from a previous calendar
//! day are dropped lazily on the next read or write of their bucket.

use chrono::{Local, NaiveDate};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::error::CacheError;
use crate::metrics;

/// Source of the current local date
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub feed_type: String,
    pub payload: String,
    pub received_date: NaiveDate,
}

pub struct MessageCache {
    clock: Arc<dyn Clock>,
    buckets: Mutex<BTreeMap<String, Vec<CachedMessage>>>,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<CachedMessage>>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop stale entries from one bucket, removing it once empty
    fn expire(
        buckets: &mut BTreeMap<String, Vec<CachedMessage>>,
        feed_type: &str,
        today: NaiveDate,
    ) {
        if let Some(bucket) = buckets.get_mut(feed_type) {
            let before = bucket.len();
            bucket.retain(|m| m.received_date == today);
            let dropped = before - bucket.len();
            if dropped > 0 {
                debug!(feed = %feed_type, dropped, "Expired messages from a previous day");
            }
            if bucket.is_empty() {
                buckets.remove(feed_type);
            }
        }
        metrics::set_cache_entries(
            feed_type,
            buckets.get(feed_type).map_or(0, Vec::len),
        );
    }

    fn expire_all(buckets: &mut BTreeMap<String, Vec<CachedMessage>>, today: NaiveDate) {
        let keys: Vec<String> = buckets.keys().cloned().collect();
        for key in keys {
            Self::expire(buckets, &key, today);
        }
    }

    /// Append a message stamped with today's date
    pub fn add(&self, feed_type: &str, payload: &str) -> Result<(), CacheError> {
        if feed_type.is_empty() {
            return Err(CacheError::InvalidArgument("feed type must not be empty"));
        }
        if payload.is_empty() {
            return Err(CacheError::InvalidArgument("message must not be empty"));
        }

        let today = self.clock.today();
        let mut buckets = self.lock();
        Self::expire(&mut buckets, feed_type, today);
        let bucket = buckets.entry(feed_type.to_string()).or_default();
        bucket.push(CachedMessage {
            feed_type: feed_type.to_string(),
            payload: payload.to_string(),
            received_date: today,
        });
        metrics::set_cache_entries(feed_type, bucket.len());
        Ok(())
    }

    /// Today's messages for one feed, in arrival order. Non-destructive.
    pub fn get_messages(&self, feed_type: &str) -> Vec<String> {
        let today = self.clock.today();
        let mut buckets = self.lock();
        Self::expire(&mut buckets, feed_type, today);
        buckets
            .get(feed_type)
            .map(|b| b.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Today's messages for one feed; the bucket is emptied
    pub fn pop_messages(&self, feed_type: &str) -> Vec<String> {
        let today = self.clock.today();
        let mut buckets = self.lock();
        Self::expire(&mut buckets, feed_type, today);
        let popped: Vec<String> = buckets
            .remove(feed_type)
            .map(|b| b.into_iter().map(|m| m.payload).collect())
            .unwrap_or_default();
        metrics::set_cache_entries(feed_type, 0);
        popped
    }

    pub fn size(&self, feed_type: &str) -> usize {
        let today = self.clock.today();
        let mut buckets = self.lock();
        Self::expire(&mut buckets, feed_type, today);
        buckets.get(feed_type).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, feed_type: &str) -> bool {
        self.size(feed_type) == 0
    }

    pub fn total_size(&self) -> usize {
        let today = self.clock.today();
        let mut buckets = self.lock();
        Self::expire_all(&mut buckets, today);
        buckets.values().map(Vec::len).sum()
    }

    /// Feed types with at least one message from today
    pub fn types(&self) -> BTreeSet<String> {
        let today = self.clock.today();
        let mut buckets = self.lock();
        Self::expire_all(&mut buckets, today);
        buckets.keys().cloned().collect()
    }

    pub fn clear(&self, feed_type: &str) {
        self.lock().remove(feed_type);
        metrics::set_cache_entries(feed_type, 0);
    }

    pub fn clear_all(&self) {
        let mut buckets = self.lock();
        for key in buckets.keys() {
            metrics::set_cache_entries(key, 0);
        }
        buckets.clear();
    }

    /// Every message from today, grouped by feed type name order, each
    /// group in arrival order. Non-destructive.
    pub fn all_messages(&self) -> Vec<String> {
        let today = self.clock.today();
        let mut buckets = self.lock();
        Self::expire_all(&mut buckets, today);
        buckets
            .values()
            .flat_map(|b| b.iter().map(|m| m.payload.clone()))
            .collect()
    }

    /// Every message from today, removed from the cache, keyed by feed type
    pub fn drain_all(&self) -> BTreeMap<String, Vec<String>> {
        let today = self.clock.today();
        let mut buckets = self.lock();
        Self::expire_all(&mut buckets, today);
        let drained = std::mem::take(&mut *buckets);
        drained
            .into_iter()
            .map(|(feed_type, bucket)| {
                metrics::set_cache_entries(&feed_type, 0);
                (feed_type, bucket.into_iter().map(|m| m.payload).collect())
            })
            .collect()
    }
}
