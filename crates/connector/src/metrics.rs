//! Prometheus metrics for feed ingestion
//!
//! Per-feed connection and message-flow metrics, plus relaunch scheduling.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

const LABEL_FEED: &str = "feed";
const LABEL_MODE: &str = "mode";

/// Total messages accepted per feed
static MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quakefeed_messages_total",
        "Total messages received per feed",
        &[LABEL_FEED]
    )
    .expect("Failed to register messages_total metric")
});

/// Connection status per feed (1 = connected, 0 = disconnected)
static FEED_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "quakefeed_feed_connected",
        "WebSocket connection status per feed (1=connected, 0=disconnected)",
        &[LABEL_FEED]
    )
    .expect("Failed to register feed_connected metric")
});

static RECONNECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quakefeed_reconnects_total",
        "Reconnect attempts scheduled after a failure",
        &[LABEL_FEED]
    )
    .expect("Failed to register reconnects_total metric")
});

/// Connections torn down and rebuilt by the health watchdog
static WATCHDOG_REBUILDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quakefeed_watchdog_rebuilds_total",
        "Feed connections rebuilt by the health watchdog",
        &[LABEL_FEED]
    )
    .expect("Failed to register watchdog_rebuilds_total metric")
});

static CACHE_ENTRIES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "quakefeed_cache_entries",
        "Messages held in the same-day cache per feed",
        &[LABEL_FEED]
    )
    .expect("Failed to register cache_entries metric")
});

static RELAUNCH_SCHEDULED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "quakefeed_relaunch_scheduled_total",
        "Relaunches scheduled after an unexpected teardown, by timing mode",
        &[LABEL_MODE]
    )
    .expect("Failed to register relaunch_scheduled_total metric")
});

pub fn inc_messages(feed: &str) {
    MESSAGES_TOTAL.with_label_values(&[feed]).inc();
}

pub fn set_feed_connected(feed: &str, connected: bool) {
    FEED_CONNECTED
        .with_label_values(&[feed])
        .set(i64::from(connected));
}

pub fn inc_reconnects(feed: &str) {
    RECONNECTS_TOTAL.with_label_values(&[feed]).inc();
}

pub fn inc_watchdog_rebuilds(feed: &str) {
    WATCHDOG_REBUILDS_TOTAL.with_label_values(&[feed]).inc();
}

pub fn set_cache_entries(feed: &str, count: usize) {
    CACHE_ENTRIES.with_label_values(&[feed]).set(count as i64);
}

pub fn inc_relaunch_scheduled(mode: &str) {
    RELAUNCH_SCHEDULED_TOTAL.with_label_values(&[mode]).inc();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}
