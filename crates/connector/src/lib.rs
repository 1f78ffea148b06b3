//! quakefeed-connector-lib: resilient earthquake feed ingestion
//!
//! This crate keeps long-lived websocket feeds connected, buffers their
//! messages for same-day replay, and supervises restarts of the ingestion
//! process.

pub mod backoff;
pub mod cache;
pub mod connection;
pub mod error;
pub mod feeds;
pub mod metrics;
pub mod relaunch;
pub mod server;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod test_helpers;
pub mod traits;
pub mod watchdog;
pub mod websocket;

pub use backoff::Backoff;
pub use cache::{Clock, MessageCache, SystemClock};
pub use connection::{ConnectionState, FeedConnection, FeedSpec};
pub use error::{CacheError, ConnectorError, RelaunchError, SinkError, StateError};
pub use feeds::{FeedSet, Recovery};
pub use relaunch::{
    ensure_alive, fire_scheduled_relaunch, wait_for_exit, AliveCheck, Keepalive, PidFile,
    PidFileProbe, RelaunchFire,
};
pub use server::{create_router, run_server, ServerState};
pub use state::{FileStateStore, MemoryStateStore, StateStore, SupervisorState};
pub use status::{FeedHealth, StatusBoard, StatusSnapshot};
pub use supervisor::{
    NetworkEvent, ScheduleMode, Supervisor, SupervisorConfig, TeardownOutcome,
};
pub use traits::{
    ConnectionTimeouts, FeedListener, FeedStream, FeedTransport, Frame, Launcher, LivenessProbe,
    NotificationSink, RelaunchTimer, ReplayQuery,
};
pub use watchdog::Watchdog;
pub use websocket::WsTransport;
