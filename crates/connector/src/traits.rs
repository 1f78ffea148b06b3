use async_trait::async_trait;
use std::time::Duration;

use crate::error::{ConnectorError, RelaunchError, SinkError};

/// Callbacks a feed connection delivers to its owner
pub trait FeedListener: Send + Sync {
    /// One application-level text frame, in wire order
    fn on_message(&self, payload: &str);

    /// Fired on every transition into or out of Connected
    fn on_status_changed(&self, connected: bool);
}

/// External notification collaborator, called once per accepted message
pub trait NotificationSink: Send + Sync {
    fn notify(&self, feed_type: &str, payload: &str) -> Result<(), SinkError>;
}

/// Answers whether the ingestion process is currently running
pub trait LivenessProbe: Send + Sync {
    fn is_process_alive(&self) -> bool;
}

/// Starts the ingestion process
pub trait Launcher: Send + Sync {
    fn launch(&self) -> Result<(), RelaunchError>;
}

/// One-shot relaunch scheduling (the fast restart path)
pub trait RelaunchTimer: Send + Sync {
    /// Schedule a relaunch at exactly `delay` from now.
    /// Hosts that refuse precise timing return `RelaunchError::ExactDenied`.
    fn schedule_exact(&self, delay: Duration) -> Result<(), RelaunchError>;

    /// Schedule a relaunch no earlier than `delay`, at the host's convenience
    fn schedule_inexact(&self, delay: Duration) -> Result<(), RelaunchError>;

    /// Cancel every relaunch scheduled so far
    fn cancel_all(&self) -> Result<(), RelaunchError>;
}

/// Read access for consumers attaching after messages arrived
pub trait ReplayQuery: Send + Sync {
    /// Consume-once read of one feed's buffered messages
    fn pop_messages(&self, feed_type: &str) -> Vec<String>;

    /// Every buffered message, non-destructively
    fn all_messages(&self) -> Vec<String>;
}

/// Per-connection socket timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(10),
            write: Duration::from_secs(10),
        }
    }
}

impl From<&quakefeed_metadata::Timeouts> for ConnectionTimeouts {
    fn from(t: &quakefeed_metadata::Timeouts) -> Self {
        Self {
            connect: t.connect(),
            read: t.read(),
            write: t.write(),
        }
    }
}

/// A frame read from a feed socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close(Option<String>),
}

/// Opens streaming sockets (WebSocket in production, in-memory in tests)
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn open(
        &self,
        endpoint: &str,
        timeouts: &ConnectionTimeouts,
    ) -> Result<Box<dyn FeedStream>, ConnectorError>;
}

/// One open socket. Dropping it releases the underlying connection.
#[async_trait]
pub trait FeedStream: Send {
    /// Next frame, or None once the stream has ended
    async fn next_frame(&mut self) -> Option<Result<Frame, ConnectorError>>;

    async fn send_ping(&mut self) -> Result<(), ConnectorError>;

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<(), ConnectorError>;

    /// Graceful close with a normal status code
    async fn close(&mut self) -> Result<(), ConnectorError>;
}
