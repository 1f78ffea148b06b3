//! WebSocket transport for feed connections
//!
//! Plain text frames over a secure websocket. Connect and every outbound
//! frame are bounded by the feed's timeouts; read idleness is handled by
//! the connection driver.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame},
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};
use url::Url;

use crate::error::ConnectorError;
use crate::traits::{ConnectionTimeouts, FeedStream, FeedTransport, Frame};

/// Close reason sent on a deliberate shutdown
const CLOSE_REASON: &str = "client shutdown";

/// Production transport backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn open(
        &self,
        endpoint: &str,
        timeouts: &ConnectionTimeouts,
    ) -> Result<Box<dyn FeedStream>, ConnectorError> {
        let url = Url::parse(endpoint)
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;

        debug!(url = %url, "Opening feed WebSocket");

        let (ws, response) = tokio::time::timeout(timeouts.connect, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectorError::Timeout("connect", timeouts.connect.as_secs()))??;

        info!(url = %url, status = ?response.status(), "Feed WebSocket connected");

        Ok(Box::new(WsFeedStream {
            ws,
            write_timeout: timeouts.write,
        }))
    }
}

/// An open feed socket
pub struct WsFeedStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    write_timeout: Duration,
}

impl WsFeedStream {
    async fn send(&mut self, msg: Message) -> Result<(), ConnectorError> {
        tokio::time::timeout(self.write_timeout, self.ws.send(msg))
            .await
            .map_err(|_| ConnectorError::Timeout("write", self.write_timeout.as_secs()))??;
        Ok(())
    }
}

#[async_trait]
impl FeedStream for WsFeedStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, ConnectorError>> {
        loop {
            let msg = match self.ws.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };

            let frame = match msg {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(data) => Frame::Binary(data),
                Message::Ping(data) => Frame::Ping(data),
                Message::Pong(_) => Frame::Pong,
                Message::Close(frame) => {
                    Frame::Close(frame.map(|f| format!("{} {}", u16::from(f.code), f.reason)))
                }
                // Raw frames are never surfaced by the reader
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn send_ping(&mut self) -> Result<(), ConnectorError> {
        self.send(Message::Ping(Vec::new())).await
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<(), ConnectorError> {
        self.send(Message::Pong(data)).await
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(CLOSE_REASON),
        };
        tokio::time::timeout(self.write_timeout, self.ws.close(Some(frame)))
            .await
            .map_err(|_| ConnectorError::Timeout("close", self.write_timeout.as_secs()))??;
        Ok(())
    }
}
