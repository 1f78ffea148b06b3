use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("{0} timed out after {1}s")]
    Timeout(&'static str, u64),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid state file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum RelaunchError {
    #[error("exact relaunch scheduling denied by host")]
    ExactDenied,
    #[error("failed to spawn relaunch: {0}")]
    SpawnFailed(String),
    #[error("supervisor state: {0}")]
    State(#[from] StateError),
}
