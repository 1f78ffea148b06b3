use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

use crate::metrics::encode_metrics;
use crate::status::FeedHealth;
use crate::supervisor::Supervisor;
use crate::traits::ReplayQuery;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime: String,
    pub messages_received: u64,
    pub feeds: Vec<FeedHealth>,
}

#[derive(Serialize)]
pub struct ReplayResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<String>,
    pub count: usize,
    pub messages: Vec<String>,
}

#[derive(Serialize)]
pub struct StopResponse {
    pub status: String,
}

/// Shared state for the HTTP endpoints
#[derive(Clone)]
pub struct ServerState {
    pub supervisor: Arc<Supervisor>,
    /// Woken once an intentional stop has completed
    pub stopped: Arc<Notify>,
}

impl ServerState {
    pub fn new(supervisor: Arc<Supervisor>, stopped: Arc<Notify>) -> Self {
        Self {
            supervisor,
            stopped,
        }
    }

    fn health(&self, status: &str) -> HealthResponse {
        let snapshot = self.supervisor.status();
        HealthResponse {
            status: status.to_string(),
            uptime: snapshot.uptime,
            messages_received: snapshot.messages_received,
            feeds: snapshot.feeds,
        }
    }
}

/// Health endpoint - always returns 200 if server is running
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(state.health("ok"))
}

/// Ready endpoint - returns 200 only when every feed is connected
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    if state.supervisor.board().all_connected() {
        (StatusCode::OK, Json(state.health("ready")))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(state.health("not_ready")))
    }
}

async fn metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            e.to_string(),
        ),
    }
}

/// Every buffered message, non-destructively
async fn replay_all(State(state): State<ServerState>) -> Json<ReplayResponse> {
    let messages = state.supervisor.all_messages();
    Json(ReplayResponse {
        feed: None,
        count: messages.len(),
        messages,
    })
}

/// Consume-once read of one feed
async fn replay_pop(
    State(state): State<ServerState>,
    Path(feed): Path<String>,
) -> Json<ReplayResponse> {
    let messages = state.supervisor.pop_messages(&feed);
    info!(feed = %feed, count = messages.len(), "Replay popped");
    Json(ReplayResponse {
        feed: Some(feed),
        count: messages.len(),
        messages,
    })
}

/// Every buffered message keyed by feed; the cache is emptied
async fn replay_drain(State(state): State<ServerState>) -> Json<BTreeMap<String, Vec<String>>> {
    Json(state.supervisor.drain_all())
}

async fn stop(State(state): State<ServerState>) -> Json<StopResponse> {
    state.supervisor.stop_intentionally().await;
    state.stopped.notify_one();
    Json(StopResponse {
        status: "stopped".to_string(),
    })
}

/// Create the HTTP router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/replay", get(replay_all))
        .route("/replay/drain", post(replay_drain))
        .route("/replay/:feed/pop", post(replay_pop))
        .route("/stop", post(stop))
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(addr: SocketAddr, state: ServerState) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MessageCache;
    use crate::state::{MemoryStateStore, StateStore};
    use crate::supervisor::SupervisorConfig;
    use crate::test_helpers::{test_spec, MockTransport, RecordingSink, RecordingTimer, TimerCall};
    use crate::traits::{FeedTransport, NotificationSink, RelaunchTimer};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestServer {
        state: ServerState,
        store: Arc<MemoryStateStore>,
        timer: Arc<RecordingTimer>,
    }

    fn create_test_state() -> TestServer {
        let store = Arc::new(MemoryStateStore::default());
        let timer = Arc::new(RecordingTimer::new(true));
        let config = SupervisorConfig {
            feeds: vec![
                test_spec("P2P", "wss://p2p.test/ws"),
                test_spec("Wolfx", "wss://wolfx.test/ws"),
            ],
            watchdog_interval: Duration::from_secs(33),
            status_refresh: Duration::from_secs(10),
            relaunch_delay: Duration::from_secs(3),
        };
        let supervisor = Supervisor::new(
            config,
            Arc::new(MockTransport::new()) as Arc<dyn FeedTransport>,
            Arc::new(MessageCache::new()),
            Arc::new(RecordingSink::default()) as Arc<dyn NotificationSink>,
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::clone(&timer) as Arc<dyn RelaunchTimer>,
        );
        TestServer {
            state: ServerState::new(Arc::new(supervisor), Arc::new(Notify::new())),
            store,
            timer,
        }
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_health_returns_ok() {
        let server = create_test_state();
        server.state.supervisor.board().set_connected("P2P", true);

        let (status, body) = send(create_router(server.state), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["feeds"][0]["feed"], "P2P");
        assert_eq!(body["feeds"][0]["connected"], true);
    }

    #[tokio::test]
    async fn test_ready_when_all_connected() {
        let server = create_test_state();
        let board = server.state.supervisor.board();
        board.set_connected("P2P", true);
        board.set_connected("Wolfx", true);

        let (status, body) = send(create_router(server.state), "GET", "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn test_ready_when_one_feed_down() {
        let server = create_test_state();
        let board = server.state.supervisor.board();
        board.set_connected("P2P", true);
        board.set_connected("Wolfx", false);

        let (status, body) = send(create_router(server.state), "GET", "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let server = create_test_state();
        let response = create_router(server.state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_replay_and_pop() {
        let server = create_test_state();
        let cache = server.state.supervisor.cache();
        cache.add("P2P", "m1").unwrap();
        cache.add("P2P", "m2").unwrap();
        cache.add("Wolfx", "w1").unwrap();
        let app = create_router(server.state.clone());

        let (status, body) = send(app.clone(), "GET", "/replay").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 3);

        let (_, body) = send(app.clone(), "POST", "/replay/P2P/pop").await;
        assert_eq!(body["feed"], "P2P");
        assert_eq!(body["messages"], serde_json::json!(["m1", "m2"]));

        let (_, body) = send(app.clone(), "POST", "/replay/P2P/pop").await;
        assert_eq!(body["count"], 0);

        let (_, body) = send(app, "POST", "/replay/drain").await;
        assert_eq!(body["Wolfx"], serde_json::json!(["w1"]));
        assert_eq!(server.state.supervisor.cache().total_size(), 0);
    }

    #[tokio::test]
    async fn test_stop_records_intent_and_wakes_host() {
        let server = create_test_state();
        let stopped = Arc::clone(&server.state.stopped);

        let (status, body) = send(create_router(server.state), "POST", "/stop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert!(server.store.load().unwrap().intentional_stop);
        assert_eq!(server.timer.calls(), vec![TimerCall::CancelAll]);

        tokio::time::timeout(Duration::from_secs(1), stopped.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pop_requires_post() {
        let server = create_test_state();
        let (status, _) = send(create_router(server.state), "GET", "/replay/P2P/pop").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
