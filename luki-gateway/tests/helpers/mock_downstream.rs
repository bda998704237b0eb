//! Mock agent and memory services for integration testing.
//!
//! A real axum server on an ephemeral port, so the gateway's reqwest
//! clients go through the full connect, send and read path.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Behaviour of the mock agent.
#[derive(Debug, Clone)]
pub struct MockDownstream {
    status: StatusCode,
    delay: Duration,
    reply: Value,
    tokens: Vec<String>,
    complete_stream: bool,
}

impl Default for MockDownstream {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            delay: Duration::ZERO,
            reply: json!({
                "response": "Hello from the agent",
                "metadata": { "model": "mock" }
            }),
            tokens: vec!["A".to_string(), "B".to_string()],
            complete_stream: true,
        }
    }
}

impl MockDownstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every unary call with `status`.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_reply(mut self, reply: Value) -> Self {
        self.reply = reply;
        self
    }

    /// Tokens emitted on `/v1/chat/stream`.
    pub fn with_tokens(mut self, tokens: &[&str]) -> Self {
        self.tokens = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    /// End the stream without a completion marker.
    pub fn truncated(mut self) -> Self {
        self.complete_stream = false;
        self
    }

    /// Bind to an ephemeral port and serve in the background.
    pub async fn start(self) -> MockServerHandle {
        let state = MockState {
            behaviour: Arc::new(self),
            calls: Arc::new(AtomicUsize::new(0)),
            bodies: Arc::new(Mutex::new(Vec::new())),
            request_ids: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route("/v1/chat", post(chat))
            .route("/v1/chat/stream", post(chat_stream))
            .route("/search", post(search))
            .route("/elr/users/{user_id}/items", get(elr_items))
            .route("/health", get(|| async { "ok" }))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock downstream");
        let addr = listener.local_addr().expect("Failed to read mock address");
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("Mock downstream failed");
        });

        MockServerHandle { addr, state, task }
    }
}

#[derive(Clone)]
struct MockState {
    behaviour: Arc<MockDownstream>,
    calls: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    request_ids: Arc<Mutex<Vec<String>>>,
}

impl MockState {
    fn record(&self, headers: &HeaderMap, body: Value) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().push(body);
        let request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.request_ids.lock().push(request_id);
    }
}

/// Running mock server. Aborted on drop.
pub struct MockServerHandle {
    addr: SocketAddr,
    state: MockState,
    task: JoinHandle<()>,
}

impl MockServerHandle {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Requests received on the chat, search and life-record endpoints.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.state.bodies.lock().clone()
    }

    /// `X-Request-ID` values seen, in arrival order.
    pub fn request_ids(&self) -> Vec<String> {
        self.state.request_ids.lock().clone()
    }
}

impl Drop for MockServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn chat(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.record(&headers, body);
    tokio::time::sleep(state.behaviour.delay).await;

    let behaviour = &state.behaviour;
    if behaviour.status.is_success() {
        (behaviour.status, Json(behaviour.reply.clone()))
    } else {
        (
            behaviour.status,
            Json(json!({ "detail": "agent failure at 10.0.0.7:9000" })),
        )
    }
}

async fn chat_stream(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.record(&headers, body);

    let mut payload = String::new();
    for token in &state.behaviour.tokens {
        payload.push_str(&format!("data: {}\n\n", json!({ "token": token })));
    }
    if state.behaviour.complete_stream {
        payload.push_str("data: {\"done\":true}\n\n");
    }

    ([(header::CONTENT_TYPE, "text/event-stream")], payload)
}

async fn search(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.record(&headers, body);
    Json(json!({
        "results": [
            { "content": "User prefers short answers", "score": 0.92 }
        ]
    }))
}

async fn elr_items(
    State(state): State<MockState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.record(&headers, json!({ "user_id": user_id }));
    Json(json!({ "items": [], "total_count": 0, "user_id": user_id }))
}
