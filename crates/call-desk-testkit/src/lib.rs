//! Mock backends for integration tests.
//!
//! `MockGateway` serves the call-center WebSocket on an ephemeral local
//! port, records every frame clients send, answers heartbeats unless told
//! to stay silent, and lets tests push frames to or drop the connected
//! clients. `MockAiService`
//! records the AI side-channel's start/stop notifications.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    Json,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

/// Path the mock serves the socket on.
pub const CALL_CENTER_PATH: &str = "/ws/call-center";

/// A frame received from a client.
#[derive(Debug, Clone)]
pub struct Received {
    pub connection: u64,
    pub caller_id: Option<String>,
    pub message: Value,
}

impl Received {
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.message.get("type").and_then(Value::as_str)
    }
}

#[derive(Default)]
struct GatewayState {
    next_id: AtomicU64,
    silent: AtomicBool,
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    accepted: Mutex<Vec<HashMap<String, String>>>,
    received: Mutex<Vec<Received>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running mock gateway. Stops when dropped.
pub struct MockGateway {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    server: JoinHandle<()>,
}

impl MockGateway {
    /// Bind to `127.0.0.1:0` and start serving.
    ///
    /// # Panics
    /// Panics if the listener cannot be bound.
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock gateway");
        let addr = listener.local_addr().expect("mock gateway address");

        let state = Arc::new(GatewayState::default());
        let app = Router::new()
            .route(CALL_CENTER_PATH, get(ws_handler))
            .with_state(Arc::clone(&state));

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Mock gateway stopped: {e}");
            }
        });

        Self { addr, state, server }
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Base URL without port, as the client config expects it.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr.ip())
    }

    /// Sockets currently open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        lock(&self.state.clients).len()
    }

    /// Sockets accepted since start.
    #[must_use]
    pub fn total_connections(&self) -> usize {
        lock(&self.state.accepted).len()
    }

    /// Query parameters of every accepted socket, in order.
    #[must_use]
    pub fn handshakes(&self) -> Vec<HashMap<String, String>> {
        lock(&self.state.accepted).clone()
    }

    /// Every frame received so far.
    #[must_use]
    pub fn received(&self) -> Vec<Received> {
        lock(&self.state.received).clone()
    }

    /// Received frames with the given `type`.
    #[must_use]
    pub fn received_of(&self, kind: &str) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.kind() == Some(kind))
            .collect()
    }

    /// Push a text frame to every open socket.
    pub fn send_to_all(&self, text: &str) {
        for tx in lock(&self.state.clients).values() {
            let _ = tx.send(Message::Text(text.to_string().into()));
        }
    }

    /// Stop answering heartbeats, so clients see no inbound traffic.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::Relaxed);
    }

    /// Close every open socket from the server side.
    pub fn kick_all(&self) {
        for tx in lock(&self.state.clients).values() {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Poll `check` until it holds or `timeout` passes.
    pub async fn wait_until(&self, timeout: Duration, check: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(socket: WebSocket, params: HashMap<String, String>, state: Arc<GatewayState>) {
    let id = state.next_id.fetch_add(1, Ordering::Relaxed);
    let caller_id = params.get("callerId").cloned();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    lock(&state.clients).insert(id, tx.clone());
    lock(&state.accepted).push(params);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("Mock gateway socket error: {e}");
                break;
            }
        };

        let Ok(message) = serde_json::from_str::<Value>(text.as_str()) else {
            tracing::warn!("Mock gateway got non-JSON frame");
            continue;
        };

        if message.get("type").and_then(Value::as_str) == Some("heartbeat")
            && !state.silent.load(Ordering::Relaxed)
        {
            let _ = tx.send(Message::Text(r#"{"type":"heartbeat_ack"}"#.to_string().into()));
        }

        lock(&state.received).push(Received {
            connection: id,
            caller_id: caller_id.clone(),
            message,
        });
    }

    lock(&state.clients).remove(&id);
    send_task.abort();
}

/// A recorded AI side-channel notification.
#[derive(Debug, Clone)]
pub struct AiNotice {
    /// `start` or `stop`.
    pub action: String,
    pub body: Value,
}

/// HTTP stand-in for the AI simulation service.
pub struct MockAiService {
    addr: SocketAddr,
    notices: Arc<Mutex<Vec<AiNotice>>>,
    server: JoinHandle<()>,
}

impl MockAiService {
    /// Bind to `127.0.0.1:0` and start serving.
    ///
    /// # Panics
    /// Panics if the listener cannot be bound.
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock AI service");
        let addr = listener.local_addr().expect("mock AI service address");

        let notices = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/api/calls/{action}", post(record_notice))
            .with_state(Arc::clone(&notices));

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Mock AI service stopped: {e}");
            }
        });

        Self {
            addr,
            notices,
            server,
        }
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    #[must_use]
    pub fn notices(&self) -> Vec<AiNotice> {
        lock(&self.notices).clone()
    }

    /// Poll until at least `count` notices arrived or `timeout` passes.
    pub async fn wait_for_notices(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while lock(&self.notices).len() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl Drop for MockAiService {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn record_notice(
    Path(action): Path<String>,
    State(notices): State<Arc<Mutex<Vec<AiNotice>>>>,
    Json(body): Json<Value>,
) -> StatusCode {
    lock(&notices).push(AiNotice { action, body });
    StatusCode::ACCEPTED
}
