//! Streaming HTTP transport: POST for client messages, SSE for server messages.
//!
//! Each logical session is keyed by the `Mcp-Session-Id` header (or a
//! `session_id` query parameter). A POST without a session id opens a new
//! session; a GET attaches the session's event stream, or performs the
//! legacy SSE handshake when no session id is given.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{HeaderMap, HeaderName, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mcp::codec;
use crate::mcp::protocol::{JsonRpcError, JSONRPC_VERSION};
use crate::mcp::session::SessionId;
use crate::mcp::transport::{Connection, Inbound, OutboundQueue, Transport, CHANNEL_CAPACITY};

/// Header carrying the session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// How long `finish` waits for the HTTP server to stop.
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings of the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub capacity: usize,
    pub max_body: usize,
    /// How long a session may go without its event stream before it is closed.
    pub idle_timeout: Duration,
}

impl HttpSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            path: config.path.clone(),
            capacity: CHANNEL_CAPACITY,
            max_body: config.max_frame_bytes,
            idle_timeout: config.session_idle_timeout,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Decides whether an HTTP request may reach the MCP endpoint.
pub trait AccessPolicy: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> bool;
}

/// Lets every request through.
#[derive(Debug, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn authorize(&self, _headers: &HeaderMap) -> bool {
        true
    }
}

/// Transport-side view of one session.
struct HttpSession {
    inbound: mpsc::Sender<Inbound>,
    stream: Mutex<Option<OutboundQueue>>,
    last_seen: Mutex<Instant>,
}

impl HttpSession {
    fn take_stream(&self) -> Option<OutboundQueue> {
        self.stream.lock().ok().and_then(|mut s| s.take())
    }

    fn touch(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
    }

    /// Time since the last client message, while no event stream is attached.
    fn unattached_idle(&self) -> Option<Duration> {
        let waiting = self.stream.lock().map(|s| s.is_some()).unwrap_or(false);
        if !waiting {
            return None;
        }
        self.last_seen.lock().ok().map(|t| t.elapsed())
    }
}

type SessionMap = Arc<DashMap<SessionId, Arc<HttpSession>>>;

/// HTTP server state.
#[derive(Clone)]
struct HttpState {
    sessions: SessionMap,
    accept_tx: mpsc::Sender<Connection>,
    path: Arc<str>,
    capacity: usize,
    idle_timeout: Duration,
    policy: Arc<dyn AccessPolicy>,
    metrics: Option<PrometheusHandle>,
    shutdown: CancellationToken,
}

impl HttpState {
    async fn open_session(&self) -> std::result::Result<(SessionId, Arc<HttpSession>), StatusCode> {
        if self.shutdown.is_cancelled() {
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }

        let id = SessionId::generate();
        let (connection, inbound, queue) = Connection::pair(id.clone(), self.capacity);
        let closed = connection.closed.clone();
        let session = Arc::new(HttpSession {
            inbound,
            stream: Mutex::new(Some(queue)),
            last_seen: Mutex::new(Instant::now()),
        });
        self.sessions.insert(id.clone(), session.clone());

        if self.accept_tx.send(connection).await.is_err() {
            self.sessions.remove(&id);
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }

        tokio::spawn(watch_session(
            self.sessions.clone(),
            id.clone(),
            Arc::downgrade(&session),
            closed,
            self.idle_timeout,
        ));

        info!("Opened HTTP session {}", id);
        Ok((id, session))
    }

    fn lookup(&self, id: &SessionId) -> Option<Arc<HttpSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }
}

/// Forget a session once it has closed. A session whose event stream never
/// attaches is dropped after `idle_timeout` without client messages, which
/// closes it.
async fn watch_session(
    sessions: SessionMap,
    id: SessionId,
    session: Weak<HttpSession>,
    closed: CancellationToken,
    idle_timeout: Duration,
) {
    loop {
        let idle = session.upgrade().and_then(|s| s.unattached_idle());
        let Some(idle) = idle else {
            closed.cancelled().await;
            break;
        };
        if idle >= idle_timeout {
            warn!(
                "HTTP session {} had no event stream for {:?}, closing",
                id, idle
            );
            sessions.remove(&id);
            closed.cancelled().await;
            break;
        }
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = tokio::time::sleep(idle_timeout - idle) => {}
        }
    }
    sessions.remove(&id);
}

/// Removes its session when the event stream is dropped.
struct StreamGuard {
    sessions: SessionMap,
    id: SessionId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.sessions.remove(&self.id).is_some() {
            debug!("Event stream for session {} dropped", self.id);
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

fn requested_session(headers: &HeaderMap, query: &SessionQuery) -> Option<SessionId> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(query.session_id.as_deref())
        .filter(|s| !s.is_empty())
        .map(SessionId::from)
}

fn session_header(id: &SessionId) -> [(HeaderName, String); 1] {
    [(HeaderName::from_static(SESSION_HEADER), id.to_string())]
}

/// Streaming HTTP transport for MCP.
pub struct HttpTransport {
    state: HttpState,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    settings: HttpSettings,
    server: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    local_addr: Option<SocketAddr>,
}

impl HttpTransport {
    /// Create the transport without binding a listener.
    pub fn new(settings: HttpSettings) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(settings.capacity);
        let state = HttpState {
            sessions: Arc::new(DashMap::new()),
            accept_tx,
            path: Arc::from(settings.path.as_str()),
            capacity: settings.capacity,
            idle_timeout: settings.idle_timeout,
            policy: Arc::new(AllowAll),
            metrics: None,
            shutdown: CancellationToken::new(),
        };
        Self {
            state,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            settings,
            server: Mutex::new(None),
            local_addr: None,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.state.policy = policy;
        self
    }

    /// Serve `/metrics` from a Prometheus recorder.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the router serving this transport.
    pub fn router(&self) -> Router {
        let path = self.state.path.to_string();
        Router::new()
            .route(
                &path,
                post(post_message).get(open_stream).delete(delete_session),
            )
            .route("/health", get(health_check))
            .route("/metrics", get(render_metrics))
            .layer(DefaultBodyLimit::max(self.settings.max_body))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
                    .expose_headers([HeaderName::from_static(SESSION_HEADER)]),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and start serving.
    pub async fn bind(mut self) -> Result<Self> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::HttpServer(format!("failed to bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        info!(
            "Starting HTTP server on {} (endpoint {})",
            local_addr, self.settings.path
        );

        let router = self.router();
        let shutdown = self.state.shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        });

        self.local_addr = Some(local_addr);
        if let Ok(mut slot) = self.server.lock() {
            *slot = Some(server);
        }
        Ok(self)
    }

    /// Address the server is listening on, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of sessions the transport currently knows about.
    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn accept(&self) -> Option<Connection> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.state.shutdown.cancelled() => None,
            connection = rx.recv() => connection,
        }
    }

    async fn shutdown(&self) {
        self.state.shutdown.cancel();

        // Connections created but never handed to the server are closed here.
        let mut rx = self.accept_rx.lock().await;
        rx.close();
        while let Ok(connection) = rx.try_recv() {
            self.state.sessions.remove(&connection.id);
            connection.closed.cancel();
        }
    }

    async fn finish(&self) -> Result<()> {
        let server = self.server.lock().ok().and_then(|mut s| s.take());
        let Some(mut server) = server else {
            return Ok(());
        };

        match tokio::time::timeout(SERVER_STOP_TIMEOUT, &mut server).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(Error::HttpServer(e.to_string())),
            Ok(Err(e)) => Err(Error::HttpServer(e.to_string())),
            Err(_) => {
                warn!("HTTP server did not stop within {:?}", SERVER_STOP_TIMEOUT);
                server.abort();
                Ok(())
            }
        }
    }
}

fn decode_failure(error: codec::DecodeError) -> Response {
    let body = serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": error.id,
        "error": JsonRpcError::new(error.kind.into(), error.message),
    });
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Deliver one client message.
async fn post_message(
    State(state): State<HttpState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.policy.authorize(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let message = match codec::decode(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!("Rejecting malformed POST body: {}", e);
            return decode_failure(e);
        }
    };

    let (id, session) = match requested_session(&headers, &query) {
        Some(id) => match state.lookup(&id) {
            Some(session) => (id, session),
            None => return StatusCode::NOT_FOUND.into_response(),
        },
        None => match state.open_session().await {
            Ok(opened) => opened,
            Err(status) => return status.into_response(),
        },
    };

    session.touch();
    if session.inbound.send(Inbound::Message(message)).await.is_err() {
        state.sessions.remove(&id);
        return StatusCode::GONE.into_response();
    }

    (StatusCode::ACCEPTED, session_header(&id)).into_response()
}

fn event_stream(
    queue: OutboundQueue,
    guard: StreamGuard,
    first: Option<SseEvent>,
) -> impl Stream<Item = std::result::Result<SseEvent, Infallible>> {
    let messages = futures::stream::unfold((queue, guard), |(mut queue, guard)| async move {
        let message = queue.next().await?;
        let event = match codec::encode_to_string(&message) {
            Ok(data) => SseEvent::default().event("message").data(data),
            Err(e) => SseEvent::default().event("error").data(e.to_string()),
        };
        Some((Ok(event), (queue, guard)))
    });
    futures::stream::iter(first.map(Ok)).chain(messages)
}

/// Attach a session's event stream, or open a session via the SSE handshake.
async fn open_stream(
    State(state): State<HttpState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    if !state.policy.authorize(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let (id, session, first) = match requested_session(&headers, &query) {
        Some(id) => match state.lookup(&id) {
            Some(session) => (id, session, None),
            None => return StatusCode::NOT_FOUND.into_response(),
        },
        None => match state.open_session().await {
            Ok((id, session)) => {
                let endpoint = format!("{}?session_id={}", state.path, id);
                (id, session, Some(SseEvent::default().event("endpoint").data(endpoint)))
            }
            Err(status) => return status.into_response(),
        },
    };

    let Some(queue) = session.take_stream() else {
        return StatusCode::CONFLICT.into_response();
    };
    debug!("Event stream attached to session {}", id);

    let guard = StreamGuard {
        sessions: state.sessions.clone(),
        id: id.clone(),
    };
    let sse = Sse::new(event_stream(queue, guard, first)).keep_alive(KeepAlive::default());
    (session_header(&id), sse).into_response()
}

/// Close a session from the client side.
async fn delete_session(
    State(state): State<HttpState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> StatusCode {
    if !state.policy.authorize(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let Some(id) = requested_session(&headers, &query) else {
        return StatusCode::BAD_REQUEST;
    };
    match state.sessions.remove(&id) {
        Some(_) => {
            info!("Client closed HTTP session {}", id);
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Health check endpoint.
async fn health_check(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "sessions": state.sessions.len(),
    }))
}

/// Prometheus metrics endpoint.
async fn render_metrics(State(state): State<HttpState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
