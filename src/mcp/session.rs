//! Session lifecycle.
//!
//! A [`Session`] owns one [`Connection`]: it correlates requests with
//! responses, runs the lifecycle state machine and drains outstanding work
//! when it closes. Every request that enters the pending table leaves it
//! exactly once; whoever removes the record sends the response.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatchMode;
use crate::error::{Error, Result};
use crate::mcp::dispatcher::Dispatcher;
use crate::mcp::protocol::{
    methods, CancelledParams, ClientInfo, ErrorKind, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, Message, RequestId,
};
use crate::mcp::transport::{Connection, Inbound, Outbound};
use crate::observe::{Event, EventSink};

/// Identifier of a logical session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// A fresh random id.
    pub fn generate() -> Self {
        Self(Arc::from(uuid::Uuid::new_v4().to_string()))
    }

    /// The fixed id of the stdio session.
    pub fn stdio() -> Self {
        Self(Arc::from("stdio"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        matches!(
            (self, to),
            (Self::Open, Self::Active)
                | (Self::Open, Self::Closing)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session is closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ShutdownRequested,
    ServerShutdown,
    TransportFailed(String),
    ProtocolError(String),
    SendFailed(String),
}

impl CloseReason {
    /// Whether outstanding requests get the drain window.
    ///
    /// A session that can no longer write has nothing to drain into.
    pub fn drains(&self) -> bool {
        !matches!(self, Self::SendFailed(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed the connection"),
            Self::ShutdownRequested => f.write_str("peer requested shutdown"),
            Self::ServerShutdown => f.write_str("server shutting down"),
            Self::TransportFailed(r) => write!(f, "transport failed: {}", r),
            Self::ProtocolError(r) => write!(f, "protocol error: {}", r),
            Self::SendFailed(r) => write!(f, "send failed: {}", r),
        }
    }
}

/// Per-session behaviour decided once by configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub drain_timeout: Duration,
    pub dispatch: DispatchMode,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(10),
            dispatch: DispatchMode::Concurrent,
        }
    }
}

/// An outstanding peer request.
#[derive(Debug)]
struct PendingRequest {
    method: String,
    cancel: CancellationToken,
    started: Instant,
}

/// State shared by a session, its handle, its tasks and its `Peer`s.
struct SessionShared {
    id: SessionId,
    state: watch::Sender<SessionState>,
    pending: DashMap<RequestId, PendingRequest>,
    pending_count: watch::Sender<usize>,
    outbound: Outbound,
    cancel: CancellationToken,
    close_requested: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    next_id: AtomicI64,
    peer_pending: DashMap<RequestId, oneshot::Sender<JsonRpcResponse>>,
    client: RwLock<Option<ClientInfo>>,
    initialized: AtomicBool,
    sink: Arc<dyn EventSink>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, to: SessionState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(to) {
                from = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });

        match from {
            Some(from) => {
                debug!("Session {}: {} -> {}", self.id, from, to);
                self.sink.emit(Event::transition(self.id.clone(), from, to));
                true
            }
            None => false,
        }
    }

    fn request_close(&self, reason: CloseReason) {
        if self.close_reason.set(reason).is_ok() {
            self.close_requested.cancel();
        }
    }

    fn close_reason(&self) -> CloseReason {
        self.close_reason
            .get()
            .cloned()
            .unwrap_or(CloseReason::ServerShutdown)
    }

    /// Record a new outstanding request. `None` if the id is already in use.
    fn insert_pending(&self, id: RequestId, method: &str) -> Option<CancellationToken> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let cancel = self.cancel.child_token();
                slot.insert(PendingRequest {
                    method: method.to_string(),
                    cancel: cancel.clone(),
                    started: Instant::now(),
                });
                self.pending_count.send_modify(|n| *n += 1);
                Some(cancel)
            }
        }
    }

    /// Claim the right to answer a request.
    fn take_pending(&self, id: &RequestId) -> Option<PendingRequest> {
        self.pending.remove(id).map(|(_, pending)| pending)
    }

    /// Called after the claimed request's response has been queued.
    fn release(&self) {
        self.pending_count.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Queue a message for the peer. Gives up once the session has torn down.
    async fn send(&self, message: Message) {
        self.send_or(message, self.cancel.cancelled()).await
    }

    /// Queue a message for the peer unless `stop` resolves while the outbound
    /// queue is full.
    async fn send_or<F>(&self, message: Message, stop: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            sent = self.outbound.send(message) => {
                if let Err(e) = sent {
                    debug!("Session {}: {}", self.id, e);
                    if e.is_fatal_to_session() {
                        self.request_close(CloseReason::SendFailed(e.to_string()));
                    }
                }
            }
            _ = stop => {
                warn!("Session {}: peer is not reading, dropping outbound message", self.id);
            }
        }
    }

    async fn cancel_request<F>(&self, id: &RequestId, reason: &str, stop: F) -> bool
    where
        F: Future<Output = ()>,
    {
        let Some(pending) = self.take_pending(id) else {
            return false;
        };
        pending.cancel.cancel();
        debug!(
            "Session {}: cancelled {} ({}) after {:?}",
            self.id,
            id,
            pending.method,
            pending.started.elapsed()
        );
        self.send_or(JsonRpcResponse::cancelled(id.clone(), reason).into(), stop)
            .await;
        self.release();
        true
    }

    /// Answer every outstanding request with `Cancelled`. Responses that
    /// cannot be queued by `deadline` are dropped.
    async fn cancel_all(&self, reason: &str, deadline: tokio::time::Instant) {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            info!(
                "Session {}: cancelling {} outstanding request(s)",
                self.id,
                ids.len()
            );
        }
        for id in ids {
            self.cancel_request(&id, reason, sleep_until(deadline)).await;
        }
    }

    fn complete_peer_request(&self, response: JsonRpcResponse) {
        match self.peer_pending.remove(&response.id) {
            Some((_, tx)) => {
                let _ = tx.send(response);
            }
            None => warn!(
                "Session {}: dropping response for unknown request {}",
                self.id, response.id
            ),
        }
    }
}

/// How requests of one session are executed.
enum Lane {
    Concurrent,
    Serialized(mpsc::UnboundedSender<Job>),
}

enum Job {
    Request(JsonRpcRequest, CancellationToken),
    Notification(JsonRpcNotification),
}

impl Lane {
    fn new(mode: DispatchMode, shared: Arc<SessionShared>, dispatcher: Arc<Dispatcher>) -> Self {
        match mode {
            DispatchMode::Concurrent => Self::Concurrent,
            DispatchMode::Serialized => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        run_job(job, &shared, &dispatcher).await;
                    }
                });
                Self::Serialized(tx)
            }
        }
    }

    fn submit(&self, job: Job, shared: &Arc<SessionShared>, dispatcher: &Arc<Dispatcher>) {
        match self {
            Self::Concurrent => {
                let shared = shared.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { run_job(job, &shared, &dispatcher).await });
            }
            Self::Serialized(tx) => {
                if tx.send(job).is_err() {
                    warn!("Session {}: request worker has stopped", shared.id);
                }
            }
        }
    }
}

async fn run_job(job: Job, shared: &Arc<SessionShared>, dispatcher: &Dispatcher) {
    match job {
        Job::Request(request, cancel) => {
            // Already answered by whoever cancelled it.
            if cancel.is_cancelled() {
                return;
            }
            let id = request.id.clone();
            let ctx = RequestContext::new(shared, Some(id.clone()), cancel);
            let Some(response) = dispatcher.handle_request(request, ctx).await else {
                return;
            };
            if shared.take_pending(&id).is_some() {
                shared.send(response.into()).await;
                shared.release();
            }
        }
        Job::Notification(notification) => {
            let ctx = RequestContext::new(shared, None, shared.cancel.child_token());
            dispatcher.handle_notification(notification, ctx).await;
        }
    }
}

async fn wait_idle(count: &mut watch::Receiver<usize>) {
    let _ = count.wait_for(|n| *n == 0).await;
}

/// One logical connection with a peer.
pub struct Session {
    shared: Arc<SessionShared>,
    inbound: mpsc::Receiver<Inbound>,
    closed: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    lane: Lane,
    drain_timeout: Duration,
}

impl Session {
    /// Create a session over `connection`. The session does nothing until
    /// [`Session::run`] is polled.
    pub fn new(
        connection: Connection,
        dispatcher: Arc<Dispatcher>,
        options: SessionOptions,
        sink: Arc<dyn EventSink>,
    ) -> (Self, SessionHandle) {
        let Connection {
            id,
            inbound,
            outbound,
            closed,
        } = connection;

        let shared = Arc::new(SessionShared {
            id: id.clone(),
            state: watch::Sender::new(SessionState::Open),
            pending: DashMap::new(),
            pending_count: watch::Sender::new(0),
            outbound,
            cancel: CancellationToken::new(),
            close_requested: CancellationToken::new(),
            close_reason: OnceLock::new(),
            next_id: AtomicI64::new(1),
            peer_pending: DashMap::new(),
            client: RwLock::new(None),
            initialized: AtomicBool::new(false),
            sink: sink.clone(),
        });
        sink.emit(Event::session_opened(id));

        let lane = Lane::new(options.dispatch, shared.clone(), dispatcher.clone());
        let handle = SessionHandle {
            shared: shared.clone(),
        };
        let session = Self {
            shared,
            inbound,
            closed,
            dispatcher,
            lane,
            drain_timeout: options.drain_timeout,
        };
        (session, handle)
    }

    /// Run until the session is `Closed`.
    pub async fn run(mut self) -> CloseReason {
        self.read_loop().await;
        self.close().await
    }

    async fn read_loop(&mut self) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shared.close_requested.cancelled() => return,
                frame = self.inbound.recv() => frame,
            };

            match frame {
                None => {
                    self.shared.request_close(CloseReason::PeerClosed);
                    return;
                }
                Some(Inbound::Failed(reason)) => {
                    self.shared.request_close(CloseReason::TransportFailed(reason));
                    return;
                }
                Some(Inbound::Malformed(e)) => match e.to_response() {
                    Some(response) => {
                        self.shared
                            .send_or(response.into(), self.shared.close_requested.cancelled())
                            .await
                    }
                    None => {
                        self.shared.request_close(CloseReason::ProtocolError(e.to_string()));
                        return;
                    }
                },
                Some(Inbound::Message(message)) => {
                    self.shared.transition(SessionState::Active);
                    self.handle_message(message).await;
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Request(request) if request.method == methods::SHUTDOWN => {
                info!("Session {}: shutdown requested", self.shared.id);
                self.shared
                    .send_or(
                        JsonRpcResponse::success(request.id, serde_json::json!({})).into(),
                        self.shared.close_requested.cancelled(),
                    )
                    .await;
                self.shared.request_close(CloseReason::ShutdownRequested);
            }
            Message::Request(request) => {
                match self.shared.insert_pending(request.id.clone(), &request.method) {
                    Some(cancel) => {
                        self.lane
                            .submit(Job::Request(request, cancel), &self.shared, &self.dispatcher);
                    }
                    None => {
                        warn!(
                            "Session {}: duplicate request id {}",
                            self.shared.id, request.id
                        );
                        let error = JsonRpcError::new(
                            ErrorKind::InvalidRequest,
                            format!("Request id {} is already outstanding", request.id),
                        );
                        self.shared
                            .send_or(
                                JsonRpcResponse::failure(request.id, error).into(),
                                self.shared.close_requested.cancelled(),
                            )
                            .await;
                    }
                }
            }
            Message::Notification(notification) if notification.method == methods::CANCELLED => {
                self.handle_cancelled(notification, self.shared.close_requested.cancelled())
                    .await;
            }
            Message::Notification(notification) => {
                self.lane
                    .submit(Job::Notification(notification), &self.shared, &self.dispatcher);
            }
            Message::Response(response) => self.shared.complete_peer_request(response),
        }
    }

    async fn handle_cancelled<F>(&self, notification: JsonRpcNotification, stop: F)
    where
        F: Future<Output = ()>,
    {
        let params = notification.params.unwrap_or(Value::Null);
        match serde_json::from_value::<CancelledParams>(params) {
            Ok(params) => {
                let reason = params.reason.as_deref().unwrap_or("cancelled by peer");
                if !self.shared.cancel_request(&params.request_id, reason, stop).await {
                    debug!(
                        "Session {}: cancel for unknown request {}",
                        self.shared.id, params.request_id
                    );
                }
            }
            Err(e) => {
                warn!("Session {}: invalid cancel notification: {}", self.shared.id, e);
                self.shared.sink.emit(Event::notification_failed(
                    self.shared.id.clone(),
                    methods::CANCELLED,
                    ErrorKind::InvalidParams,
                    e.to_string(),
                ));
            }
        }
    }

    /// Frames that arrive while draining: no new work is accepted.
    async fn handle_while_closing(&mut self, message: Message, deadline: tokio::time::Instant) {
        match message {
            Message::Request(request) => {
                self.shared
                    .send_or(
                        JsonRpcResponse::cancelled(request.id, "session is closing").into(),
                        sleep_until(deadline),
                    )
                    .await;
            }
            Message::Notification(notification) if notification.method == methods::CANCELLED => {
                self.handle_cancelled(notification, sleep_until(deadline)).await;
            }
            Message::Notification(notification) => {
                debug!(
                    "Session {}: ignoring {} while closing",
                    self.shared.id, notification.method
                );
            }
            Message::Response(response) => self.shared.complete_peer_request(response),
        }
    }

    async fn close(mut self) -> CloseReason {
        let reason = self.shared.close_reason();
        self.shared.transition(SessionState::Closing);
        info!("Session {} closing: {}", self.shared.id, reason);

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        if reason.drains() && *self.shared.pending_count.borrow() > 0 {
            self.drain(deadline).await;
        }

        self.shared.cancel_all("session closed", deadline).await;
        self.shared.cancel.cancel();
        self.shared.peer_pending.clear();
        self.shared.transition(SessionState::Closed);
        self.closed.cancel();
        info!("Session {} closed", self.shared.id);
        reason
    }

    async fn drain(&mut self, deadline: tokio::time::Instant) {
        let expired = sleep_until(deadline);
        tokio::pin!(expired);
        let mut count = self.shared.pending_count.subscribe();
        let mut inbound_open = true;

        loop {
            tokio::select! {
                biased;
                _ = &mut expired => {
                    warn!(
                        "Session {}: drain timeout of {:?} elapsed",
                        self.shared.id, self.drain_timeout
                    );
                    return;
                }
                _ = wait_idle(&mut count) => return,
                frame = self.inbound.recv(), if inbound_open => match frame {
                    Some(Inbound::Message(message)) => {
                        self.handle_while_closing(message, deadline).await
                    }
                    Some(Inbound::Malformed(e)) => {
                        if let Some(response) = e.to_response() {
                            self.shared.send_or(response.into(), sleep_until(deadline)).await;
                        }
                    }
                    Some(Inbound::Failed(_)) | None => inbound_open = false,
                },
            }
        }
    }
}

/// Server-side handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Number of requests still awaiting a response.
    pub fn pending(&self) -> usize {
        self.shared.pending.len()
    }

    /// A context for invoking a handler outside the session's own loop.
    pub fn context_for(&self, request_id: Option<RequestId>) -> RequestContext {
        RequestContext::new(&self.shared, request_id, self.shared.cancel.child_token())
    }

    /// Ask the session to close. Idempotent.
    pub fn close(&self) {
        self.shared.request_close(CloseReason::ServerShutdown);
    }

    /// Wait until the session reaches `Closed`.
    pub async fn wait_closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// Handler-facing handle for talking back to the session's client.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<SessionShared>,
}

impl Peer {
    pub fn session_id(&self) -> &SessionId {
        &self.shared.id
    }

    /// Send a notification to the client.
    pub async fn notify(&self, method: impl Into<String>, params: Option<Value>) -> Result<()> {
        self.deliver(JsonRpcNotification::new(method, params).into())
            .await
    }

    async fn deliver(&self, message: Message) -> Result<()> {
        tokio::select! {
            biased;
            sent = self.shared.outbound.send(message) => sent,
            _ = self.shared.cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Send a request to the client and wait for its response.
    ///
    /// Fails with [`Error::Cancelled`] if the session tears down first.
    pub async fn request(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        if self.shared.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.shared.peer_pending.insert(id.clone(), tx);

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self.deliver(request.into()).await {
            self.shared.peer_pending.remove(&id);
            return Err(e);
        }

        let response = tokio::select! {
            _ = self.shared.cancel.cancelled() => {
                self.shared.peer_pending.remove(&id);
                return Err(Error::Cancelled);
            }
            response = rx => response.map_err(|_| Error::Cancelled)?,
        };

        match response.error {
            Some(error) => Err(Error::handler(error.code, error.message)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Client identity recorded by `initialize`.
    pub fn client_info(&self) -> Option<ClientInfo> {
        self.shared.client.read().ok().and_then(|c| c.clone())
    }

    pub fn set_client_info(&self, info: ClientInfo) {
        if let Ok(mut client) = self.shared.client.write() {
            *client = Some(info);
        }
    }

    pub fn mark_initialized(&self) {
        self.shared.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }
}

/// Context handed to every handler invocation.
#[derive(Clone)]
pub struct RequestContext {
    pub session_id: SessionId,
    /// `None` for notifications.
    pub request_id: Option<RequestId>,
    /// Fired when the request is cancelled or the session tears down.
    pub cancel: CancellationToken,
    pub peer: Peer,
}

impl RequestContext {
    fn new(
        shared: &Arc<SessionShared>,
        request_id: Option<RequestId>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: shared.id.clone(),
            request_id,
            cancel,
            peer: Peer {
                shared: shared.clone(),
            },
        }
    }
}
