//! MCP transport layer.
//!
//! A [`Transport`] produces [`Connection`]s. Each connection is one logical
//! session: an inbound channel of decoded frames and an ordered outbound
//! handle. Two bindings exist: [`StdioTransport`] (newline-delimited JSON on
//! the process's standard streams) and the streaming HTTP transport in
//! [`crate::http`].

pub mod stdio;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mcp::codec::DecodeError;
use crate::mcp::protocol::Message;
use crate::mcp::session::SessionId;

pub use stdio::StdioTransport;

/// Default capacity of per-session message channels.
pub const CHANNEL_CAPACITY: usize = 256;

/// One frame received from a peer.
#[derive(Debug)]
pub enum Inbound {
    /// A well-formed message.
    Message(Message),
    /// A frame that failed to decode.
    Malformed(DecodeError),
    /// The transport failed; no further frames will arrive.
    Failed(String),
}

/// Sending half of a session's outbound stream.
///
/// Messages sent through one `Outbound` reach the peer in send order.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Message>,
}

impl Outbound {
    /// Queue a message for the peer. Suspends while the queue is full.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Send("peer stream is closed".to_string()))
    }

    /// Whether the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a session's outbound stream, drained by a writer.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
}

impl OutboundQueue {
    /// Next message to write, or `None` once the session has closed and
    /// everything queued before that has been handed out.
    pub async fn next(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            message = self.rx.recv() => message,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }
}

/// Create an ordered outbound channel tied to a session's `closed` token.
pub fn outbound_channel(capacity: usize, closed: CancellationToken) -> (Outbound, OutboundQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    (Outbound { tx }, OutboundQueue { rx, closed })
}

/// A logical connection handed to the server by a transport.
#[derive(Debug)]
pub struct Connection {
    pub id: SessionId,
    pub inbound: mpsc::Receiver<Inbound>,
    pub outbound: Outbound,
    /// Fired by the session once it reaches `Closed`.
    pub closed: CancellationToken,
}

impl Connection {
    /// Build a connection and the transport-side ends of its channels.
    pub fn pair(id: SessionId, capacity: usize) -> (Self, mpsc::Sender<Inbound>, OutboundQueue) {
        let closed = CancellationToken::new();
        let (inbound_tx, inbound) = mpsc::channel(capacity);
        let (outbound, queue) = outbound_channel(capacity, closed.clone());
        (
            Self {
                id,
                inbound,
                outbound,
                closed,
            },
            inbound_tx,
            queue,
        )
    }
}

/// A transport binding.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next logical connection. `None` means this transport
    /// will produce no more.
    async fn accept(&self) -> Option<Connection>;

    /// Stop accepting new connections.
    async fn shutdown(&self);

    /// Called once every session has closed. Reports a fatal transport error,
    /// if one occurred.
    async fn finish(&self) -> Result<()>;
}
