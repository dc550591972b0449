//! Stdio transport: newline-delimited JSON on standard input/output.
//!
//! Exactly one session per process. Reading stops at end of input, at an
//! I/O error, at an over-long frame, or at a frame that cannot be decoded
//! and carries no usable id.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, Stdin, Stdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::mcp::codec;
use crate::mcp::session::SessionId;
use crate::mcp::transport::{Connection, Inbound, OutboundQueue, Transport, CHANNEL_CAPACITY};

/// Default maximum frame length (4 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// How long `finish` waits for queued output to be written.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Stdio transport for MCP, generic over the stream pair for testing.
pub struct StdioTransport<R, W> {
    io: Mutex<Option<(R, W)>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    fatal: Arc<Mutex<Option<String>>>,
    max_frame_bytes: usize,
}

impl StdioTransport<Stdin, Stdout> {
    /// Create a stdio transport on the process's standard streams.
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport<Stdin, Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Create a stream transport over an arbitrary reader/writer pair.
    pub fn with_io(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new(Some((reader, writer))),
            writer: Mutex::new(None),
            fatal: Arc::new(Mutex::new(None)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Set the maximum accepted frame length in bytes.
    pub fn max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    fn take_io(&self) -> Option<(R, W)> {
        self.io.lock().ok().and_then(|mut io| io.take())
    }
}

fn record_fatal(slot: &Mutex<Option<String>>, reason: String) {
    if let Ok(mut slot) = slot.lock() {
        slot.get_or_insert(reason);
    }
}

async fn read_frames<R>(
    reader: R,
    max_frame_bytes: usize,
    tx: mpsc::Sender<Inbound>,
    closed: CancellationToken,
    fatal: Arc<Mutex<Option<String>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes));

    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = frames.next() => frame,
        };

        let line = match frame {
            None => {
                debug!("EOF on stdin, stopping transport");
                break;
            }
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                let reason = format!("frame exceeds {} bytes", max_frame_bytes);
                error!("Stdin {}", reason);
                record_fatal(&fatal, reason.clone());
                let _ = tx.send(Inbound::Failed(reason)).await;
                break;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                error!("Error reading stdin: {}", e);
                record_fatal(&fatal, e.to_string());
                let _ = tx.send(Inbound::Failed(e.to_string())).await;
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        trace!("Received: {}", trimmed);

        let (inbound, unrecoverable) = match codec::decode(trimmed.as_bytes()) {
            Ok(message) => (Inbound::Message(message), false),
            Err(e) => {
                warn!("Failed to decode frame: {}", e);
                let unrecoverable = e.id.is_none();
                if unrecoverable {
                    record_fatal(&fatal, format!("unrecoverable decode error: {}", e));
                }
                (Inbound::Malformed(e), unrecoverable)
            }
        };

        if tx.send(inbound).await.is_err() || unrecoverable {
            break;
        }
    }
}

async fn write_frames<W>(writer: W, mut queue: OutboundQueue, fatal: Arc<Mutex<Option<String>>>)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());

    while let Some(message) = queue.next().await {
        let line = match codec::encode_to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                error!("Error serializing message: {}", e);
                continue;
            }
        };
        trace!("Sending: {}", line);
        if let Err(e) = sink.send(line).await {
            error!("Error writing to stdout: {}", e);
            record_fatal(&fatal, format!("stdout write failed: {}", e));
            break;
        }
    }
    debug!("Stdout writer stopped");
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn accept(&self) -> Option<Connection> {
        let (reader, writer) = self.take_io()?;
        let (connection, inbound_tx, queue) = Connection::pair(SessionId::stdio(), CHANNEL_CAPACITY);

        tokio::spawn(read_frames(
            reader,
            self.max_frame_bytes,
            inbound_tx,
            connection.closed.clone(),
            self.fatal.clone(),
        ));
        let writer = tokio::spawn(write_frames(writer, queue, self.fatal.clone()));
        if let Ok(mut slot) = self.writer.lock() {
            *slot = Some(writer);
        }

        Some(connection)
    }

    async fn shutdown(&self) {
        // An unaccepted stream pair is simply dropped.
        let _ = self.take_io();
    }

    async fn finish(&self) -> Result<()> {
        let writer = self.writer.lock().ok().and_then(|mut w| w.take());
        if let Some(writer) = writer {
            // Everything queued before the session closed is flushed first.
            if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
                warn!("Stdout writer did not finish within {:?}", WRITER_FLUSH_TIMEOUT);
            }
        }

        let fatal = self.fatal.lock().ok().and_then(|slot| slot.clone());
        match fatal {
            Some(reason) => Err(Error::Transport(reason)),
            None => Ok(()),
        }
    }
}
