//! Transports: how a session reaches a collaboration endpoint.
//!
//! A [`Link`] is one open duplex channel of [`SyncMessage`]s. The connection
//! manager owns at most one link at a time and closes it exactly once by
//! consuming it.
//!
//! ```text
//! ConnectionManager ──► Transport::open(doc_id) ──► Link
//!                                                    │
//!                          ┌─────────────────────────┴──────────────┐
//!                          ▼                                        ▼
//!                  WebSocketTransport                        MemoryTransport
//!            (writer task ◄─ mpsc, reader task ─► mpsc)   (back-to-back channels)
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Transport-level failures. All of them are recoverable by reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Endpoint could not be reached.
    Connect(String),
    /// Link closed by the remote side or after a socket error.
    Closed,
    /// No sync response within the handshake timeout.
    HandshakeTimeout,
    /// Heartbeat pongs stopped arriving.
    LivenessTimeout,
    /// Connection manager was torn down.
    TornDown,
    Protocol(ProtocolError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "Connect failed: {e}"),
            Self::Closed => write!(f, "Connection closed"),
            Self::HandshakeTimeout => write!(f, "Handshake timeout"),
            Self::LivenessTimeout => write!(f, "Heartbeat timeout"),
            Self::TornDown => write!(f, "Connection manager torn down"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Opens links to a collaboration endpoint.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, doc_id: Uuid) -> impl Future<Output = Result<Link, TransportError>> + Send;
}

/// One open duplex message channel.
///
/// Dropping a link aborts its I/O tasks; [`Link::close`] lets queued
/// outgoing messages drain first.
pub struct Link {
    outgoing: mpsc::UnboundedSender<SyncMessage>,
    incoming: mpsc::UnboundedReceiver<SyncMessage>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Link {
    /// Two links connected back to back, in process.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outgoing: a_tx,
                incoming: b_rx,
                reader: None,
                writer: None,
            },
            Link {
                outgoing: b_tx,
                incoming: a_rx,
                reader: None,
                writer: None,
            },
        )
    }

    /// Wrap an established WebSocket.
    ///
    /// Spawns a writer task fed by the outgoing channel and a reader task
    /// that decodes binary frames. Undecodable frames are logged and
    /// skipped; a close frame or socket error ends the link.
    pub fn websocket<S>(ws: WebSocketStream<S>) -> Link
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_writer, mut ws_reader) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SyncMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SyncMessage>();

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let encoded = match msg.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::warn!("Dropping unencodable message: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
            let _ = ws_writer.close().await;
        });

        // Reader task: decode incoming frames
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        match SyncMessage::decode(&data) {
                            Ok(msg) => {
                                if in_tx.send(msg).is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::debug!("WebSocket read error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        });

        Link {
            outgoing: out_tx,
            incoming: in_rx,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// Queue a message for sending.
    pub fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        self.outgoing.send(msg).map_err(|_| TransportError::Closed)
    }

    /// Next incoming message; `None` once the link is closed.
    ///
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        self.incoming.recv().await
    }

    /// Close the link. Messages already queued are still flushed.
    pub fn close(mut self) {
        // The writer ends by itself once the outgoing sender drops with `self`.
        self.writer.take();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// WebSocket
// ───────────────────────────────────────────────────────────────────

/// Connects to a relay at `{url}/{doc_id}`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, doc_id: Uuid) -> impl Future<Output = Result<Link, TransportError>> + Send {
        let url = format!("{}/{}", self.url, doc_id);
        async move {
            let (ws, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            log::debug!("WebSocket open to {url}");
            Ok(Link::websocket(ws))
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// In-process
// ───────────────────────────────────────────────────────────────────

struct MemoryInner {
    acceptor: mpsc::UnboundedSender<(Uuid, Link)>,
    fail_next: u32,
    opened: u32,
}

/// In-process transport. Every successful `open` hands the far end of a
/// [`Link::pair`] to the paired [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryInner>>,
}

/// Accepting side of a [`MemoryTransport`].
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<(Uuid, Link)>,
}

impl MemoryListener {
    /// Next opened link and the document it was opened for.
    pub async fn accept(&mut self) -> Option<(Uuid, Link)> {
        self.rx.recv().await
    }

    /// Non-blocking accept.
    pub fn try_accept(&mut self) -> Option<(Uuid, Link)> {
        self.rx.try_recv().ok()
    }
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                acceptor: tx,
                fail_next: 0,
                opened: 0,
            })),
        };
        (transport, MemoryListener { rx })
    }

    /// Make the next `n` opens fail with a connect error.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next = n;
        }
    }

    /// Number of open attempts so far, failed ones included.
    pub fn open_count(&self) -> u32 {
        self.inner.lock().map(|i| i.opened).unwrap_or(0)
    }

    fn open_now(&self, doc_id: Uuid) -> Result<Link, TransportError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TransportError::Connect("transport poisoned".into()))?;
        inner.opened += 1;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(TransportError::Connect("endpoint unreachable".into()));
        }
        let (near, far) = Link::pair();
        inner
            .acceptor
            .send((doc_id, far))
            .map_err(|_| TransportError::Connect("no listener".into()))?;
        Ok(near)
    }
}

impl Transport for MemoryTransport {
    fn open(&self, doc_id: Uuid) -> impl Future<Output = Result<Link, TransportError>> + Send {
        let result = self.open_now(doc_id);
        async move { result }
    }
}
