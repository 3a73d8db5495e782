//! Connection manager: one transport session to a collaboration endpoint.
//!
//! ```text
//!                connect()            SyncResponse
//! Disconnected ───────────► Connecting ───────────► Connected
//!      ▲                      │    ▲                    │
//!      │ teardown()           │    │ ReconnectDue       │ close / error /
//!      │ (from any state)     ▼    │ (backoff)          │ missed pongs
//!      └──────────────────── Error ◄────────────────────┘
//! ```
//!
//! The manager is driven by its owner's event loop through
//! [`ConnectionManager::next_event`], which is cancel-safe: every timer is a
//! stored deadline, every read is a channel receive. The only task it
//! spawns is a background transport open, which teardown aborts, so once
//! [`ConnectionManager::teardown`] returns no timer can fire.
//!
//! Reconnect delays follow `min(base * 2^attempt, cap)`. The attempt counter
//! resets only at a heartbeat tick of a connection that has stayed up for
//! at least one heartbeat interval.
//!
//! Reference: Kleppmann, Chapter 8: Unreliable Networks

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use uuid::Uuid;

use crate::config::CollabConfig;
use crate::protocol::{MessageType, SyncMessage};
use crate::transport::{Link, Transport, TransportError};

/// Heartbeat ticks without a pong before the link is declared dead.
const MAX_MISSED_PONGS: u32 = 2;

/// Connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events produced by [`ConnectionManager::next_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// State or measured latency changed.
    StatusChanged {
        state: ConnectionState,
        latency_ms: Option<u64>,
    },
    /// Message from the endpoint (pings and pongs are handled internally).
    Message(SyncMessage),
    /// Backoff elapsed; the owner should call `connect` with a fresh hello.
    ReconnectDue,
    /// Presence sweep period elapsed.
    SweepDue,
}

/// Everything about the current transport session.
#[derive(Default)]
pub struct ConnectionSession {
    pub state: ConnectionState,
    pub link: Option<Link>,
    pub last_ping_sent_at: Option<Instant>,
    pub measured_latency_ms: Option<u64>,
    pub reconnect_attempt: u32,
}

/// Owns one [`ConnectionSession`] and all of its timers.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    doc_id: Uuid,
    peer_id: Uuid,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
    handshake_timeout: Duration,
    config: CollabConfig,

    session: ConnectionSession,
    last_error: Option<TransportError>,
    /// Transport open started by `begin_connect`, with the hello to send.
    opening: Option<(JoinHandle<Result<Link, TransportError>>, SyncMessage)>,

    connected_since: Option<Instant>,
    handshake_deadline: Option<Instant>,
    heartbeat_at: Option<Instant>,
    sweep_at: Option<Instant>,
    reconnect_at: Option<Instant>,

    ping_nonce: u64,
    awaiting_pong: bool,
    missed_pongs: u32,

    outbox: VecDeque<ConnectionEvent>,
    torn_down: bool,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, doc_id: Uuid, peer_id: Uuid, config: &CollabConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            doc_id,
            peer_id,
            heartbeat_interval: config.heartbeat_interval(),
            sweep_interval: config.presence_sweep_interval(),
            handshake_timeout: config.handshake_timeout(),
            config: config.clone(),
            session: ConnectionSession::default(),
            last_error: None,
            opening: None,
            connected_since: None,
            handshake_deadline: None,
            heartbeat_at: None,
            sweep_at: None,
            reconnect_at: None,
            ping_nonce: 0,
            awaiting_pong: false,
            missed_pongs: 0,
            outbox: VecDeque::new(),
            torn_down: false,
        }
    }

    // ─── Commands ─────────────────────────────────────────────────────

    /// Open the transport and send `hello` (a `SyncRequest`).
    ///
    /// Valid from `Disconnected` and `Error`; a no-op while already
    /// connecting or connected. On failure the manager is left in `Error`
    /// with a reconnect scheduled.
    pub async fn connect(&mut self, hello: SyncMessage) -> Result<(), TransportError> {
        if self.torn_down {
            return Err(TransportError::TornDown);
        }
        if matches!(self.session.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Ok(());
        }
        self.start_connecting();
        let opened = open_within(self.transport.as_ref(), self.doc_id, self.handshake_timeout).await;
        self.finish_open(opened, hello)
    }

    /// Like [`connect`](Self::connect) but returns at once: the transport
    /// opens in the background and the handshake continues from
    /// [`next_event`](Self::next_event). A failed open surfaces there as a
    /// status change to `Error`.
    pub fn begin_connect(&mut self, hello: SyncMessage) -> Result<(), TransportError> {
        if self.torn_down {
            return Err(TransportError::TornDown);
        }
        if matches!(self.session.state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Ok(());
        }
        self.start_connecting();
        let transport = Arc::clone(&self.transport);
        let (doc_id, limit) = (self.doc_id, self.handshake_timeout);
        let task = tokio::spawn(async move { open_within(transport.as_ref(), doc_id, limit).await });
        self.opening = Some((task, hello));
        Ok(())
    }

    fn start_connecting(&mut self) {
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
        log::info!("Connecting to doc {} (attempt {})", self.doc_id, self.session.reconnect_attempt);
    }

    /// Send the hello over a freshly opened link and arm the handshake
    /// timeout.
    fn finish_open(
        &mut self,
        opened: Result<Link, TransportError>,
        hello: SyncMessage,
    ) -> Result<(), TransportError> {
        let link = match opened {
            Ok(link) => link,
            Err(e) => {
                self.fail(e.clone());
                return Err(e);
            }
        };
        if let Err(e) = link.send(hello) {
            link.close();
            self.fail(e.clone());
            return Err(e);
        }
        self.session.link = Some(link);
        self.handshake_deadline = Some(Instant::now() + self.handshake_timeout);
        Ok(())
    }

    /// Send a message over the established connection.
    pub fn send(&self, msg: SyncMessage) -> Result<(), TransportError> {
        if self.session.state != ConnectionState::Connected {
            return Err(TransportError::Closed);
        }
        match &self.session.link {
            Some(link) => link.send(msg),
            None => Err(TransportError::Closed),
        }
    }

    /// Close the connection without scheduling a reconnect. `connect` may
    /// be called again later.
    pub fn disconnect(&mut self) {
        if self.torn_down || self.session.state == ConnectionState::Disconnected {
            return;
        }
        self.close_link();
        self.clear_timers();
        self.set_state(ConnectionState::Disconnected);
        log::info!("Disconnected from doc {}", self.doc_id);
    }

    /// Stop for good: cancel every timer, close the link, end in
    /// `Disconnected`. No event is produced afterwards and `connect`
    /// fails with [`TransportError::TornDown`].
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.close_link();
        self.clear_timers();
        self.outbox.clear();
        self.session.state = ConnectionState::Disconnected;
        log::info!("Connection to doc {} torn down", self.doc_id);
    }

    // ─── Event loop ───────────────────────────────────────────────────

    /// Wait for the next connection event. Cancel-safe.
    ///
    /// Never resolves once torn down, or while idle with nothing scheduled.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        loop {
            if let Some(event) = self.outbox.pop_front() {
                return event;
            }
            if self.torn_down {
                std::future::pending::<()>().await;
            }

            let handshake = self.handshake_deadline;
            let heartbeat = self.heartbeat_at;
            let sweep = self.sweep_at;
            let reconnect = self.reconnect_at;
            let link = self.session.link.as_mut();
            let opening = self.opening.as_mut().map(|(task, _)| task);

            tokio::select! {
                msg = async move {
                    match link {
                        Some(link) => link.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Some(msg) => self.on_message(msg),
                        None => self.fail(TransportError::Closed),
                    }
                }

                opened = async move {
                    match opening {
                        Some(task) => task.await,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Some((_, hello)) = self.opening.take() {
                        let opened = opened
                            .unwrap_or_else(|e| Err(TransportError::Connect(e.to_string())));
                        // Failures are already recorded as an Error status.
                        let _ = self.finish_open(opened, hello);
                    }
                }

                _ = wait_for(handshake) => {
                    self.fail(TransportError::HandshakeTimeout);
                }

                _ = wait_for(heartbeat) => {
                    self.on_heartbeat();
                }

                _ = wait_for(sweep) => {
                    self.sweep_at = Some(Instant::now() + self.sweep_interval);
                    return ConnectionEvent::SweepDue;
                }

                _ = wait_for(reconnect) => {
                    self.reconnect_at = None;
                    return ConnectionEvent::ReconnectDue;
                }
            }
        }
    }

    fn on_message(&mut self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::Pong => {
                self.missed_pongs = 0;
                if self.awaiting_pong && msg.clock == self.ping_nonce {
                    self.awaiting_pong = false;
                    if let Some(sent) = self.session.last_ping_sent_at {
                        let latency = Instant::now().saturating_duration_since(sent).as_millis() as u64;
                        self.session.measured_latency_ms = Some(latency);
                        log::trace!("Heartbeat latency {latency}ms");
                        self.push_status();
                    }
                }
            }
            MessageType::Ping => {
                if let Some(link) = &self.session.link {
                    let _ = link.send(SyncMessage::pong(self.peer_id, &msg));
                }
            }
            MessageType::SyncResponse if self.session.state == ConnectionState::Connecting => {
                let now = Instant::now();
                self.handshake_deadline = None;
                self.connected_since = Some(now);
                self.heartbeat_at = Some(now + self.heartbeat_interval);
                self.sweep_at = Some(now + self.sweep_interval);
                self.awaiting_pong = false;
                self.missed_pongs = 0;
                self.set_state(ConnectionState::Connected);
                log::info!("Handshake complete for doc {}", self.doc_id);
                self.outbox.push_back(ConnectionEvent::Message(msg));
            }
            _ => self.outbox.push_back(ConnectionEvent::Message(msg)),
        }
    }

    fn on_heartbeat(&mut self) {
        let now = Instant::now();
        if let Some(since) = self.connected_since {
            if now.saturating_duration_since(since) >= self.heartbeat_interval
                && self.session.reconnect_attempt != 0
            {
                log::debug!("Connection stable, resetting backoff");
                self.session.reconnect_attempt = 0;
            }
        }

        if self.awaiting_pong {
            self.missed_pongs += 1;
            if self.missed_pongs >= MAX_MISSED_PONGS {
                self.fail(TransportError::LivenessTimeout);
                return;
            }
        }

        self.ping_nonce += 1;
        let ping = SyncMessage::ping(self.peer_id, self.doc_id, self.ping_nonce);
        let sent = match &self.session.link {
            Some(link) => link.send(ping),
            None => Err(TransportError::Closed),
        };
        if let Err(e) = sent {
            self.fail(e);
            return;
        }
        self.awaiting_pong = true;
        self.session.last_ping_sent_at = Some(now);
        self.heartbeat_at = Some(now + self.heartbeat_interval);
    }

    /// Transport failure: close, go to `Error`, schedule a reconnect.
    fn fail(&mut self, error: TransportError) {
        if self.torn_down {
            return;
        }
        self.close_link();
        self.clear_timers();
        let delay = self.config.backoff_delay(self.session.reconnect_attempt);
        self.session.reconnect_attempt = self.session.reconnect_attempt.saturating_add(1);
        self.reconnect_at = Some(Instant::now() + delay);
        log::warn!(
            "Connection to doc {} failed: {error}; retrying in {}ms",
            self.doc_id,
            delay.as_millis()
        );
        self.last_error = Some(error);
        self.set_state(ConnectionState::Error);
    }

    fn close_link(&mut self) {
        if let Some((task, _)) = self.opening.take() {
            task.abort();
        }
        if let Some(link) = self.session.link.take() {
            link.close();
        }
    }

    fn clear_timers(&mut self) {
        self.connected_since = None;
        self.handshake_deadline = None;
        self.heartbeat_at = None;
        self.sweep_at = None;
        self.reconnect_at = None;
        self.awaiting_pong = false;
        self.missed_pongs = 0;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.session.state == state {
            return;
        }
        self.session.state = state;
        if state != ConnectionState::Connected {
            self.session.measured_latency_ms = None;
        }
        self.push_status();
    }

    fn push_status(&mut self) {
        self.outbox.push_back(ConnectionEvent::StatusChanged {
            state: self.session.state,
            latency_ms: self.session.measured_latency_ms,
        });
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.session.state
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.session.measured_latency_ms
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.session.reconnect_attempt
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Whether a reconnect is scheduled.
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }
}

async fn open_within<T: Transport>(
    transport: &T,
    doc_id: Uuid,
    limit: Duration,
) -> Result<Link, TransportError> {
    timeout(limit, transport.open(doc_id))
        .await
        .unwrap_or(Err(TransportError::HandshakeTimeout))
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
