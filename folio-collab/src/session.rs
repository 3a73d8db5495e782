//! Collaboration session: one document being edited by one local user.
//!
//! ```text
//!  SessionHandle ── Command ──► ┌──────────── session loop ─────────────┐
//!  (insert, delete,             │ Replica            AwarenessStore     │
//!   set_presence, stop, ...)    │ ConnectionManager  AutoSaveScheduler  │
//!                               └──────┬──────────────────────┬─────────┘
//!                                      │ SessionObserver      │
//!                                      ▼ callbacks            ▼
//!                               on_document_changed    on_save_status
//!                               on_presence_changed    on_connection_status
//! ```
//!
//! Everything mutable lives in one spawned task and is only touched from
//! its `select!` loop, so replica mutations never interleave. The handle
//! talks to it over a command channel.
//!
//! Collaboration is additive: when the endpoint cannot be reached the
//! session keeps editing offline and the connection manager retries with
//! backoff. Operations made meanwhile reach the endpoint through the
//! handshake diff once it answers.
//!
//! Reference: Kleppmann, Chapter 5: Replication

use std::sync::Arc;
use std::time::SystemTime;

use folio_core::{ActorId, MergeResult, Operation, Replica, ReplicaError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::autosave::{AutoSaveScheduler, SaveEvent, SaveState};
use crate::awareness::{AwarenessMessage, AwarenessStore, Identity, PeerPresence, PresenceField};
use crate::config::CollabConfig;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::protocol::{MessageType, SyncMessage, SyncPayload};
use crate::storage::PersistenceBackend;
use crate::transport::Transport;

/// Passive observation callbacks. All methods default to no-ops.
///
/// Called from the session task; implementations should return quickly.
pub trait SessionObserver: Send + Sync {
    fn on_document_changed(&self, _text: &str) {}
    fn on_presence_changed(&self, _peers: &[PeerPresence]) {}
    fn on_connection_status(&self, _state: ConnectionState, _latency_ms: Option<u64>) {}
    fn on_save_status(&self, _state: SaveState, _last_saved_at: Option<SystemTime>) {}
}

/// Observer callbacks as a stream of values.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DocumentChanged(String),
    PresenceChanged(Vec<PeerPresence>),
    ConnectionStatus {
        state: ConnectionState,
        latency_ms: Option<u64>,
    },
    SaveStatus {
        state: SaveState,
        last_saved_at: Option<SystemTime>,
    },
}

/// Observer that forwards every callback into a channel.
pub struct EventChannel {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: SessionEvent) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl SessionObserver for EventChannel {
    fn on_document_changed(&self, text: &str) {
        self.forward(SessionEvent::DocumentChanged(text.to_string()));
    }

    fn on_presence_changed(&self, peers: &[PeerPresence]) {
        self.forward(SessionEvent::PresenceChanged(peers.to_vec()));
    }

    fn on_connection_status(&self, state: ConnectionState, latency_ms: Option<u64>) {
        self.forward(SessionEvent::ConnectionStatus { state, latency_ms });
    }

    fn on_save_status(&self, state: SaveState, last_saved_at: Option<SystemTime>) {
        self.forward(SessionEvent::SaveStatus {
            state,
            last_saved_at,
        });
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The session has been stopped.
    Stopped,
    /// A local edit was rejected.
    Edit(ReplicaError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Session stopped"),
            Self::Edit(e) => write!(f, "Edit rejected: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ReplicaError> for SessionError {
    fn from(e: ReplicaError) -> Self {
        Self::Edit(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

/// A collaboration session that has not started yet.
pub struct CollaborationSession<T: Transport, B: PersistenceBackend> {
    config: CollabConfig,
    identity: Identity,
    doc_id: Uuid,
    transport: T,
    backend: Arc<B>,
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl<T: Transport, B: PersistenceBackend> CollaborationSession<T, B> {
    pub fn new(
        config: CollabConfig,
        identity: Identity,
        doc_id: Uuid,
        transport: T,
        backend: Arc<B>,
    ) -> Self {
        Self {
            config,
            identity,
            doc_id,
            transport,
            backend,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    /// Hydrate, connect and spawn the session loop.
    ///
    /// Never fails: a missing or unreadable snapshot starts an empty
    /// document, and an unreachable endpoint starts the session offline.
    pub async fn start(self) -> SessionHandle {
        let Self {
            config,
            identity,
            doc_id,
            transport,
            backend,
            observers,
        } = self;
        let peer_id = identity.peer_id;

        let replica = hydrate(backend.as_ref(), doc_id).await;
        let awareness = AwarenessStore::new(&identity, config.presence_timeout());
        let connection = ConnectionManager::new(transport, doc_id, peer_id, &config);
        let autosave = AutoSaveScheduler::new(backend, doc_id, &config);

        let mut core = SessionCore {
            doc_id,
            peer_id,
            replica,
            awareness,
            connection,
            autosave,
            observers,
            last_revision: 0,
        };
        core.emit_document();

        let hello = core.hello();
        if let Err(e) = core.connection.connect(hello).await {
            log::warn!("Session {doc_id} starting offline: {e}");
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(core.run(cmd_rx));
        log::info!("Session started for document {doc_id} as {peer_id}");

        SessionHandle {
            doc_id,
            peer_id,
            cmd_tx,
            task: Some(task),
        }
    }
}

async fn hydrate<B: PersistenceBackend>(backend: &B, doc_id: Uuid) -> Replica {
    // A fresh actor per session keeps operation ids unique across sessions
    // of the same user.
    let actor = ActorId::random();
    match backend.load(doc_id).await {
        Ok(Some(bytes)) => match Replica::from_snapshot(actor, &bytes) {
            Ok(replica) => {
                log::info!("Hydrated {doc_id} ({} chars)", replica.len());
                replica
            }
            Err(e) => {
                log::warn!("Stored snapshot of {doc_id} unusable, starting empty: {e}");
                Replica::new(actor)
            }
        },
        Ok(None) => Replica::new(actor),
        Err(e) => {
            log::warn!("Loading {doc_id} failed, starting empty: {e}");
            Replica::new(actor)
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

enum Command {
    Insert {
        index: usize,
        text: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Delete {
        index: usize,
        count: usize,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetPresence(Vec<PresenceField>),
    SaveNow,
    Text(oneshot::Sender<String>),
    Peers(oneshot::Sender<Vec<PeerPresence>>),
    ConnectionStatus(oneshot::Sender<(ConnectionState, Option<u64>)>),
    SaveStatus(oneshot::Sender<(SaveState, Option<SystemTime>)>),
    Stop(oneshot::Sender<()>),
}

/// Caller's handle on a running session.
///
/// Dropping the handle stops the session the same way [`stop`] does, but
/// without waiting for it.
///
/// [`stop`]: SessionHandle::stop
pub struct SessionHandle {
    doc_id: Uuid,
    peer_id: Uuid,
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Insert `text` at visible position `index`.
    pub async fn insert(&self, index: usize, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::Insert { index, text, reply }).await?
    }

    /// Delete `count` visible characters starting at `index`.
    pub async fn delete(&self, index: usize, count: usize) -> Result<(), SessionError> {
        self.request(|reply| Command::Delete {
            index,
            count,
            reply,
        })
        .await?
    }

    /// Update local presence fields and broadcast them immediately.
    pub fn set_presence(&self, fields: Vec<PresenceField>) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::SetPresence(fields))
            .map_err(|_| SessionError::Stopped)
    }

    /// Save now instead of waiting for the debounce.
    pub fn save_now(&self) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::SaveNow)
            .map_err(|_| SessionError::Stopped)
    }

    pub async fn text(&self) -> Result<String, SessionError> {
        self.request(Command::Text).await
    }

    /// Remote peers currently present.
    pub async fn peers(&self) -> Result<Vec<PeerPresence>, SessionError> {
        self.request(Command::Peers).await
    }

    pub async fn connection_state(&self) -> Result<(ConnectionState, Option<u64>), SessionError> {
        self.request(Command::ConnectionStatus).await
    }

    pub async fn save_state(&self) -> Result<(SaveState, Option<SystemTime>), SessionError> {
        self.request(Command::SaveStatus).await
    }

    /// Tear down the connection, then flush unsaved changes.
    ///
    /// Once this returns no observer callback, network traffic or save
    /// happens for this session.
    pub async fn stop(mut self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop(tx))
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)?;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }
}

// ───────────────────────────────────────────────────────────────────
// Loop
// ───────────────────────────────────────────────────────────────────

struct SessionCore<T: Transport, B: PersistenceBackend> {
    doc_id: Uuid,
    peer_id: Uuid,
    replica: Replica,
    awareness: AwarenessStore,
    connection: ConnectionManager<T>,
    autosave: AutoSaveScheduler<B>,
    observers: Vec<Arc<dyn SessionObserver>>,
    /// Replica revision last reported to observers.
    last_revision: u64,
}

impl<T: Transport, B: PersistenceBackend> SessionCore<T, B> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Stop(reply)) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            return;
                        }
                        Some(cmd) => self.on_command(cmd),
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }

                event = self.connection.next_event() => {
                    self.on_connection_event(event);
                }

                event = self.autosave.next_event() => {
                    self.on_save_event(event);
                }
            }
        }
    }

    fn hello(&self) -> SyncMessage {
        SyncMessage::sync_request(self.peer_id, self.doc_id, self.replica.state_vector())
    }

    // ─── Commands ─────────────────────────────────────────────────────

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Insert { index, text, reply } => {
                let result = self.replica.insert(index, &text);
                let _ = reply.send(self.after_local_edit(result));
            }
            Command::Delete {
                index,
                count,
                reply,
            } => {
                let result = self.replica.delete(index, count);
                let _ = reply.send(self.after_local_edit(result));
            }
            Command::SetPresence(fields) => {
                let msg = self.awareness.set_local(fields);
                self.send_awareness(&msg);
            }
            Command::SaveNow => self.autosave.trigger_manual(),
            Command::Text(reply) => {
                let _ = reply.send(self.replica.text());
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.awareness.list());
            }
            Command::ConnectionStatus(reply) => {
                let _ = reply.send((self.connection.state(), self.connection.latency_ms()));
            }
            Command::SaveStatus(reply) => {
                let _ = reply.send((self.autosave.state(), self.autosave.last_saved_at()));
            }
            // Handled by the loop.
            Command::Stop(_) => {}
        }
    }

    fn after_local_edit(
        &mut self,
        result: Result<Operation, ReplicaError>,
    ) -> Result<(), SessionError> {
        let op = result?;
        let clock = op.last_clock();
        // Offline edits reach the endpoint through the next handshake diff.
        if self.connection.state() == ConnectionState::Connected {
            let msg = SyncMessage::ops(self.peer_id, self.doc_id, clock, vec![op]);
            if let Err(e) = self.connection.send(msg) {
                log::debug!("Update not sent, will resync: {e}");
            }
        }
        self.autosave.notify_mutation();
        self.emit_document();
        Ok(())
    }

    // ─── Connection events ────────────────────────────────────────────

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StatusChanged { state, latency_ms } => {
                for obs in &self.observers {
                    obs.on_connection_status(state, latency_ms);
                }
                if matches!(state, ConnectionState::Error | ConnectionState::Disconnected)
                    && self.awareness.clear_remote()
                {
                    self.emit_presence();
                }
            }
            ConnectionEvent::Message(msg) => self.on_message(msg),
            ConnectionEvent::ReconnectDue => {
                // Opens in the background so commands keep flowing while the
                // endpoint is slow to answer.
                let hello = self.hello();
                if let Err(e) = self.connection.begin_connect(hello) {
                    log::warn!("Reconnect to {} failed: {e}", self.doc_id);
                }
            }
            ConnectionEvent::SweepDue => {
                if !self.awareness.sweep(Instant::now()).is_empty() {
                    self.emit_presence();
                }
                let renewal = self.awareness.renewal();
                self.send_awareness(&renewal);
            }
        }
    }

    fn on_message(&mut self, msg: SyncMessage) {
        if msg.doc_id != self.doc_id {
            log::warn!("Ignoring message for foreign document {}", msg.doc_id);
            return;
        }
        match msg.msg_type {
            MessageType::SyncResponse => match msg.sync_response_body() {
                Ok(body) => {
                    self.merge_payload(body.content);
                    self.send_missing(&body.state_vector);
                    let join = self.awareness.join_message();
                    self.send_awareness(&join);
                }
                Err(e) => log::warn!("Bad sync response: {e}"),
            },
            MessageType::Update => match msg.update_payload() {
                Ok(payload) => {
                    let buffered = self.merge_payload(payload);
                    if buffered {
                        // Something between us and the sender is missing.
                        let _ = self.connection.send(self.hello());
                    }
                }
                Err(e) => log::warn!("Bad update from {}: {e}", msg.peer_id),
            },
            MessageType::Awareness => match msg.awareness_message() {
                Ok(aw) => {
                    let is_join = matches!(aw, AwarenessMessage::Join { .. });
                    if self.awareness.handle_message(aw, Instant::now()) {
                        self.emit_presence();
                    }
                    if is_join {
                        let announce = self.awareness.announce();
                        self.send_awareness(&announce);
                    }
                }
                Err(e) => log::warn!("Bad awareness message from {}: {e}", msg.peer_id),
            },
            MessageType::PeerLeft => {
                if self.awareness.remove(&msg.peer_id) {
                    self.emit_presence();
                }
            }
            other => log::debug!("Ignoring {other:?} from {}", msg.peer_id),
        }
    }

    /// Merge remote content. Returns whether operations were left waiting
    /// for dependencies.
    fn merge_payload(&mut self, payload: SyncPayload) -> bool {
        let result = match payload {
            SyncPayload::Ops(ops) => self.replica.merge_remote(ops),
            SyncPayload::Snapshot(bytes) => match self.replica.merge_snapshot(&bytes) {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("Dropping remote snapshot: {e}");
                    MergeResult::default()
                }
            },
        };
        if !result.applied.is_empty() {
            self.autosave.notify_mutation();
            self.emit_document();
        }
        result.buffered > 0
    }

    /// Send the endpoint whatever its state vector says it lacks.
    fn send_missing(&mut self, remote: &folio_core::StateVector) {
        let payload = match self.replica.diff_since(remote) {
            Ok(ops) if ops.is_empty() => return,
            Ok(ops) => SyncPayload::Ops(ops),
            Err(ReplicaError::ResyncRequired { .. }) => SyncPayload::Snapshot(self.replica.snapshot()),
            Err(e) => {
                log::warn!("Cannot diff against endpoint: {e}");
                return;
            }
        };
        let clock = self.replica.state_vector().get(&self.replica.actor());
        let msg = SyncMessage::update(self.peer_id, self.doc_id, clock, &payload);
        if let Err(e) = self.connection.send(msg) {
            log::debug!("Catch-up update not sent: {e}");
        }
    }

    fn send_awareness(&self, msg: &AwarenessMessage) {
        if self.connection.state() != ConnectionState::Connected {
            return;
        }
        let wire = SyncMessage::awareness(self.peer_id, self.doc_id, msg);
        if let Err(e) = self.connection.send(wire) {
            log::trace!("Awareness not sent: {e}");
        }
    }

    // ─── Save events ──────────────────────────────────────────────────

    fn on_save_event(&mut self, event: SaveEvent) {
        match event {
            SaveEvent::Due(_) => self.autosave.start(self.replica.snapshot()),
            SaveEvent::StatusChanged {
                state,
                last_saved_at,
            } => {
                for obs in &self.observers {
                    obs.on_save_status(state, last_saved_at);
                }
            }
        }
    }

    // ─── Shutdown ─────────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        let leave = self.awareness.leave_message();
        self.send_awareness(&leave);
        self.connection.teardown();

        let result = self.autosave.flush_and_wait(self.replica.snapshot()).await;
        if let Err(e) = &result {
            log::error!("Session {} stopped with unsaved changes: {e}", self.doc_id);
        }
        for obs in &self.observers {
            obs.on_save_status(self.autosave.state(), self.autosave.last_saved_at());
        }
        self.observers.clear();
        log::info!("Session stopped for document {}", self.doc_id);
    }

    // ─── Observers ────────────────────────────────────────────────────

    fn emit_document(&mut self) {
        let revision = self.replica.revision();
        if revision == self.last_revision && revision != 0 {
            return;
        }
        self.last_revision = revision;
        let text = self.replica.text();
        for obs in &self.observers {
            obs.on_document_changed(&text);
        }
    }

    fn emit_presence(&self) {
        let peers = self.awareness.list();
        for obs in &self.observers {
            obs.on_presence_changed(&peers);
        }
    }
}
