//! Relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── Replica ── BroadcastGroup
//! Client B ──┘                        │
//!                                     ├── RocksSnapshotStore
//!                                     │     (snapshot when the room empties)
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! Each document room maintains:
//! - A [`Replica`] holding the authoritative merged state
//! - A [`BroadcastGroup`] for fan-out to connected peers
//!
//! A connection joins a room with its first `SyncRequest` and is answered
//! with exactly the operations it lacks, or the full snapshot when the
//! room's log was compacted past its state vector. Updates are merged into
//! the room replica and relayed; awareness is relayed untouched.
//!
//! The server speaks [`Link`]s, so the same loop serves WebSocket clients
//! ([`SyncServer::serve`]) and in-process ones ([`SyncServer::serve_memory`]).
//!
//! Reference: Kleppmann: Designing Data-Intensive Applications, Chapters 5 & 8

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use folio_core::{ActorId, MergeResult, Replica, ReplicaError, StateVector};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::AwarenessMessage;
use crate::broadcast::{BroadcastGroup, Relayed};
use crate::protocol::{MessageType, SyncMessage, SyncPayload, SyncResponse};
use crate::storage::{PersistenceBackend, RocksSnapshotStore, StoreConfig, StoreError};
use crate::transport::{Link, MemoryListener};

/// Environment variable overriding the bind address.
pub const ENV_BIND_ADDR: &str = "FOLIO_BIND_ADDR";
/// Environment variable enabling persistence at a path.
pub const ENV_STORAGE_PATH: &str = "FOLIO_STORAGE_PATH";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Fold a room's operation log once it grows past this many operations
    pub compact_threshold: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            compact_threshold: 10_000,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `FOLIO_BIND_ADDR` and `FOLIO_STORAGE_PATH`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var(ENV_STORAGE_PATH) {
            if !path.is_empty() {
                config.storage_path = Some(PathBuf::from(path));
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub relayed_updates: u64,
    pub active_rooms: usize,
    pub persisted_snapshots: u64,
}

/// Document room: authoritative replica + broadcast group.
struct DocumentRoom {
    replica: Replica,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    fn new(replica: Replica, broadcast_capacity: usize) -> Self {
        Self {
            replica,
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

/// Per-connection membership, set by the first `SyncRequest`.
struct Membership {
    peer_id: Uuid,
    doc_id: Uuid,
    broadcast: Arc<BroadcastGroup>,
    rx: broadcast::Receiver<Arc<Relayed>>,
}

/// The relay server. Cheap to clone; clones share rooms and storage.
#[derive(Clone)]
pub struct SyncServer {
    config: Arc<ServerConfig>,
    rooms: Arc<RwLock<HashMap<Uuid, DocumentRoom>>>,
    stats: Arc<RwLock<ServerStats>>,
    store: Option<Arc<RocksSnapshotStore>>,
}

impl SyncServer {
    /// Create a server, opening the snapshot store if one is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(RocksSnapshotStore::open(store_config)?))
            }
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// Create with an already opened store.
    pub fn with_store(config: ServerConfig, store: Option<Arc<RocksSnapshotStore>>) -> Self {
        Self {
            config: Arc::new(config),
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), None)
    }

    /// Load every persisted document into a room.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(0),
        };

        let doc_ids = store.list_documents()?;
        let mut recovered = 0;
        let mut rooms = self.rooms.write().await;

        for doc_id in &doc_ids {
            if rooms.contains_key(doc_id) {
                continue;
            }
            let snapshot = match store.load_snapshot(*doc_id) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::warn!("Skipping document {doc_id}: {e}");
                    continue;
                }
            };
            match Replica::from_snapshot(ActorId::random(), &snapshot) {
                Ok(replica) => {
                    rooms.insert(
                        *doc_id,
                        DocumentRoom::new(replica, self.config.broadcast_capacity),
                    );
                    recovered += 1;
                    log::info!("Recovered document {doc_id} from storage");
                }
                Err(e) => log::warn!("Stored snapshot of {doc_id} unusable: {e}"),
            }
        }

        self.stats.write().await.active_rooms = rooms.len();
        log::info!("Recovery complete: {recovered}/{} documents restored", doc_ids.len());
        Ok(recovered)
    }

    /// Recover, bind the configured address and serve WebSocket clients.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.recover().await?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept WebSocket clients on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => {
                        log::info!("WebSocket connection established from {addr}");
                        server.serve_link(Link::websocket(ws)).await;
                    }
                    Err(e) => log::warn!("WebSocket handshake with {addr} failed: {e}"),
                }
            });
        }
    }

    /// Serve every link opened through a [`MemoryTransport`](crate::transport::MemoryTransport).
    pub fn serve_memory(&self, mut listener: MemoryListener) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            while let Some((doc_id, link)) = listener.accept().await {
                log::debug!("In-process connection for {doc_id}");
                let server = server.clone();
                tokio::spawn(async move { server.serve_link(link).await });
            }
        })
    }

    /// Serve one connection until it closes.
    pub async fn serve_link(&self, mut link: Link) {
        let conn_id = Uuid::new_v4();
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Membership> = None;

        loop {
            tokio::select! {
                msg = link.recv() => {
                    let msg = match msg {
                        Some(msg) => msg,
                        None => break,
                    };
                    self.stats.write().await.total_messages += 1;
                    if !self.on_message(conn_id, &link, &mut member, msg).await {
                        break;
                    }
                }

                relayed = async {
                    match member.as_mut() {
                        Some(m) => m.rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match relayed {
                        Ok(relayed) => {
                            // Don't echo back to the sender
                            if relayed.origin != conn_id
                                && link.send(relayed.message.clone()).is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            if let Some(m) = &member {
                                log::warn!("Peer {} lagged by {n} messages, resyncing", m.peer_id);
                                m.broadcast.record_dropped(n);
                                let doc_id = m.doc_id;
                                if let Some(msg) = self.snapshot_update(doc_id).await {
                                    let _ = link.send(msg);
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        link.close();
        if let Some(m) = member {
            self.leave(conn_id, m).await;
        }
        self.stats.write().await.active_connections -= 1;
    }

    /// Handle one message. Returns false when the connection should end.
    async fn on_message(
        &self,
        conn_id: Uuid,
        link: &Link,
        member: &mut Option<Membership>,
        msg: SyncMessage,
    ) -> bool {
        match msg.msg_type {
            MessageType::SyncRequest => {
                let remote = match msg.state_vector() {
                    Ok(sv) => sv,
                    Err(e) => {
                        log::warn!("Bad sync request from {}: {e}", msg.peer_id);
                        return true;
                    }
                };
                if member.is_none() {
                    match self.join(conn_id, msg.peer_id, msg.doc_id).await {
                        Some(m) => *member = Some(m),
                        None => return false,
                    }
                }
                let doc_id = member.as_ref().map_or(msg.doc_id, |m| m.doc_id);
                match self.sync_response(doc_id, &remote).await {
                    Some(response) => link.send(response).is_ok(),
                    None => true,
                }
            }

            MessageType::Update => {
                let Some(m) = member.as_ref() else {
                    log::debug!("Update before sync request from {}", msg.peer_id);
                    return true;
                };
                let payload = match msg.update_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("Bad update from {}: {e}", msg.peer_id);
                        return true;
                    }
                };
                if self.merge_update(m.doc_id, payload).await {
                    m.broadcast.broadcast(conn_id, msg);
                    self.stats.write().await.relayed_updates += 1;
                }
                true
            }

            MessageType::Awareness => {
                let Some(m) = member.as_ref() else {
                    return true;
                };
                match msg.awareness_message() {
                    Ok(AwarenessMessage::Join { peer_id, .. }) => {
                        log::info!("Presence: {peer_id} joined room {}", m.doc_id);
                    }
                    Ok(AwarenessMessage::Leave { peer_id }) => {
                        log::info!("Presence: {peer_id} left room {}", m.doc_id);
                    }
                    Ok(AwarenessMessage::Update { .. }) => {
                        log::trace!("Presence: update in room {}", m.doc_id);
                    }
                    Err(e) => {
                        log::warn!("Bad awareness message from {}: {e}", msg.peer_id);
                        return true;
                    }
                }
                m.broadcast.broadcast(conn_id, msg);
                true
            }

            MessageType::Ping => link.send(SyncMessage::pong(Uuid::nil(), &msg)).is_ok(),

            other => {
                log::debug!("Unhandled message type: {other:?}");
                true
            }
        }
    }

    /// Join (creating or restoring) the room of `doc_id`.
    async fn join(&self, conn_id: Uuid, peer_id: Uuid, doc_id: Uuid) -> Option<Membership> {
        let mut rooms = self.rooms.write().await;
        if !rooms.contains_key(&doc_id) {
            let replica = self.restore(doc_id);
            rooms.insert(doc_id, DocumentRoom::new(replica, self.config.broadcast_capacity));
        }
        let room = rooms.get(&doc_id)?;

        if room.broadcast.connection_count().await >= self.config.max_peers_per_room {
            log::warn!("Room {doc_id} is full, refusing {peer_id}");
            return None;
        }
        let broadcast = Arc::clone(&room.broadcast);
        let rx = broadcast.add_connection(conn_id, peer_id).await;
        self.stats.write().await.active_rooms = rooms.len();
        log::info!("Peer {peer_id} joined doc {doc_id}");

        Some(Membership {
            peer_id,
            doc_id,
            broadcast,
            rx,
        })
    }

    fn restore(&self, doc_id: Uuid) -> Replica {
        let actor = ActorId::random();
        let Some(store) = &self.store else {
            return Replica::new(actor);
        };
        match store.load_snapshot(doc_id) {
            Ok(snapshot) => match Replica::from_snapshot(actor, &snapshot) {
                Ok(replica) => {
                    log::info!("Loaded persisted snapshot for doc {doc_id}");
                    replica
                }
                Err(e) => {
                    log::warn!("Stored snapshot of {doc_id} unusable: {e}");
                    Replica::new(actor)
                }
            },
            Err(StoreError::NotFound(_)) => Replica::new(actor),
            Err(e) => {
                log::error!("Failed to load snapshot for doc {doc_id}: {e}");
                Replica::new(actor)
            }
        }
    }

    /// What a requester with state vector `remote` is missing.
    async fn sync_response(&self, doc_id: Uuid, remote: &StateVector) -> Option<SyncMessage> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(&doc_id)?;
        let content = match room.replica.diff_since(remote) {
            Ok(ops) => SyncPayload::Ops(ops),
            Err(ReplicaError::ResyncRequired { actor, .. }) => {
                log::debug!("Diff for {doc_id} needs ops of {actor} folded by compaction");
                SyncPayload::Snapshot(room.replica.snapshot())
            }
            Err(e) => {
                log::warn!("Cannot diff {doc_id}: {e}");
                SyncPayload::Snapshot(room.replica.snapshot())
            }
        };
        let response = SyncResponse {
            state_vector: room.replica.state_vector().clone(),
            content,
        };
        Some(SyncMessage::sync_response(Uuid::nil(), doc_id, &response))
    }

    /// Full room state as an update, for receivers that lost messages.
    async fn snapshot_update(&self, doc_id: Uuid) -> Option<SyncMessage> {
        let rooms = self.rooms.read().await;
        let room = rooms.get(&doc_id)?;
        let content = SyncPayload::Snapshot(room.replica.snapshot());
        Some(SyncMessage::update(Uuid::nil(), doc_id, 0, &content))
    }

    /// Merge into the room replica. Returns whether the update carried
    /// anything new and should be relayed.
    async fn merge_update(&self, doc_id: Uuid, payload: SyncPayload) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&doc_id) else {
            return false;
        };
        let result = match payload {
            SyncPayload::Ops(ops) => room.replica.merge_remote(ops),
            SyncPayload::Snapshot(bytes) => match room.replica.merge_snapshot(&bytes) {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("Dropping snapshot update for {doc_id}: {e}");
                    MergeResult::default()
                }
            },
        };
        if room.replica.op_count() > self.config.compact_threshold {
            room.replica.compact();
        }
        !result.applied.is_empty() || result.buffered > 0
    }

    /// Drop a connection from its room; persist and close the room when it
    /// was the last one.
    async fn leave(&self, conn_id: Uuid, member: Membership) {
        let Membership {
            peer_id, doc_id, ..
        } = member;
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&doc_id) else {
            return;
        };
        room.broadcast.remove_connection(&conn_id).await;

        if !room.broadcast.has_peer(&peer_id).await {
            room.broadcast
                .broadcast(conn_id, SyncMessage::peer_left(peer_id, doc_id));
            log::info!("Peer {peer_id} left doc {doc_id}");
        }

        if room.broadcast.connection_count().await == 0 {
            if let Some(store) = &self.store {
                match store.save(doc_id, room.replica.snapshot()).await {
                    Ok(_) => {
                        self.stats.write().await.persisted_snapshots += 1;
                        log::info!("Persisted snapshot for doc {doc_id} (room closing)");
                    }
                    Err(e) => log::error!("Failed to persist snapshot for doc {doc_id}: {e}"),
                }
            }
            rooms.remove(&doc_id);
            log::info!("Room {doc_id} removed (empty)");
        }
        self.stats.write().await.active_rooms = rooms.len();
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<RocksSnapshotStore>> {
        self.store.as_ref()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Current text of an open room.
    pub async fn document_text(&self, doc_id: Uuid) -> Option<String> {
        self.rooms.read().await.get(&doc_id).map(|r| r.replica.text())
    }

    /// Distinct peers connected to an open room.
    pub async fn room_peers(&self, doc_id: Uuid) -> Vec<Uuid> {
        let group = {
            let rooms = self.rooms.read().await;
            rooms.get(&doc_id).map(|r| Arc::clone(&r.broadcast))
        };
        match group {
            Some(group) => group.peers().await,
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Join `doc` on a fresh in-process link and return it after the handshake.
    async fn connect(server: &SyncServer, doc: Uuid, peer: Uuid, sv: &StateVector) -> (Link, SyncResponse) {
        let (mut near, far) = Link::pair();
        let s = server.clone();
        tokio::spawn(async move { s.serve_link(far).await });
        near.send(SyncMessage::sync_request(peer, doc, sv)).unwrap();
        let response = near.recv().await.unwrap();
        (near, response.sync_response_body().unwrap())
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_handshake_returns_missing_ops() {
        let server = SyncServer::with_defaults();
        let doc = Uuid::new_v4();
        let (writer_link, response) = connect(&server, doc, Uuid::new_v4(), &StateVector::new()).await;
        assert_eq!(response.content, SyncPayload::Ops(Vec::new()));

        let mut writer = Replica::new(ActorId::random());
        let op = writer.insert(0, "relay").unwrap();
        writer_link.send(SyncMessage::ops(Uuid::new_v4(), doc, op.last_clock(), vec![op])).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.document_text(doc).await.as_deref(), Some("relay"));

        let (_reader_link, response) = connect(&server, doc, Uuid::new_v4(), &StateVector::new()).await;
        let mut reader = Replica::new(ActorId::random());
        match response.content {
            SyncPayload::Ops(ops) => {
                reader.merge_remote(ops);
            }
            other => panic!("expected ops, got {other:?}"),
        }
        assert_eq!(reader.text(), "relay");
        assert_eq!(&response.state_vector, writer.state_vector());
    }

    #[tokio::test]
    async fn test_updates_relayed_to_others_only() {
        let server = SyncServer::with_defaults();
        let doc = Uuid::new_v4();
        let (mut a, _) = connect(&server, doc, Uuid::new_v4(), &StateVector::new()).await;
        let (mut b, _) = connect(&server, doc, Uuid::new_v4(), &StateVector::new()).await;

        let mut replica = Replica::new(ActorId::random());
        let op = replica.insert(0, "x").unwrap();
        a.send(SyncMessage::ops(Uuid::new_v4(), doc, 1, vec![op.clone()])).unwrap();

        let relayed = b.recv().await.unwrap();
        assert_eq!(relayed.update_payload().unwrap(), SyncPayload::Ops(vec![op.clone()]));

        // A duplicate is merged but not relayed again.
        a.send(SyncMessage::ops(Uuid::new_v4(), doc, 1, vec![op])).unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(50), b.recv()).await;
        assert!(nothing.is_err());

        // The sender never hears its own update.
        let nothing = tokio::time::timeout(Duration::from_millis(50), a.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let server = SyncServer::with_defaults();
        let doc = Uuid::new_v4();
        let (mut link, _) = connect(&server, doc, Uuid::new_v4(), &StateVector::new()).await;
        link.send(SyncMessage::ping(Uuid::new_v4(), doc, 42)).unwrap();
        let pong = link.recv().await.unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(pong.clock, 42);
    }

    #[tokio::test]
    async fn test_disconnect_announces_peer_left_and_closes_room() {
        let server = SyncServer::with_defaults();
        let doc = Uuid::new_v4();
        let leaving = Uuid::new_v4();
        let (a, _) = connect(&server, doc, leaving, &StateVector::new()).await;
        let (mut b, _) = connect(&server, doc, Uuid::new_v4(), &StateVector::new()).await;
        assert_eq!(server.room_peers(doc).await.len(), 2);

        a.close();
        let left = b.recv().await.unwrap();
        assert_eq!(left.msg_type, MessageType::PeerLeft);
        assert_eq!(left.peer_id, leaving);

        b.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(server.room_count().await, 0);
        assert_eq!(server.stats().await.active_connections, 0);
    }

    #[tokio::test]
    async fn test_compacted_room_answers_with_snapshot() {
        let config = ServerConfig {
            compact_threshold: 1,
            ..ServerConfig::default()
        };
        let server = SyncServer::with_store(config, None);
        let doc = Uuid::new_v4();
        let (a, _) = connect(&server, doc, Uuid::new_v4(), &StateVector::new()).await;

        let mut writer = Replica::new(ActorId::random());
        let ops = vec![writer.insert(0, "ab").unwrap(), writer.insert(2, "cd").unwrap()];
        a.send(SyncMessage::ops(Uuid::new_v4(), doc, 0, ops)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (_b, response) = connect(&server, doc, Uuid::new_v4(), &StateVector::new()).await;
        let bytes = match response.content {
            SyncPayload::Snapshot(bytes) => bytes,
            other => panic!("expected snapshot, got {other:?}"),
        };
        assert_eq!(Replica::from_snapshot(ActorId::random(), &bytes).unwrap().text(), "abcd");
    }

    #[tokio::test]
    async fn test_room_persisted_and_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let doc = Uuid::new_v4();
        {
            let server = SyncServer::new(config.clone()).unwrap();
            let (a, _) = connect(&server, doc, Uuid::new_v4(), &StateVector::new()).await;
            let mut writer = Replica::new(ActorId::random());
            let op = writer.insert(0, "persist me").unwrap();
            a.send(SyncMessage::ops(Uuid::new_v4(), doc, 1, vec![op])).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            a.close();
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(server.stats().await.persisted_snapshots, 1);
        }

        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.recover().await.unwrap(), 1);
        assert_eq!(server.document_text(doc).await.as_deref(), Some("persist me"));
    }

    #[tokio::test]
    async fn test_room_capacity_enforced() {
        let config = ServerConfig {
            max_peers_per_room: 1,
            ..ServerConfig::default()
        };
        let server = SyncServer::with_store(config, None);
        let doc = Uuid::new_v4();
        let (_a, _) = connect(&server, doc, Uuid::new_v4(), &StateVector::new()).await;

        let (mut near, far) = Link::pair();
        let s = server.clone();
        tokio::spawn(async move { s.serve_link(far).await });
        near.send(SyncMessage::sync_request(Uuid::new_v4(), doc, &StateVector::new())).unwrap();
        assert!(near.recv().await.is_none());
    }
}
