//! # folio-collab: Real-time collaboration layer for Folio
//!
//! Connects [`folio_core::Replica`]s through a relay so that concurrent
//! editors converge, see each other's presence, survive disconnects and
//! persist their work.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐    Transport / Link    ┌─────────────┐
//! │ CollaborationSession │ ◄────────────────────► │ SyncServer  │
//! │ (per user, per doc)  │    bincode SyncMessage │ (relay)     │
//! └──────────┬───────────┘                        └──────┬──────┘
//!            │ one event loop                            │
//!   ┌────────┼──────────┬──────────────┐          ┌──────┴───────┐
//!   ▼        ▼          ▼              ▼          ▼              ▼
//! Replica  Awareness  Connection   AutoSave    Replica     BroadcastGroup
//!          Store      Manager      Scheduler   (authority)  (fan-out)
//!                                     │                          │
//!                                     ▼                          ▼
//!                            PersistenceBackend        RocksSnapshotStore
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Tunables with defaults, overridable from JSON
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`awareness`]: Ephemeral peer presence with per-field LWW
//! - [`transport`]: WebSocket and in-process links
//! - [`connection`]: Connection state machine, heartbeat and backoff
//! - [`storage`]: Persistence backends (memory, RocksDB)
//! - [`autosave`]: Debounced single-flight saves with retries
//! - [`session`]: Session orchestrator and observer callbacks
//! - [`broadcast`]: Room-based fan-out with backpressure
//! - [`server`]: Relay server

pub mod config;
pub mod protocol;
pub mod awareness;
pub mod transport;
pub mod connection;
pub mod storage;
pub mod autosave;
pub mod session;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use config::CollabConfig;
pub use protocol::{MessageType, ProtocolError, SyncMessage, SyncPayload, SyncResponse};
pub use awareness::{
    AwarenessMessage, AwarenessStore, CursorColor, Identity, PeerPresence, PresenceField,
    Selection,
};
pub use transport::{Link, MemoryListener, MemoryTransport, Transport, TransportError, WebSocketTransport};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionSession, ConnectionState};
pub use storage::{
    DocumentMetadata, MemoryBackend, PersistenceBackend, PersistenceError, RocksSnapshotStore,
    StoreConfig, StoreError,
};
pub use autosave::{AutoSaveScheduler, SaveEvent, SaveReason, SaveState, SaveTask};
pub use session::{
    CollaborationSession, EventChannel, SessionError, SessionEvent, SessionHandle,
    SessionObserver,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Relayed};
pub use server::{ServerConfig, ServerStats, SyncServer};
