//! Persistence integration tests.
//!
//! Sessions and the relay backed by a real RocksDB store: edits survive
//! a session restart, and a relay restart recovers its rooms.

use folio_collab::autosave::SaveState;
use folio_collab::awareness::Identity;
use folio_collab::config::CollabConfig;
use folio_collab::connection::ConnectionState;
use folio_collab::server::{ServerConfig, SyncServer};
use folio_collab::session::{CollaborationSession, SessionHandle};
use folio_collab::storage::{PersistenceBackend, RocksSnapshotStore, StoreConfig};
use folio_collab::transport::{MemoryTransport, Transport};
use folio_core::{ActorId, Replica};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

async fn start_session<T: Transport, B: PersistenceBackend>(
    doc_id: Uuid,
    transport: T,
    backend: Arc<B>,
) -> SessionHandle {
    CollaborationSession::new(
        CollabConfig::for_testing(),
        Identity::new("Ada"),
        doc_id,
        transport,
        backend,
    )
    .start()
    .await
}

/// A transport whose endpoint never answers.
fn unreachable() -> MemoryTransport {
    let (transport, listener) = MemoryTransport::new();
    drop(listener);
    transport
}

fn text_of(snapshot: &[u8]) -> String {
    Replica::from_snapshot(ActorId::random(), snapshot).unwrap().text()
}

#[tokio::test]
async fn test_stop_persists_to_rocksdb() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let doc_id = Uuid::new_v4();

    let handle = start_session(doc_id, unreachable(), store.clone()).await;
    handle.insert(0, "draft").await.unwrap();
    handle.stop().await.unwrap();

    assert!(store.document_exists(doc_id).unwrap());
    assert_eq!(text_of(&store.load_snapshot(doc_id).unwrap()), "draft");
}

#[tokio::test]
async fn test_session_hydrates_after_restart() {
    let dir = tempdir().unwrap();
    let doc_id = Uuid::new_v4();

    {
        let store =
            Arc::new(RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let handle = start_session(doc_id, unreachable(), store).await;
        handle.insert(0, "persistent text").await.unwrap();
        handle.delete(0, 11).await.unwrap();
        handle.stop().await.unwrap();
    }

    // Reopen the database, as after a process restart.
    let store = Arc::new(RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let handle = start_session(doc_id, unreachable(), store).await;
    assert_eq!(handle.text().await.unwrap(), "text");

    // Editing continues on top of the hydrated state.
    handle.insert(4, "!").await.unwrap();
    assert_eq!(handle.text().await.unwrap(), "text!");
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_auto_save_reaches_rocksdb() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let doc_id = Uuid::new_v4();

    let handle = start_session(doc_id, unreachable(), store.clone()).await;
    handle.insert(0, "autosaved").await.unwrap();

    let saved = timeout(Duration::from_secs(2), async {
        while handle.save_state().await.unwrap().0 != SaveState::Saved {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(saved.is_ok(), "auto-save never completed");
    assert!(handle.save_state().await.unwrap().1.is_some());
    assert_eq!(text_of(&store.load_snapshot(doc_id).unwrap()), "autosaved");

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_relay_recovers_rooms_after_restart() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let doc_id = Uuid::new_v4();

    // First relay: one session edits, then leaves; the room is persisted.
    let server = SyncServer::with_store(ServerConfig::default(), Some(store.clone()));
    let (transport, listener) = MemoryTransport::new();
    let acceptor = server.serve_memory(listener);

    let writer = start_session(doc_id, transport, Arc::new(folio_collab::MemoryBackend::new())).await;
    let connected = timeout(Duration::from_secs(2), async {
        while writer.connection_state().await.unwrap().0 != ConnectionState::Connected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(connected.is_ok());
    writer.insert(0, "kept by the relay").await.unwrap();
    writer.stop().await.unwrap();

    let closed = timeout(Duration::from_secs(2), async {
        while server.room_count().await > 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(closed.is_ok());
    acceptor.abort();
    assert_eq!(server.stats().await.persisted_snapshots, 1);

    // Second relay over the same store.
    let restarted = SyncServer::with_store(ServerConfig::default(), Some(store));
    assert_eq!(restarted.recover().await.unwrap(), 1);
    assert_eq!(
        restarted.document_text(doc_id).await.as_deref(),
        Some("kept by the relay")
    );

    let (transport, listener) = MemoryTransport::new();
    restarted.serve_memory(listener);
    let reader = start_session(doc_id, transport, Arc::new(folio_collab::MemoryBackend::new())).await;
    let synced = timeout(Duration::from_secs(2), async {
        while reader.text().await.unwrap() != "kept by the relay" {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(synced.is_ok(), "late reader never synced");
    reader.stop().await.unwrap();
}
