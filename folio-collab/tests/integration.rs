//! Integration tests for end-to-end collaboration.
//!
//! These tests start a real relay and run real sessions against it,
//! verifying the full sync pipeline: handshake, live updates, presence
//! and recovery from an unreachable endpoint.

use folio_collab::awareness::{Identity, PresenceField};
use folio_collab::config::CollabConfig;
use folio_collab::connection::ConnectionState;
use folio_collab::server::{ServerConfig, SyncServer};
use folio_collab::session::{CollaborationSession, SessionHandle};
use folio_collab::storage::MemoryBackend;
use folio_collab::transport::{MemoryTransport, Transport, WebSocketTransport};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

/// Start a relay on a free port, return its WebSocket URL.
async fn start_test_server() -> (SyncServer, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        bind_addr: addr.to_string(),
        max_peers_per_room: 10,
        broadcast_capacity: 64,
        ..ServerConfig::default()
    };
    let server = SyncServer::with_store(config, None);
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://{addr}"))
}

async fn start_session<T: Transport>(name: &str, doc_id: Uuid, transport: T) -> SessionHandle {
    CollaborationSession::new(
        CollabConfig::for_testing(),
        Identity::new(name),
        doc_id,
        transport,
        Arc::new(MemoryBackend::new()),
    )
    .start()
    .await
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(Duration::from_secs(2), async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

async fn wait_connected(handle: &SessionHandle) {
    eventually("connection", move || async move {
        handle.connection_state().await.unwrap().0 == ConnectionState::Connected
    })
    .await;
}

async fn wait_text(handle: &SessionHandle, expected: &str) {
    eventually(expected, move || async move { handle.text().await.unwrap() == expected }).await;
}

// ───────────────────────────────────────────────────────────────────
// WebSocket relay
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_connects_over_websocket() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let alice = start_session("Alice", doc_id, WebSocketTransport::new(&url)).await;
    wait_connected(&alice).await;

    assert_eq!(server.room_count().await, 1);
    assert_eq!(server.room_peers(doc_id).await, vec![alice.peer_id()]);
    alice.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_sessions_converge() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let alice = start_session("Alice", doc_id, WebSocketTransport::new(&url)).await;
    let bob = start_session("Bob", doc_id, WebSocketTransport::new(&url)).await;
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    alice.insert(0, "cat").await.unwrap();
    wait_text(&bob, "cat").await;

    // Concurrent edits at both ends of the document.
    bob.insert(3, "s").await.unwrap();
    alice.insert(0, "a ").await.unwrap();

    wait_text(&alice, "a cats").await;
    wait_text(&bob, "a cats").await;
    assert_eq!(server.document_text(doc_id).await.as_deref(), Some("a cats"));

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_inserts_at_same_position_converge() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let alice = start_session("Alice", doc_id, WebSocketTransport::new(&url)).await;
    let bob = start_session("Bob", doc_id, WebSocketTransport::new(&url)).await;
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    alice.insert(0, "cat").await.unwrap();
    bob.insert(0, "dog").await.unwrap();

    let (a, b) = (&alice, &bob);
    eventually("both edits on both sides", move || async move {
        a.text().await.unwrap().len() == 6 && b.text().await.unwrap().len() == 6
    })
    .await;
    let text = alice.text().await.unwrap();
    assert_eq!(bob.text().await.unwrap(), text);
    assert!(text == "catdog" || text == "dogcat", "interleaved: {text}");

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_late_joiner_receives_history() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let alice = start_session("Alice", doc_id, WebSocketTransport::new(&url)).await;
    wait_connected(&alice).await;
    alice.insert(0, "hello world").await.unwrap();
    alice.delete(5, 6).await.unwrap();

    let bob = start_session("Bob", doc_id, WebSocketTransport::new(&url)).await;
    wait_text(&bob, "hello").await;

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_presence_seen_and_cleared_on_leave() {
    let (_server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let alice = start_session("Alice", doc_id, WebSocketTransport::new(&url)).await;
    let bob = start_session("Bob", doc_id, WebSocketTransport::new(&url)).await;
    wait_connected(&alice).await;
    wait_connected(&bob).await;
    alice.insert(0, "text").await.unwrap();
    wait_text(&bob, "text").await;

    let alice_id = alice.peer_id();
    let b = &bob;
    alice.set_presence(vec![PresenceField::Cursor(Some(2))]).unwrap();
    eventually("alice's cursor at bob", move || async move {
        b.peers()
            .await
            .unwrap()
            .iter()
            .any(|p| p.peer_id == alice_id && p.display_name == "Alice" && p.cursor == Some(2))
    })
    .await;

    alice.stop().await.unwrap();
    eventually("alice gone at bob", move || async move { b.peers().await.unwrap().is_empty() }).await;

    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_room_closes_when_last_session_stops() {
    let (server, url) = start_test_server().await;
    let doc_id = Uuid::new_v4();

    let alice = start_session("Alice", doc_id, WebSocketTransport::new(&url)).await;
    wait_connected(&alice).await;
    assert_eq!(server.room_count().await, 1);

    alice.stop().await.unwrap();
    let s = &server;
    eventually("room closed", move || async move {
        s.room_count().await == 0 && s.stats().await.active_connections == 0
    })
    .await;
}

// ───────────────────────────────────────────────────────────────────
// In-process relay
// ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_offline_edits_delivered_after_reconnect() {
    let server = SyncServer::with_defaults();
    let (transport, listener) = MemoryTransport::new();
    server.serve_memory(listener);
    let doc_id = Uuid::new_v4();

    // The first attempts fail; the session edits offline meanwhile.
    transport.fail_next(2);
    let alice = start_session("Alice", doc_id, transport.clone()).await;
    alice.insert(0, "written offline").await.unwrap();
    assert_ne!(
        alice.connection_state().await.unwrap().0,
        ConnectionState::Connected
    );

    wait_connected(&alice).await;
    assert!(transport.open_count() >= 3);

    let bob = start_session("Bob", doc_id, transport.clone()).await;
    wait_text(&bob, "written offline").await;

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}

#[tokio::test]
async fn test_edits_on_both_sides_of_an_outage_merge() {
    let server = SyncServer::with_defaults();
    let (transport, listener) = MemoryTransport::new();
    server.serve_memory(listener);
    let doc_id = Uuid::new_v4();

    let bob = start_session("Bob", doc_id, transport.clone()).await;
    wait_connected(&bob).await;
    bob.insert(0, "online").await.unwrap();

    transport.fail_next(1);
    let alice = start_session("Alice", doc_id, transport.clone()).await;
    alice.insert(0, "offline ").await.unwrap();

    wait_connected(&alice).await;
    let merged_len = "offline online".len();
    let (a, b) = (&alice, &bob);
    eventually("merged text", move || async move {
        let (ta, tb) = (a.text().await.unwrap(), b.text().await.unwrap());
        ta == tb && ta.len() == merged_len
    })
    .await;
    assert_eq!(
        server.document_text(doc_id).await.map(|t| t.len()),
        Some(merged_len)
    );

    alice.stop().await.unwrap();
    bob.stop().await.unwrap();
}
