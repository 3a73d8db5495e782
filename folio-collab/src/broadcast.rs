//! Fan-out of relayed messages to every connection in a document room.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! connection gets an independent receiver that buffers up to `capacity`
//! messages; a receiver that falls further behind observes a lag and has
//! to be resynchronized by its owner.
//!
//! Reference: Patterson & Hennessy, Section 6.4: Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::SyncMessage;

/// A message on its way to the other connections of a room.
#[derive(Debug, Clone)]
pub struct Relayed {
    /// Connection that sent it; its own receiver skips it.
    pub origin: Uuid,
    pub message: SyncMessage,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

/// Lock-free counters for the send path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The broadcast group of a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Relayed>>,
    /// Connection id → peer id
    connections: RwLock<HashMap<Uuid, Uuid>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connections: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_connection(
        &self,
        conn_id: Uuid,
        peer_id: Uuid,
    ) -> broadcast::Receiver<Arc<Relayed>> {
        self.connections.write().await.insert(conn_id, peer_id);
        self.sender.subscribe()
    }

    /// Unregister a connection. Returns the peer it belonged to.
    pub async fn remove_connection(&self, conn_id: &Uuid) -> Option<Uuid> {
        self.connections.write().await.remove(conn_id)
    }

    /// Send to every receiver, the origin's included (it filters itself
    /// out). Returns the number of receivers reached.
    pub fn broadcast(&self, origin: Uuid, message: SyncMessage) -> usize {
        let count = self
            .sender
            .send(Arc::new(Relayed { origin, message }))
            .unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether `peer_id` still has at least one connection in the room.
    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.connections.read().await.values().any(|p| p == peer_id)
    }

    /// Distinct peers in the room, sorted.
    pub async fn peers(&self) -> Vec<Uuid> {
        let mut peers: Vec<Uuid> = self.connections.read().await.values().copied().collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(peer: Uuid) -> SyncMessage {
        SyncMessage::peer_left(peer, Uuid::nil())
    }

    #[tokio::test]
    async fn test_add_remove_connection() {
        let group = BroadcastGroup::new(16);
        let (conn, peer) = (Uuid::new_v4(), Uuid::new_v4());

        let _rx = group.add_connection(conn, peer).await;
        assert_eq!(group.connection_count().await, 1);
        assert!(group.has_peer(&peer).await);

        assert_eq!(group.remove_connection(&conn).await, Some(peer));
        assert_eq!(group.connection_count().await, 0);
        assert!(!group.has_peer(&peer).await);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_every_receiver() {
        let group = BroadcastGroup::new(16);
        let conns: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let mut rxs = Vec::new();
        for c in &conns {
            rxs.push(group.add_connection(*c, Uuid::new_v4()).await);
        }

        let sender = Uuid::new_v4();
        assert_eq!(group.broadcast(conns[0], msg(sender)), 3);
        for rx in &mut rxs {
            let relayed = rx.recv().await.unwrap();
            assert_eq!(relayed.origin, conns[0]);
            assert_eq!(relayed.message.peer_id, sender);
        }
    }

    #[tokio::test]
    async fn test_same_peer_on_two_connections() {
        let group = BroadcastGroup::new(16);
        let peer = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _ra = group.add_connection(a, peer).await;
        let _rb = group.add_connection(b, peer).await;
        assert_eq!(group.peers().await, vec![peer]);

        group.remove_connection(&a).await;
        assert!(group.has_peer(&peer).await);
        group.remove_connection(&b).await;
        assert!(!group.has_peer(&peer).await);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_connection(Uuid::new_v4(), Uuid::new_v4()).await;
        for _ in 0..5 {
            group.broadcast(Uuid::nil(), msg(Uuid::nil()));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_connections, 1);
        assert_eq!(group.capacity(), 2);
    }
}
