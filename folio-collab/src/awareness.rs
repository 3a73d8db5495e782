//! Ephemeral peer presence (cursor, selection, display metadata).
//!
//! ```text
//! set_local(fields)
//!       │
//!       ▼
//! AwarenessMessage::Update { timestamp++ }
//!       │
//!       ▼   (SyncMessage::Awareness broadcast)
//! Remote AwarenessStore::handle_message()
//!       │
//!       ▼
//! per-field last-writer-wins, last_seen refreshed
//! ```
//!
//! Every field carries the sender's timestamp; an update older than the
//! stored value for that field is ignored. Nothing here is ever persisted.
//!
//! Reference: Kleppmann, Chapter 8: Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, visually distinct color from a UUID.
    ///
    /// Hue comes from the UUID hash; saturation and lightness are fixed so
    /// every peer gets an equally vivid cursor.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 } // Default blue
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Text selection as visible character positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

/// Who the local user is, as supplied by the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub peer_id: Uuid,
    pub display_name: String,
    /// Preferred color; derived from `peer_id` when absent.
    pub color_hint: Option<CursorColor>,
}

impl Identity {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            display_name: display_name.into(),
            color_hint: None,
        }
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            color_hint: None,
        }
    }

    pub fn color(&self) -> CursorColor {
        self.color_hint.unwrap_or_else(|| CursorColor::from_uuid(self.peer_id))
    }
}

/// One presence field, the unit of last-writer-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceField {
    DisplayName(String),
    Color(CursorColor),
    /// Caret position; `None` when the peer has no caret in the document.
    Cursor(Option<usize>),
    Selection(Option<Selection>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FieldKind {
    DisplayName,
    Color,
    Cursor,
    Selection,
}

impl PresenceField {
    fn kind(&self) -> FieldKind {
        match self {
            PresenceField::DisplayName(_) => FieldKind::DisplayName,
            PresenceField::Color(_) => FieldKind::Color,
            PresenceField::Cursor(_) => FieldKind::Cursor,
            PresenceField::Selection(_) => FieldKind::Selection,
        }
    }
}

/// A peer's presence as seen locally.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub peer_id: Uuid,
    pub display_name: String,
    pub color: CursorColor,
    pub cursor: Option<usize>,
    pub selection: Option<Selection>,
    /// Last time anything was heard from this peer.
    pub last_seen: Instant,
}

impl PeerPresence {
    fn placeholder(peer_id: Uuid, now: Instant) -> Self {
        Self {
            peer_id,
            display_name: format!("Peer-{}", &peer_id.simple().to_string()[..8]),
            color: CursorColor::from_uuid(peer_id),
            cursor: None,
            selection: None,
            last_seen: now,
        }
    }

    /// Set a field; returns whether the value changed.
    fn set(&mut self, field: PresenceField) -> bool {
        match field {
            PresenceField::DisplayName(v) => replace(&mut self.display_name, v),
            PresenceField::Color(v) => replace(&mut self.color, v),
            PresenceField::Cursor(v) => replace(&mut self.cursor, v),
            PresenceField::Selection(v) => replace(&mut self.selection, v),
        }
    }

    /// Every field, for a full announcement.
    fn fields(&self) -> Vec<PresenceField> {
        vec![
            PresenceField::DisplayName(self.display_name.clone()),
            PresenceField::Color(self.color),
            PresenceField::Cursor(self.cursor),
            PresenceField::Selection(self.selection),
        ]
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol messages
// ───────────────────────────────────────────────────────────────────

/// Presence deltas, carried inside `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Peer (re)joined with its full state. Restarts the field clocks
    /// kept for this peer.
    Join {
        peer_id: Uuid,
        timestamp: u64,
        fields: Vec<PresenceField>,
    },

    /// Changed fields. An empty list only refreshes liveness.
    Update {
        peer_id: Uuid,
        timestamp: u64,
        fields: Vec<PresenceField>,
    },

    /// Clean departure.
    Leave { peer_id: Uuid },
}

impl AwarenessMessage {
    pub fn peer_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { peer_id, .. } => *peer_id,
            AwarenessMessage::Update { peer_id, .. } => *peer_id,
            AwarenessMessage::Leave { peer_id } => *peer_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

// ───────────────────────────────────────────────────────────────────
// Awareness store
// ───────────────────────────────────────────────────────────────────

struct PeerEntry {
    presence: PeerPresence,
    clocks: HashMap<FieldKind, u64>,
}

/// Local and remote presence for one document session.
///
/// The local peer is tracked separately and never appears in [`list`].
///
/// [`list`]: AwarenessStore::list
pub struct AwarenessStore {
    local: PeerPresence,
    /// Monotonic timestamp for outgoing messages.
    clock: u64,
    peers: HashMap<Uuid, PeerEntry>,
    timeout: Duration,
}

impl AwarenessStore {
    pub fn new(identity: &Identity, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            local: PeerPresence {
                peer_id: identity.peer_id,
                display_name: identity.display_name.clone(),
                color: identity.color(),
                cursor: None,
                selection: None,
                last_seen: now,
            },
            clock: 0,
            peers: HashMap::new(),
            timeout,
        }
    }

    pub fn local_peer_id(&self) -> Uuid {
        self.local.peer_id
    }

    pub fn local_state(&self) -> &PeerPresence {
        &self.local
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Update local fields and return the delta to broadcast right away.
    pub fn set_local(&mut self, fields: Vec<PresenceField>) -> AwarenessMessage {
        for field in &fields {
            self.local.set(field.clone());
        }
        self.local.last_seen = Instant::now();
        AwarenessMessage::Update {
            peer_id: self.local.peer_id,
            timestamp: self.tick(),
            fields,
        }
    }

    /// Full local state, announced when joining a document.
    pub fn join_message(&mut self) -> AwarenessMessage {
        AwarenessMessage::Join {
            peer_id: self.local.peer_id,
            timestamp: self.tick(),
            fields: self.local.fields(),
        }
    }

    /// Full local state as an update, sent when another peer joins so it
    /// learns about us without restarting our field clocks elsewhere.
    pub fn announce(&mut self) -> AwarenessMessage {
        AwarenessMessage::Update {
            peer_id: self.local.peer_id,
            timestamp: self.tick(),
            fields: self.local.fields(),
        }
    }

    /// Liveness renewal with no field changes.
    pub fn renewal(&mut self) -> AwarenessMessage {
        AwarenessMessage::Update {
            peer_id: self.local.peer_id,
            timestamp: self.tick(),
            fields: Vec::new(),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            peer_id: self.local.peer_id,
        }
    }

    /// Per-field last-writer-wins merge of a remote peer's fields.
    ///
    /// Fields older than the stored value are ignored; `last_seen` is
    /// refreshed either way. Returns whether the visible presence changed.
    pub fn apply_remote(
        &mut self,
        peer_id: Uuid,
        fields: Vec<PresenceField>,
        timestamp: u64,
        now: Instant,
    ) -> bool {
        if peer_id == self.local.peer_id {
            return false;
        }
        let mut changed = false;
        let entry = self.peers.entry(peer_id).or_insert_with(|| {
            changed = true;
            PeerEntry {
                presence: PeerPresence::placeholder(peer_id, now),
                clocks: HashMap::new(),
            }
        });
        entry.presence.last_seen = now;

        for field in fields {
            let kind = field.kind();
            let stored = entry.clocks.get(&kind).copied().unwrap_or(0);
            if timestamp < stored {
                log::trace!("Ignoring stale {kind:?} from {peer_id} ({timestamp} < {stored})");
                continue;
            }
            entry.clocks.insert(kind, timestamp);
            changed |= entry.presence.set(field);
        }
        changed
    }

    /// Handle an incoming awareness message. Returns whether the visible
    /// presence changed.
    pub fn handle_message(&mut self, msg: AwarenessMessage, now: Instant) -> bool {
        if msg.peer_id() == self.local.peer_id {
            return false;
        }
        match msg {
            AwarenessMessage::Join { peer_id, timestamp, fields } => {
                // Same identity on a new connection: keep one entry, restart
                // its field clocks.
                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.clocks.clear();
                    entry.presence.last_seen = now;
                }
                log::debug!("Peer {peer_id} joined");
                self.apply_remote(peer_id, fields, timestamp, now)
            }
            AwarenessMessage::Update { peer_id, timestamp, fields } => {
                self.apply_remote(peer_id, fields, timestamp, now)
            }
            AwarenessMessage::Leave { peer_id } => self.remove(&peer_id),
        }
    }

    /// Drop a peer (explicit leave). Returns whether it was present.
    pub fn remove(&mut self, peer_id: &Uuid) -> bool {
        let removed = self.peers.remove(peer_id).is_some();
        if removed {
            log::debug!("Peer {peer_id} left");
        }
        removed
    }

    /// Remove peers not heard from within the timeout. Returns their ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.timeout;
        let mut stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, e)| e.presence.last_seen + timeout < now)
            .map(|(id, _)| *id)
            .collect();
        stale.sort();
        for id in &stale {
            self.peers.remove(id);
        }
        if !stale.is_empty() {
            log::debug!("Presence sweep expired {} peer(s)", stale.len());
        }
        stale
    }

    /// Remote peers sorted by id.
    pub fn list(&self) -> Vec<PeerPresence> {
        let mut peers: Vec<PeerPresence> =
            self.peers.values().map(|e| e.presence.clone()).collect();
        peers.sort_by_key(|p| p.peer_id);
        peers
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&PeerPresence> {
        self.peers.get(peer_id).map(|e| &e.presence)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Forget every remote peer. Returns whether any were present.
    pub fn clear_remote(&mut self) -> bool {
        let had = !self.peers.is_empty();
        self.peers.clear();
        had
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store(n: u128) -> AwarenessStore {
        AwarenessStore::new(
            &Identity::with_id(Uuid::from_u128(n), format!("user-{n}")),
            Duration::from_secs(30),
        )
    }

    // ── CursorColor tests ────────────────────────────────────────

    #[test]
    fn test_cursor_color_from_uuid_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
    }

    #[test]
    fn test_cursor_color_in_range() {
        let c = CursorColor::from_uuid(Uuid::new_v4());
        assert!(c.r >= 0.0 && c.r <= 1.0);
        assert!(c.g >= 0.0 && c.g <= 1.0);
        assert!(c.b >= 0.0 && c.b <= 1.0);
        assert_eq!(c.a, 1.0);
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_identity_color_hint_wins() {
        let mut id = Identity::with_id(Uuid::from_u128(1), "A");
        assert_eq!(id.color(), CursorColor::from_uuid(Uuid::from_u128(1)));
        id.color_hint = Some(CursorColor::rgba(1.0, 0.0, 0.0, 1.0));
        assert_eq!(id.color().r, 1.0);
    }

    // ── AwarenessMessage tests ───────────────────────────────────

    #[test]
    fn test_awareness_message_roundtrip() {
        let msg = AwarenessMessage::Update {
            peer_id: Uuid::new_v4(),
            timestamp: 9,
            fields: vec![
                PresenceField::Cursor(Some(4)),
                PresenceField::Selection(Some(Selection { anchor: 1, head: 4 })),
            ],
        };
        let decoded = AwarenessMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    // ── AwarenessStore tests ─────────────────────────────────────

    #[test]
    fn test_set_local_bumps_timestamp() {
        let mut s = store(1);
        let first = s.set_local(vec![PresenceField::Cursor(Some(3))]);
        let second = s.set_local(vec![PresenceField::Cursor(Some(4))]);
        match (first, second) {
            (
                AwarenessMessage::Update { timestamp: t1, .. },
                AwarenessMessage::Update { timestamp: t2, .. },
            ) => assert!(t2 > t1),
            other => panic!("unexpected messages: {other:?}"),
        }
        assert_eq!(s.local_state().cursor, Some(4));
        assert!(s.list().is_empty());
    }

    #[test]
    fn test_apply_remote_creates_peer() {
        let mut s = store(1);
        let peer = Uuid::from_u128(2);
        let now = Instant::now();
        assert!(s.apply_remote(peer, vec![PresenceField::Cursor(Some(7))], 1, now));
        let p = s.peer(&peer).unwrap();
        assert_eq!(p.cursor, Some(7));
        assert!(p.display_name.starts_with("Peer-"));
    }

    #[test]
    fn test_lww_per_field_ignores_stale() {
        let mut s = store(1);
        let peer = Uuid::from_u128(2);
        let now = Instant::now();
        s.apply_remote(peer, vec![PresenceField::Cursor(Some(10))], 5, now);
        s.apply_remote(peer, vec![PresenceField::DisplayName("Bob".into())], 2, now);

        // Older cursor loses, but display name has its own clock.
        let changed = s.apply_remote(peer, vec![PresenceField::Cursor(Some(1))], 3, now);
        assert!(!changed);
        let p = s.peer(&peer).unwrap();
        assert_eq!(p.cursor, Some(10));
        assert_eq!(p.display_name, "Bob");
    }

    #[test]
    fn test_stale_update_still_refreshes_last_seen() {
        let mut s = store(1);
        let peer = Uuid::from_u128(2);
        let t0 = Instant::now();
        s.apply_remote(peer, vec![PresenceField::Cursor(Some(1))], 5, t0);
        let t1 = t0 + Duration::from_secs(10);
        s.apply_remote(peer, vec![PresenceField::Cursor(Some(2))], 1, t1);
        assert_eq!(s.peer(&peer).unwrap().last_seen, t1);
    }

    #[test]
    fn test_ignores_own_messages() {
        let mut s = store(1);
        let own = Uuid::from_u128(1);
        let msg = AwarenessMessage::Update {
            peer_id: own,
            timestamp: 100,
            fields: vec![PresenceField::Cursor(Some(1))],
        };
        assert!(!s.handle_message(msg, Instant::now()));
        assert_eq!(s.peer_count(), 0);
    }

    #[test]
    fn test_rejoin_same_identity_no_duplicate() {
        let mut a = store(1);
        let mut b = store(2);
        let now = Instant::now();

        a.handle_message(b.join_message(), now);
        for _ in 0..5 {
            a.handle_message(b.set_local(vec![PresenceField::Cursor(Some(3))]), now);
        }

        // B restarts on a new connection with a fresh clock.
        let mut b2 = store(2);
        b2.set_local(vec![PresenceField::Cursor(Some(8))]);
        let later = now + Duration::from_secs(1);
        a.handle_message(b2.join_message(), later);

        assert_eq!(a.peer_count(), 1);
        let p = a.peer(&Uuid::from_u128(2)).unwrap();
        assert_eq!(p.cursor, Some(8));
        assert_eq!(p.last_seen, later);
    }

    #[test]
    fn test_leave_removes_peer() {
        let mut a = store(1);
        let mut b = store(2);
        let now = Instant::now();
        a.handle_message(b.join_message(), now);
        assert!(a.handle_message(b.leave_message(), now));
        assert!(a.list().is_empty());
    }

    #[test]
    fn test_sweep_expires_silent_peers() {
        let mut s = store(1);
        let t0 = Instant::now();
        s.apply_remote(Uuid::from_u128(2), vec![], 1, t0);
        s.apply_remote(Uuid::from_u128(3), vec![], 1, t0 + Duration::from_secs(20));

        // Exactly at the boundary the peer is still present.
        assert!(s.sweep(t0 + Duration::from_secs(30)).is_empty());
        assert_eq!(s.list().len(), 2);

        let expired = s.sweep(t0 + Duration::from_secs(31));
        assert_eq!(expired, vec![Uuid::from_u128(2)]);
        assert_eq!(s.list().len(), 1);
    }

    #[test]
    fn test_list_sorted_excludes_local() {
        let mut s = store(5);
        let now = Instant::now();
        for n in [9u128, 2, 7] {
            s.apply_remote(Uuid::from_u128(n), vec![], 1, now);
        }
        let ids: Vec<Uuid> = s.list().iter().map(|p| p.peer_id).collect();
        assert_eq!(ids, vec![Uuid::from_u128(2), Uuid::from_u128(7), Uuid::from_u128(9)]);
    }

    #[test]
    fn test_clear_remote() {
        let mut s = store(1);
        s.apply_remote(Uuid::from_u128(2), vec![], 1, Instant::now());
        assert!(s.clear_remote());
        assert!(!s.clear_remote());
        assert_eq!(s.local_state().peer_id, Uuid::from_u128(1));
    }

    #[test]
    fn test_announce_carries_full_state() {
        let mut a = store(1);
        a.set_local(vec![PresenceField::Cursor(Some(2))]);
        let mut b = store(2);
        b.handle_message(a.announce(), Instant::now());
        let p = b.peer(&Uuid::from_u128(1)).unwrap();
        assert_eq!(p.display_name, "user-1");
        assert_eq!(p.cursor, Some(2));
    }
}
