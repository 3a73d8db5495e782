//! Operation log and materialized document view.
//!
//! A [`Replica`] owns the append-only log of applied operations, a buffer of
//! operations waiting for their dependencies, and the [`Sequence`] derived
//! from them. The sequence is a pure function of the operation *set*, so
//! replicas that applied the same operations hold byte-identical text.
//!
//! ```text
//! merge_remote(ops)
//!       │
//!       ├── duplicate (same id, same payload) ──► dropped
//!       ├── malformed ──────────────────────────► rejected, logged
//!       ├── missing deps ───────────────────────► pending buffer
//!       └── ready ──► apply ──► drain pending until fixpoint
//! ```
//!
//! Compaction folds the log into the base state. Peers that still lack a
//! compacted operation can no longer be served a diff and must take a full
//! snapshot ([`ReplicaError::ResyncRequired`]).
//!
//! Reference: Shapiro et al., Conflict-free Replicated Data Types (2011)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::op::{ActorId, ElemId, OpId, OpPayload, Operation, StateVector};
use crate::sequence::{Element, Sequence};

/// Snapshot format version. Bumped whenever the encoding changes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Largest clock value an operation may reserve. Leaves headroom so a
/// peer announcing a huge counter cannot exhaust the local clock.
pub const MAX_CLOCK: u64 = 1 << 62;

/// Replica errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaError {
    /// Operation failed validation; it was not applied.
    MalformedOperation { id: OpId, reason: String },
    /// Local edit addressed a position outside the document.
    OutOfBounds { index: usize, len: usize },
    /// A peer lacks operations that were compacted away; a diff cannot be
    /// produced and a full snapshot is needed instead.
    ResyncRequired {
        actor: ActorId,
        peer_has: u64,
        compacted: u64,
    },
    /// Snapshot bytes could not be decoded.
    SnapshotDecode(String),
    /// Snapshot was written by an incompatible version.
    UnsupportedSnapshotVersion(u32),
}

impl std::fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedOperation { id, reason } => {
                write!(f, "Malformed operation {id}: {reason}")
            }
            Self::OutOfBounds { index, len } => {
                write!(f, "Position {index} out of bounds (len {len})")
            }
            Self::ResyncRequired { actor, peer_has, compacted } => write!(
                f,
                "Resync required: peer has {actor} up to {peer_has}, log compacted through {compacted}"
            ),
            Self::SnapshotDecode(e) => write!(f, "Snapshot decode error: {e}"),
            Self::UnsupportedSnapshotVersion(v) => {
                write!(f, "Unsupported snapshot version {v} (expected {SNAPSHOT_VERSION})")
            }
        }
    }
}

impl std::error::Error for ReplicaError {}

/// Outcome of a merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeResult {
    /// Operations applied by this call, in application order. Includes
    /// previously buffered operations whose dependencies arrived.
    pub applied: Vec<OpId>,
    /// Operations already present.
    pub duplicates: usize,
    /// Operations that failed validation.
    pub rejected: Vec<ReplicaError>,
    /// Operations newly buffered waiting for dependencies.
    pub buffered: usize,
}

impl MergeResult {
    /// Whether anything was applied.
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }

    fn absorb(&mut self, other: MergeResult) {
        self.applied.extend(other.applied);
        self.duplicates += other.duplicates;
        self.rejected.extend(other.rejected);
        self.buffered += other.buffered;
    }
}

/// On-disk / on-wire snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u32,
    epoch: u64,
    elements: Vec<Element>,
    state_vector: StateVector,
    compacted: StateVector,
    max_clock: u64,
    log: Vec<Operation>,
}

enum Verdict {
    Ready,
    Blocked,
    Duplicate,
    Reject(String),
}

/// Local copy of a collaborative document.
pub struct Replica {
    actor: ActorId,
    sequence: Sequence,
    /// Operations applied since the last compaction, in application order.
    log: Vec<Operation>,
    /// Op id → position in `log`.
    index: HashMap<OpId, usize>,
    /// Highest applied counter per actor, compacted operations included.
    state_vector: StateVector,
    /// Coverage of operations folded into the base by compaction.
    compacted: StateVector,
    /// Largest clock value seen from anyone.
    max_clock: u64,
    /// Operations waiting for dependencies, in arrival order.
    pending: Vec<Operation>,
    /// Number of compactions folded into this replica.
    epoch: u64,
    /// Bumped on every change to the materialized view.
    revision: u64,
}

impl Replica {
    /// Create an empty replica.
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            sequence: Sequence::new(),
            log: Vec::new(),
            index: HashMap::new(),
            state_vector: StateVector::new(),
            compacted: StateVector::new(),
            max_clock: 0,
            pending: Vec::new(),
            epoch: 0,
            revision: 0,
        }
    }

    /// Create a replica hydrated from a snapshot.
    pub fn from_snapshot(actor: ActorId, bytes: &[u8]) -> Result<Self, ReplicaError> {
        let mut replica = Self::new(actor);
        replica.merge_snapshot(bytes)?;
        Ok(replica)
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Apply a local edit and return the operation to broadcast.
    ///
    /// Fails only if the payload is not well-formed (empty text, empty or
    /// unknown delete targets, unknown origin).
    pub fn apply_local(&mut self, payload: OpPayload) -> Result<Operation, ReplicaError> {
        let prev = self.state_vector.get(&self.actor);
        let id = OpId::new(self.actor, self.max_clock.saturating_add(1));

        let mut deps = Vec::new();
        if prev > 0 {
            deps.push(OpId::new(self.actor, prev));
        }
        for r in payload.referenced_ops() {
            if !deps.contains(&r) {
                deps.push(r);
            }
        }

        let op = Operation { id, payload, deps };
        if let Err(reason) = self.validate(&op) {
            return Err(ReplicaError::MalformedOperation { id, reason });
        }
        self.apply(op.clone());
        Ok(op)
    }

    /// Insert `text` at visible position `index`.
    pub fn insert(&mut self, index: usize, text: &str) -> Result<Operation, ReplicaError> {
        let len = self.sequence.len();
        if index > len {
            return Err(ReplicaError::OutOfBounds { index, len });
        }
        let origin = if index == 0 {
            None
        } else {
            self.sequence.visible_id_at(index - 1)
        };
        self.apply_local(OpPayload::Insert {
            origin,
            text: text.to_string(),
        })
    }

    /// Delete `count` visible characters starting at `index`.
    pub fn delete(&mut self, index: usize, count: usize) -> Result<Operation, ReplicaError> {
        let len = self.sequence.len();
        let end = index.checked_add(count).filter(|&end| count > 0 && end <= len);
        if end.is_none() {
            return Err(ReplicaError::OutOfBounds {
                index: index.saturating_add(count),
                len,
            });
        }
        let targets = self.sequence.visible_range(index, count);
        self.apply_local(OpPayload::Delete { targets })
    }

    // ─── Remote merges ────────────────────────────────────────────────

    /// Merge operations received from peers.
    ///
    /// Never fails as a whole: each operation is applied, dropped as a
    /// duplicate, buffered, or rejected on its own.
    pub fn merge_remote<I>(&mut self, ops: I) -> MergeResult
    where
        I: IntoIterator<Item = Operation>,
    {
        let mut result = MergeResult::default();
        for op in ops {
            match self.judge(&op) {
                Verdict::Duplicate => result.duplicates += 1,
                Verdict::Reject(reason) => {
                    log::warn!("Rejected operation {}: {reason}", op.id);
                    result
                        .rejected
                        .push(ReplicaError::MalformedOperation { id: op.id, reason });
                }
                Verdict::Blocked => {
                    if let Some(existing) = self.pending.iter().find(|p| p.id == op.id) {
                        if *existing == op {
                            result.duplicates += 1;
                        } else {
                            let reason = "id collision with buffered operation".to_string();
                            log::warn!("Rejected operation {}: {reason}", op.id);
                            result
                                .rejected
                                .push(ReplicaError::MalformedOperation { id: op.id, reason });
                        }
                        continue;
                    }
                    log::debug!("Buffering operation {} until dependencies arrive", op.id);
                    self.pending.push(op);
                    result.buffered += 1;
                }
                Verdict::Ready => {
                    result.applied.push(op.id);
                    self.apply(op);
                    result.absorb(self.drain_pending());
                }
            }
        }
        result
    }

    /// Apply every buffered operation whose dependencies are now present.
    fn drain_pending(&mut self) -> MergeResult {
        let mut result = MergeResult::default();
        loop {
            let ready = self
                .pending
                .iter()
                .position(|op| op.required().iter().all(|d| self.has_op(d)));
            let Some(pos) = ready else { break };
            let op = self.pending.remove(pos);
            match self.judge(&op) {
                Verdict::Ready => {
                    result.applied.push(op.id);
                    self.apply(op);
                }
                Verdict::Duplicate => result.duplicates += 1,
                Verdict::Reject(reason) => {
                    log::warn!("Rejected buffered operation {}: {reason}", op.id);
                    result
                        .rejected
                        .push(ReplicaError::MalformedOperation { id: op.id, reason });
                }
                Verdict::Blocked => self.pending.push(op),
            }
        }
        result
    }

    /// Whether an operation is acceptable at all, whatever else is known.
    ///
    /// Only looks at the operation itself, so the verdict never depends on
    /// arrival order.
    fn check_shape(op: &Operation) -> Result<(), String> {
        if op.id.counter == 0 {
            return Err("counter must be positive".into());
        }
        match &op.payload {
            OpPayload::Insert { text, .. } => {
                if text.is_empty() {
                    return Err("empty insert".into());
                }
                if text.chars().count() > u32::MAX as usize {
                    return Err("insert too long".into());
                }
            }
            OpPayload::Delete { targets } if targets.is_empty() => {
                return Err("empty delete".into());
            }
            OpPayload::Delete { .. } => {}
        }
        match op.checked_last_clock() {
            Some(last) if last <= MAX_CLOCK => {}
            _ => return Err(format!("clock range exceeds {MAX_CLOCK}")),
        }
        if op.deps.contains(&op.id) {
            return Err("operation depends on itself".into());
        }
        Ok(())
    }

    fn judge(&self, op: &Operation) -> Verdict {
        if let Err(reason) = Self::check_shape(op) {
            return Verdict::Reject(reason);
        }
        if let Some(&pos) = self.index.get(&op.id) {
            return if self.log[pos] == *op {
                Verdict::Duplicate
            } else {
                Verdict::Reject("id collision with different payload".into())
            };
        }
        if self.compacted.covers(&op.id) {
            return Verdict::Duplicate;
        }
        if op.id.actor == self.actor {
            return Verdict::Reject("unknown operation carrying the local actor id".into());
        }
        if !op.required().iter().all(|d| self.has_op(d)) {
            return Verdict::Blocked;
        }
        match self.validate(op) {
            Ok(()) => Verdict::Ready,
            Err(reason) => Verdict::Reject(reason),
        }
    }

    /// Checks that need the operation's dependencies in place.
    fn validate(&self, op: &Operation) -> Result<(), String> {
        Self::check_shape(op)?;
        match &op.payload {
            OpPayload::Insert { origin, .. } => {
                if let Some(origin) = origin {
                    if !self.sequence.contains(origin) {
                        return Err(format!("unknown origin {}+{}", origin.op, origin.offset));
                    }
                    if op.id.counter <= origin.clock() {
                        return Err("clock does not exceed origin".into());
                    }
                }
            }
            OpPayload::Delete { targets } => {
                if let Some(t) = targets.iter().find(|t| !self.sequence.contains(t)) {
                    return Err(format!("unknown delete target {}+{}", t.op, t.offset));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: Operation) {
        let mut changed = false;
        match &op.payload {
            OpPayload::Insert { origin, text } => {
                let mut prev = *origin;
                for (offset, value) in text.chars().enumerate() {
                    let id = ElemId::new(op.id, offset as u32);
                    changed |= self.sequence.integrate(Element {
                        id,
                        origin: prev,
                        value,
                        deleted: false,
                    });
                    prev = Some(id);
                }
            }
            OpPayload::Delete { targets } => {
                for t in targets {
                    changed |= self.sequence.delete(t);
                }
            }
        }

        let last = op.last_clock();
        self.state_vector.observe(op.id);
        self.max_clock = self.max_clock.max(last);
        self.index.insert(op.id, self.log.len());
        self.log.push(op);
        if changed {
            self.revision += 1;
        }
    }

    /// Whether the operation has been applied (or folded by compaction).
    pub fn has_op(&self, id: &OpId) -> bool {
        self.index.contains_key(id) || self.compacted.covers(id)
    }

    // ─── Sync ─────────────────────────────────────────────────────────

    /// Operations a peer with state vector `remote` is missing, in causal
    /// order.
    pub fn diff_since(&self, remote: &StateVector) -> Result<Vec<Operation>, ReplicaError> {
        for (actor, &compacted) in self.compacted.iter() {
            let peer_has = remote.get(actor);
            if peer_has < compacted {
                return Err(ReplicaError::ResyncRequired {
                    actor: *actor,
                    peer_has,
                    compacted,
                });
            }
        }
        Ok(self
            .log
            .iter()
            .filter(|op| !remote.covers(&op.id))
            .cloned()
            .collect())
    }

    /// Serialize the full replica state.
    pub fn snapshot(&self) -> Vec<u8> {
        let envelope = SnapshotEnvelope {
            version: SNAPSHOT_VERSION,
            epoch: self.epoch,
            elements: self.sequence.elements().to_vec(),
            state_vector: self.state_vector.clone(),
            compacted: self.compacted.clone(),
            max_clock: self.max_clock,
            log: self.log.clone(),
        };
        bincode::serde::encode_to_vec(&envelope, bincode::config::standard()).unwrap_or_else(|e| {
            log::error!("Failed to encode snapshot: {e}");
            Vec::new()
        })
    }

    /// Merge a snapshot produced by any replica of the same document.
    ///
    /// Elements missing locally are integrated in snapshot order (an origin
    /// always precedes its children there), tombstones are unioned, and the
    /// snapshot's log is adopted so it can be served in later diffs.
    pub fn merge_snapshot(&mut self, bytes: &[u8]) -> Result<MergeResult, ReplicaError> {
        let (envelope, _): (SnapshotEnvelope, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ReplicaError::SnapshotDecode(e.to_string()))?;
        if envelope.version != SNAPSHOT_VERSION {
            return Err(ReplicaError::UnsupportedSnapshotVersion(envelope.version));
        }
        let log_in_range = envelope
            .log
            .iter()
            .all(|op| op.checked_last_clock().is_some_and(|last| last <= MAX_CLOCK));
        if envelope.max_clock > MAX_CLOCK || !log_in_range {
            return Err(ReplicaError::SnapshotDecode(format!(
                "clock range exceeds {MAX_CLOCK}"
            )));
        }

        let mut result = MergeResult::default();
        let mut changed = false;

        if self.sequence.element_count() == 0 {
            changed = !envelope.elements.is_empty();
            self.sequence = Sequence::from_elements(envelope.elements);
        } else {
            for element in envelope.elements {
                let id = element.id;
                let deleted = element.deleted;
                if !self.sequence.contains(&id) {
                    changed |= self.sequence.integrate(element);
                } else if deleted {
                    changed |= self.sequence.delete(&id);
                }
            }
        }

        for op in envelope.log {
            if self.has_op(&op.id) {
                continue;
            }
            self.pending.retain(|p| p.id != op.id);
            result.applied.push(op.id);
            self.index.insert(op.id, self.log.len());
            self.log.push(op);
        }

        self.state_vector.merge(&envelope.state_vector);
        self.compacted.merge(&envelope.compacted);
        self.max_clock = self.max_clock.max(envelope.max_clock);
        self.epoch = self.epoch.max(envelope.epoch);
        if changed {
            self.revision += 1;
        }

        result.absorb(self.drain_pending());
        if !changed && result.applied.is_empty() {
            log::debug!("Snapshot merge brought nothing new");
        }
        Ok(result)
    }

    /// Fold the operation log into the base state.
    ///
    /// The materialized view is unchanged. Returns the number of operations
    /// folded.
    pub fn compact(&mut self) -> usize {
        let folded = self.log.len();
        self.compacted = self.state_vector.clone();
        self.log.clear();
        self.index.clear();
        self.epoch += 1;
        log::info!("Compacted {folded} operations (epoch {})", self.epoch);
        folded
    }

    // ─── Accessors ────────────────────────────────────────────────────

    /// Materialized text.
    pub fn text(&self) -> String {
        self.sequence.text()
    }

    /// Visible character count.
    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Operations waiting for dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Operations retained in the log.
    pub fn op_count(&self) -> usize {
        self.log.len()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Changes whenever the materialized view changes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }
}
