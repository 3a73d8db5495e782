//! Operation identifiers, payloads and state vectors.
//!
//! Every edit is an immutable [`Operation`] stamped with an [`OpId`]
//! `(actor, counter)`. Counters are Lamport clocks: an actor's counters only
//! grow, and a new operation always takes a counter larger than anything the
//! author has seen. An insert of `n` characters reserves `n` consecutive
//! clock values, one per character ([`ElemId`]).
//!
//! ```text
//! OpId { counter: 7, actor: A }  Insert "cat"
//!        │
//!        ├── ElemId(7+0, A)  'c'
//!        ├── ElemId(7+1, A)  'a'
//!        └── ElemId(7+2, A)  't'
//! ```
//!
//! Reference: Lamport, Time, Clocks, and the Ordering of Events (1978)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Stable per-session replica identifier.
///
/// Ordered by the underlying UUID; that order is the final tie-break for
/// concurrent inserts at the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(Uuid);

impl ActorId {
    /// Fresh random actor id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Deterministic id, mostly useful in tests.
    pub fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Globally unique operation id.
///
/// Field order matters: the derived ordering is `(counter, actor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub actor: ActorId,
}

impl OpId {
    pub fn new(actor: ActorId, counter: u64) -> Self {
        Self { counter, actor }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.actor)
    }
}

/// Identifier of a single character produced by an insert operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElemId {
    pub op: OpId,
    pub offset: u32,
}

impl ElemId {
    pub fn new(op: OpId, offset: u32) -> Self {
        Self { op, offset }
    }

    /// Lamport clock value reserved for this character.
    #[inline]
    pub fn clock(&self) -> u64 {
        self.op.counter.saturating_add(self.offset as u64)
    }
}

impl Ord for ElemId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.clock(), self.op.actor, self.op.counter)
            .cmp(&(other.clock(), other.op.actor, other.op.counter))
    }
}

impl PartialOrd for ElemId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// What an operation does to the sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpPayload {
    /// Insert `text` immediately after `origin` (`None` = document head).
    Insert {
        origin: Option<ElemId>,
        text: String,
    },
    /// Tombstone the given characters.
    Delete { targets: Vec<ElemId> },
}

impl OpPayload {
    /// Number of clock values the payload reserves.
    pub fn span(&self) -> u64 {
        match self {
            OpPayload::Insert { text, .. } => text.chars().count().max(1) as u64,
            OpPayload::Delete { .. } => 1,
        }
    }

    /// Operations this payload refers to. They must be present before the
    /// payload can be applied.
    pub fn referenced_ops(&self) -> Vec<OpId> {
        let mut refs = Vec::new();
        match self {
            OpPayload::Insert { origin, .. } => {
                if let Some(origin) = origin {
                    refs.push(origin.op);
                }
            }
            OpPayload::Delete { targets } => {
                for t in targets {
                    if !refs.contains(&t.op) {
                        refs.push(t.op);
                    }
                }
            }
        }
        refs
    }
}

/// Immutable unit of change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub payload: OpPayload,
    /// Causal dependencies: the author's previous operation plus every
    /// operation referenced by the payload.
    pub deps: Vec<OpId>,
}

impl Operation {
    /// Last clock value reserved by this operation.
    pub fn last_clock(&self) -> u64 {
        self.id.counter.saturating_add(self.payload.span() - 1)
    }

    /// Like [`Operation::last_clock`], `None` if the range overflows.
    pub fn checked_last_clock(&self) -> Option<u64> {
        self.id.counter.checked_add(self.payload.span() - 1)
    }

    /// Declared dependencies plus payload references, deduplicated.
    pub fn required(&self) -> Vec<OpId> {
        let mut required = self.deps.clone();
        for r in self.payload.referenced_ops() {
            if !required.contains(&r) {
                required.push(r);
            }
        }
        required
    }
}

/// Per-actor summary of the highest applied counter.
///
/// Because every operation depends on its author's previous one, an entry
/// `actor → n` means every operation of `actor` with counter `<= n` is known.
/// Operations of an author that skips that link are still applied, but a
/// diff keyed on this vector may not carry them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<ActorId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter seen for `actor` (0 = nothing).
    pub fn get(&self, actor: &ActorId) -> u64 {
        self.clocks.get(actor).copied().unwrap_or(0)
    }

    /// Raise the entry for `id.actor` to at least `id.counter`.
    pub fn observe(&mut self, id: OpId) {
        let entry = self.clocks.entry(id.actor).or_insert(0);
        if id.counter > *entry {
            *entry = id.counter;
        }
    }

    /// Whether the operation is covered by this vector.
    pub fn covers(&self, id: &OpId) -> bool {
        self.get(&id.actor) >= id.counter
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (actor, counter) in &other.clocks {
            self.observe(OpId::new(*actor, *counter));
        }
    }

    /// Every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.clocks.iter().all(|(a, c)| self.get(a) >= *c)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, &u64)> {
        self.clocks.iter()
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(n: u128) -> ActorId {
        ActorId::from_u128(n)
    }

    #[test]
    fn test_op_id_orders_by_counter_then_actor() {
        let a = OpId::new(actor(2), 1);
        let b = OpId::new(actor(1), 2);
        let c = OpId::new(actor(1), 1);
        assert!(a < b);
        assert!(c < a);
    }

    #[test]
    fn test_elem_clock_includes_offset() {
        let op = OpId::new(actor(1), 10);
        assert_eq!(ElemId::new(op, 0).clock(), 10);
        assert_eq!(ElemId::new(op, 3).clock(), 13);
    }

    #[test]
    fn test_elem_ordering_ties_on_actor() {
        let low = ElemId::new(OpId::new(actor(1), 4), 0);
        let high = ElemId::new(OpId::new(actor(2), 4), 0);
        assert!(high > low);

        let later = ElemId::new(OpId::new(actor(1), 3), 2); // clock 5
        assert!(later > high);
    }

    #[test]
    fn test_payload_span() {
        let insert = OpPayload::Insert { origin: None, text: "héllo".into() };
        assert_eq!(insert.span(), 5);
        let delete = OpPayload::Delete { targets: vec![] };
        assert_eq!(delete.span(), 1);
    }

    #[test]
    fn test_required_merges_deps_and_refs() {
        let a = actor(1);
        let b = actor(2);
        let target = ElemId::new(OpId::new(b, 3), 0);
        let op = Operation {
            id: OpId::new(a, 5),
            payload: OpPayload::Delete { targets: vec![target, ElemId::new(OpId::new(b, 3), 1)] },
            deps: vec![OpId::new(a, 4)],
        };
        assert_eq!(op.required(), vec![OpId::new(a, 4), OpId::new(b, 3)]);
    }

    #[test]
    fn test_state_vector_observe_is_monotonic() {
        let mut sv = StateVector::new();
        sv.observe(OpId::new(actor(1), 5));
        sv.observe(OpId::new(actor(1), 3));
        assert_eq!(sv.get(&actor(1)), 5);
        assert!(sv.covers(&OpId::new(actor(1), 4)));
        assert!(!sv.covers(&OpId::new(actor(1), 6)));
        assert!(!sv.covers(&OpId::new(actor(2), 1)));
    }

    #[test]
    fn test_state_vector_merge_and_dominates() {
        let mut a = StateVector::new();
        a.observe(OpId::new(actor(1), 5));
        let mut b = StateVector::new();
        b.observe(OpId::new(actor(2), 2));

        assert!(!a.dominates(&b));
        a.merge(&b);
        assert!(a.dominates(&b));
        assert_eq!(a.len(), 2);
    }
}
