//! # folio-core: Replicated document engine
//!
//! Operation-based sequence CRDT for plain-text documents. Pure and
//! synchronous: no I/O, no timers, no threads.
//!
//! ## Architecture
//!
//! ```text
//!  local edit ──► apply_local ──► Operation ──► (broadcast)
//!                      │
//!                      ▼
//! ┌──────────────────────────────────────────┐
//! │ Replica                                  │
//! │  ├─ operation log + state vector         │
//! │  ├─ pending buffer (causal order)        │
//! │  └─ Sequence (RGA, tombstones)           │
//! └──────────────────────────────────────────┘
//!                      ▲
//!  remote ops ──► merge_remote ──► MergeResult
//! ```
//!
//! ## Modules
//!
//! - [`op`]: Operation ids, payloads, state vectors
//! - [`sequence`]: Ordered character sequence with tombstones
//! - [`replica`]: Operation log, merging, diffs, snapshots, compaction
//!
//! ## Guarantees
//!
//! | Property | Holds |
//! |----------|-------|
//! | Commutativity of merges | ✅ |
//! | Idempotence of merges | ✅ |
//! | Convergence (byte-identical text) | ✅ |
//! | Causal delivery via buffering | ✅ |

pub mod op;
pub mod sequence;
pub mod replica;

pub use op::{ActorId, ElemId, OpId, OpPayload, Operation, StateVector};
pub use sequence::{Element, Sequence};
pub use replica::{MergeResult, Replica, ReplicaError, MAX_CLOCK, SNAPSHOT_VERSION};
