//! Durable snapshot storage for collaborative documents.
//!
//! ```text
//! ┌──────────────────┐  save(doc, snapshot)   ┌────────────────────────┐
//! │ AutoSaveScheduler│ ─────────────────────► │ PersistenceBackend     │
//! │ (single-flight)  │                        │  ├─ MemoryBackend      │
//! └──────────────────┘ ◄───────────────────── │  └─ RocksSnapshotStore │
//!                          load(doc)          └────────────────────────┘
//! ```
//!
//! Backends store opaque replica snapshots. Saving the same bytes twice
//! leaves the store unchanged.
//!
//! Reference: Kleppmann, Chapter 3: Storage and Retrieval

pub mod rocks;

pub use rocks::{DocumentMetadata, RocksSnapshotStore, StoreConfig, StoreError};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

/// Persistence failures. Always retried by the scheduler before surfacing.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceError {
    /// The storage backend rejected or failed the call.
    Backend(String),
    /// Stored bytes could not be decoded.
    Codec(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "Persistence backend error: {e}"),
            Self::Codec(e) => write!(f, "Persistence codec error: {e}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupt(_) | StoreError::Encode(_) | StoreError::Decode(_) => {
                Self::Codec(e.to_string())
            }
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Where document snapshots live between sessions.
pub trait PersistenceBackend: Send + Sync + 'static {
    /// Store the latest snapshot of a document, replacing any previous one.
    fn save(
        &self,
        doc_id: Uuid,
        snapshot: Vec<u8>,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Last stored snapshot, or `None` for a document never saved.
    fn load(
        &self,
        doc_id: Uuid,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, PersistenceError>> + Send;
}

impl<B: PersistenceBackend> PersistenceBackend for Arc<B> {
    fn save(
        &self,
        doc_id: Uuid,
        snapshot: Vec<u8>,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send {
        (**self).save(doc_id, snapshot)
    }

    fn load(
        &self,
        doc_id: Uuid,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, PersistenceError>> + Send {
        (**self).load(doc_id)
    }
}

/// RocksDB calls block, so they run on the blocking pool.
impl PersistenceBackend for RocksSnapshotStore {
    fn save(
        &self,
        doc_id: Uuid,
        snapshot: Vec<u8>,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send {
        let store = self.clone();
        async move {
            let saved = tokio::task::spawn_blocking(move || store.save_snapshot(doc_id, &snapshot))
                .await
                .map_err(|e| PersistenceError::Backend(e.to_string()))?;
            saved.map(|_| ()).map_err(PersistenceError::from)
        }
    }

    fn load(
        &self,
        doc_id: Uuid,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, PersistenceError>> + Send {
        let store = self.clone();
        async move {
            let loaded = tokio::task::spawn_blocking(move || store.load_snapshot(doc_id))
                .await
                .map_err(|e| PersistenceError::Backend(e.to_string()))?;
            match loaded {
                Ok(bytes) => Ok(Some(bytes)),
                Err(StoreError::NotFound(_)) => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory backend
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    documents: HashMap<Uuid, Vec<u8>>,
    save_log: Vec<(Uuid, Vec<u8>)>,
    fail_saves: u32,
    fail_loads: bool,
    latency: Option<Duration>,
}

/// In-memory backend with scriptable failures and a log of every save
/// call, failed ones included.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail.
    pub fn fail_next_saves(&self, n: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_saves = n;
        }
    }

    /// Make every load fail until switched off.
    pub fn fail_loads(&self, fail: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_loads = fail;
        }
    }

    /// Delay every save by `latency` before it completes.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.latency = Some(latency);
        }
    }

    /// Seed a stored snapshot.
    pub fn insert(&self, doc_id: Uuid, snapshot: Vec<u8>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.documents.insert(doc_id, snapshot);
        }
    }

    pub fn stored(&self, doc_id: Uuid) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.documents.get(&doc_id).cloned())
    }

    /// Every save call so far, in call order.
    pub fn save_calls(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.inner
            .lock()
            .map(|inner| inner.save_log.clone())
            .unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.save_log.len()).unwrap_or(0)
    }

    fn record_save(&self, doc_id: Uuid, snapshot: Vec<u8>) -> (Option<Duration>, bool) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return (None, false),
        };
        inner.save_log.push((doc_id, snapshot));
        let fail = inner.fail_saves > 0;
        if fail {
            inner.fail_saves -= 1;
        }
        (inner.latency, !fail)
    }

    fn commit(&self, doc_id: Uuid, snapshot: Vec<u8>) -> Result<(), PersistenceError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PersistenceError::Backend("backend poisoned".into()))?;
        inner.documents.insert(doc_id, snapshot);
        Ok(())
    }
}

impl PersistenceBackend for MemoryBackend {
    fn save(
        &self,
        doc_id: Uuid,
        snapshot: Vec<u8>,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send {
        let (latency, succeed) = self.record_save(doc_id, snapshot.clone());
        let backend = self.clone();
        async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            if !succeed {
                return Err(PersistenceError::Backend("scripted save failure".into()));
            }
            backend.commit(doc_id, snapshot)
        }
    }

    fn load(
        &self,
        doc_id: Uuid,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, PersistenceError>> + Send {
        let result = match self.inner.lock() {
            Ok(inner) if inner.fail_loads => {
                Err(PersistenceError::Backend("scripted load failure".into()))
            }
            Ok(inner) => Ok(inner.documents.get(&doc_id).cloned()),
            Err(_) => Err(PersistenceError::Backend("backend poisoned".into())),
        };
        async move { result }
    }
}
