//! RocksDB-backed snapshot store.
//!
//! ```text
//!  key: doc_id (16 bytes)
//!   ├── cf "documents"  LZ4 frame of the replica snapshot
//!   └── cf "metadata"   bincode DocumentMetadata
//! ```
//!
//! Both values of a document are written in one batch, so a reader never
//! sees a snapshot without its metadata. Writing bytes identical to what is
//! stored is skipped and does not bump the version.
//!
//! Reference: Kleppmann, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    IteratorMode, Options, WriteBatch, WriteOptions, DB,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Shared LRU block cache, bytes.
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every batch.
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Memtable size per column family, bytes.
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 << 20,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 << 20,
        }
    }
}

impl StoreConfig {
    /// Small caches in a caller-chosen directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 << 20,
            max_open_files: 64,
            write_buffer_size: 4 << 20,
            ..Self::default()
        }
    }

    fn db_options(&self) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(self.max_open_files);
        opts.set_keep_log_file_num(5);
        let cores = std::thread::available_parallelism().map_or(4, |n| n.get() as i32);
        opts.increase_parallelism(cores);
        opts
    }

    fn column_family(&self, name: &str, cache: &Cache) -> ColumnFamilyDescriptor {
        let mut table = BlockBasedOptions::default();
        table.set_block_cache(cache);
        table.set_bloom_filter(self.bloom_filter_bits as f64, false);
        table.set_block_size(16 << 10);

        let mut opts = Options::default();
        opts.set_block_based_table_factory(&table);
        opts.set_write_buffer_size(self.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        // Snapshots are LZ4 frames already; compressing them again is wasted work.
        opts.set_compression_type(match name {
            CF_DOCUMENTS => DBCompressionType::None,
            _ => DBCompressionType::Lz4,
        });
        ColumnFamilyDescriptor::new(name, opts)
    }
}

/// Bookkeeping kept next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Distinct snapshots written so far.
    pub version: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Unix seconds.
    pub created_at: u64,
    /// Unix seconds.
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn first(doc_id: Uuid) -> Self {
        let now = unix_now();
        Self {
            doc_id,
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(meta, _)| meta)
            .map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    Database(String),
    NotFound(Uuid),
    Encode(String),
    Decode(String),
    /// Stored snapshot frame failed to decompress.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "RocksDB: {e}"),
            Self::NotFound(id) => write!(f, "No snapshot stored for {id}"),
            Self::Encode(e) => write!(f, "Metadata encode failed: {e}"),
            Self::Decode(e) => write!(f, "Metadata decode failed: {e}"),
            Self::Corrupt(e) => write!(f, "Corrupt snapshot frame: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        Self::Database(e.into_string())
    }
}

/// One compressed snapshot per document.
///
/// Clones share the same database handle.
#[derive(Clone)]
pub struct RocksSnapshotStore {
    db: Arc<DB>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open (or create) the database at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let cache = Cache::new_lru_cache(config.block_cache_size);
        let families = [CF_DOCUMENTS, CF_METADATA].map(|name| config.column_family(name, &cache));
        let db = DB::open_cf_descriptors(&config.db_options(), &config.path, families)?;
        log::info!("Snapshot store opened at {}", config.path.display());
        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    /// Store `snapshot` for `doc_id`, replacing the previous one.
    pub fn save_snapshot(
        &self,
        doc_id: Uuid,
        snapshot: &[u8],
    ) -> Result<DocumentMetadata, StoreError> {
        let key = doc_id.as_bytes();
        let frame = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = match self.load_metadata(doc_id) {
            Ok(meta) => {
                let stored = self.db.get_pinned_cf(self.handle(CF_DOCUMENTS)?, key)?;
                if stored.as_deref() == Some(frame.as_slice()) {
                    log::trace!("Snapshot of {doc_id} unchanged");
                    return Ok(meta);
                }
                meta
            }
            Err(StoreError::NotFound(_)) => DocumentMetadata::first(doc_id),
            Err(e) => return Err(e),
        };
        meta.version += 1;
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = frame.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.handle(CF_DOCUMENTS)?, key, &frame);
        batch.put_cf(self.handle(CF_METADATA)?, key, meta.to_bytes()?);
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &opts)?;

        log::debug!(
            "Stored snapshot v{} of {doc_id} ({} bytes, {} on disk)",
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    pub fn load_snapshot(&self, doc_id: Uuid) -> Result<Vec<u8>, StoreError> {
        let frame = self
            .db
            .get_pinned_cf(self.handle(CF_DOCUMENTS)?, doc_id.as_bytes())?
            .ok_or(StoreError::NotFound(doc_id))?;
        lz4_flex::decompress_size_prepended(&frame).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        let meta = self.db.get_pinned_cf(self.handle(CF_METADATA)?, doc_id.as_bytes())?;
        Ok(meta.is_some())
    }

    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.handle(CF_DOCUMENTS)?, doc_id.as_bytes());
        batch.delete_cf(self.handle(CF_METADATA)?, doc_id.as_bytes());
        self.db.write(batch)?;
        log::debug!("Deleted snapshot of {doc_id}");
        Ok(())
    }

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        let bytes = self
            .db
            .get_pinned_cf(self.handle(CF_METADATA)?, doc_id.as_bytes())?
            .ok_or(StoreError::NotFound(doc_id))?;
        DocumentMetadata::from_bytes(&bytes)
    }

    /// Every document with a stored snapshot.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        self.db
            .iterator_cf(self.handle(CF_METADATA)?, IteratorMode::Start)
            .map(|item| {
                let (key, _) = item?;
                Uuid::from_slice(&key).map_err(|e| StoreError::Decode(e.to_string()))
            })
            .collect()
    }

    /// Flush memtables.
    pub fn sync(&self) -> Result<(), StoreError> {
        Ok(self.db.flush()?)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn handle(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
