//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents`: full document states (LZ4 compressed), keyed by `tenant/document`
//! - `metadata`: [`DocumentMetadata`] (bincode), same key
//!
//! Snapshot and metadata are written in one atomic batch. RocksDB calls are
//! blocking, so the [`SnapshotStore`] impl runs them on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use tandem_core::DocumentId;

use super::{SnapshotStore, StoreError, StoredSnapshot};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: DocumentId,
    /// Engine version of the stored state
    pub version: u64,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: DocumentId) -> Self {
        let now = unix_now();
        Self {
            document_id,
            version: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Corrupted(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Corrupted(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

type Db = DBWithThreadMode<SingleThreaded>;

/// RocksDB-backed snapshot store. Cheap to clone.
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<Db>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Save a full document state with its engine version.
    ///
    /// A save with a version older than the stored one is ignored and
    /// returns the stored metadata.
    pub fn save(
        &self,
        document_id: &DocumentId,
        state: &[u8],
        version: u64,
    ) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = document_id.storage_key();

        let mut meta = match self.metadata(document_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(document_id.clone()),
            Err(e) => return Err(e),
        };
        if meta.version > version {
            log::debug!(
                "Skipping stale snapshot for {document_id}: v{version} < stored v{}",
                meta.version
            );
            return Ok(meta);
        }

        let compressed = lz4_flex::compress_prepend_size(state);
        meta.version = version;
        meta.snapshot_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, &key, &compressed);
        batch.put_cf(&cf_meta, &key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load a document state (decompressed) and its version.
    pub fn load(&self, document_id: &DocumentId) -> Result<StoredSnapshot, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(&cf, document_id.storage_key())?
            .ok_or_else(|| StoreError::NotFound(document_id.clone()))?;
        let state = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Corrupted(e.to_string()))?;
        let version = self.metadata(document_id)?.version;
        Ok(StoredSnapshot { state, version })
    }

    pub fn metadata(&self, document_id: &DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, document_id.storage_key())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(document_id.clone())),
        }
    }

    /// All stored document ids.
    pub fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let key = std::str::from_utf8(&key).map_err(|e| StoreError::Corrupted(e.to_string()))?;
            let id = key
                .parse::<DocumentId>()
                .map_err(|e| StoreError::Corrupted(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn delete_document(&self, document_id: &DocumentId) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = document_id.storage_key();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, &key);
        batch.delete_cf(&cf_meta, &key);
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl SnapshotStore for RocksStore {
    async fn load_snapshot(&self, document_id: &DocumentId) -> Result<StoredSnapshot, StoreError> {
        let store = self.clone();
        let id = document_id.clone();
        tokio::task::spawn_blocking(move || store.load(&id))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }

    async fn save_snapshot(
        &self,
        document_id: &DocumentId,
        state: &[u8],
        version: u64,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let id = document_id.clone();
        let state = state.to_vec();
        let meta = tokio::task::spawn_blocking(move || store.save(&id, &state, version))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))??;
        log::trace!(
            "Stored {} v{} ({} -> {} bytes)",
            meta.document_id,
            meta.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn doc(s: &str) -> DocumentId {
        s.parse().unwrap()
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let id = doc("acme/doc1");
        let data = b"Hello, Tandem! This is a test document snapshot with enough data to compress.".repeat(4);

        let meta = store.save(&id, &data, 7).unwrap();
        assert_eq!(meta.document_id, id);
        assert_eq!(meta.version, 7);
        assert_eq!(meta.snapshot_size, data.len() as u64);
        assert!(meta.compressed_size < meta.snapshot_size);

        let loaded = store.load(&id).unwrap();
        assert_eq!(loaded.state, data);
        assert_eq!(loaded.version, 7);
    }

    #[test]
    fn test_snapshot_not_found() {
        let (_dir, store) = open_temp();
        let id = doc("acme/missing");
        assert_eq!(store.load(&id), Err(StoreError::NotFound(id)));
    }

    #[test]
    fn test_stale_version_ignored() {
        let (_dir, store) = open_temp();
        let id = doc("acme/doc1");
        store.save(&id, b"newer", 5).unwrap();
        let meta = store.save(&id, b"older", 2).unwrap();
        assert_eq!(meta.version, 5);
        assert_eq!(store.load(&id).unwrap().state, b"newer".to_vec());
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, store) = open_temp();
        let a = doc("acme/a");
        let b = doc("globex/deals/b");
        store.save(&a, b"a", 1).unwrap();
        store.save(&b, b"b", 1).unwrap();

        let mut ids = store.list_documents().unwrap();
        ids.sort();
        assert_eq!(ids, vec![a.clone(), b.clone()]);

        store.delete_document(&a).unwrap();
        assert_eq!(store.list_documents().unwrap(), vec![b]);
        assert!(matches!(store.load(&a), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let id = doc("acme/doc1");
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save(&id, b"durable", 3).unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let loaded = store.load(&id).unwrap();
        assert_eq!(loaded.state, b"durable".to_vec());
        assert_eq!(loaded.version, 3);
    }

    #[tokio::test]
    async fn test_async_trait_roundtrip() {
        let (_dir, store) = open_temp();
        let id = doc("acme/doc1");
        store.save_snapshot(&id, b"via trait", 9).await.unwrap();
        let loaded = store.load_snapshot(&id).await.unwrap();
        assert_eq!(loaded.state, b"via trait".to_vec());
        assert_eq!(loaded.version, 9);
    }
}
