//! RocksDB-backed document store.
//!
//! Column families:
//! - `metadata` — per-document header (bincode: type, op count, chunk count, timestamps)
//! - `history`  — operation chunks (LZ4-compressed JSON), keyed `<doc_id>\0<chunk:8 bytes BE>`
//!
//! `save` rewrites a document as a single chunk; every relay `append`
//! adds one chunk. `load` concatenates the chunks in key order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use syncgraph_core::{Operation, PersistedDocument};

use super::{DocumentStore, StoreError};

const CF_METADATA: &str = "metadata";
const CF_HISTORY: &str = "history";

const COLUMN_FAMILIES: &[&str] = &[CF_METADATA, CF_HISTORY];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("syncgraph_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
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

/// Per-document header stored in `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    pub doc_type: String,
    /// Total operations across all chunks
    pub op_count: u64,
    /// Number of history chunks; also the index of the next one
    pub chunk_count: u64,
    /// Compressed bytes across all chunks
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &str, doc_type: &str) -> Self {
        let now = now_secs();
        Self {
            doc_id: doc_id.to_string(),
            doc_type: doc_type.to_string(),
            op_count: 0,
            chunk_count: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`DocumentStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode; callers share it via `Arc`)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of metadata
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
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

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
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
            CF_METADATA => {
                // Small values, point lookups
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_HISTORY => {
                // Values are already LZ4 compressed
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Header for `doc_id`, if stored.
    pub fn metadata(&self, doc_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// `<doc_id>\0`, the key prefix of a document's chunks.
    fn chunk_prefix(doc_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(doc_id.len() + 1);
        prefix.extend_from_slice(doc_id.as_bytes());
        prefix.push(0);
        prefix
    }

    fn chunk_key(doc_id: &str, chunk: u64) -> Vec<u8> {
        let mut key = Self::chunk_prefix(doc_id);
        key.extend_from_slice(&chunk.to_be_bytes());
        key
    }

    /// Keys and values of `doc_id`'s chunks, in chunk order.
    fn chunks(&self, doc_id: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_HISTORY)?;
        let prefix = Self::chunk_prefix(doc_id);
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }
}

fn encode_chunk(operations: &[Operation]) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(operations).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_chunk(bytes: &[u8]) -> Result<Vec<Operation>, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

impl DocumentStore for RocksStore {
    fn load(&self, doc_id: &str) -> Result<Option<PersistedDocument>, StoreError> {
        let Some(meta) = self.metadata(doc_id)? else {
            return Ok(None);
        };
        let mut history = Vec::with_capacity(meta.op_count as usize);
        for (_, value) in self.chunks(doc_id)? {
            history.extend(decode_chunk(&value)?);
        }
        Ok(Some(PersistedDocument {
            id: meta.doc_id,
            doc_type: meta.doc_type,
            history,
        }))
    }

    fn save(&self, doc: &PersistedDocument) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_history = self.cf(CF_HISTORY)?;

        let compressed = encode_chunk(&doc.history)?;
        let mut meta = match self.metadata(&doc.id)? {
            Some(existing) => DocumentMetadata {
                doc_type: doc.doc_type.clone(),
                created_at: existing.created_at,
                ..DocumentMetadata::new(&doc.id, &doc.doc_type)
            },
            None => DocumentMetadata::new(&doc.id, &doc.doc_type),
        };
        meta.op_count = doc.history.len() as u64;
        meta.chunk_count = 1;
        meta.compressed_size = compressed.len() as u64;

        // Atomic batch: drop old chunks, write one chunk and the header.
        let mut batch = WriteBatch::default();
        for (key, _) in self.chunks(&doc.id)? {
            batch.delete_cf(cf_history, &key);
        }
        batch.put_cf(cf_history, Self::chunk_key(&doc.id, 0), &compressed);
        batch.put_cf(cf_meta, doc.id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "saved {} ({} ops, {} bytes)",
            doc.id,
            meta.op_count,
            meta.compressed_size
        );
        Ok(())
    }

    fn append(&self, doc_id: &str, operations: &[Operation]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_history = self.cf(CF_HISTORY)?;

        let mut meta = self
            .metadata(doc_id)?
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?;
        let compressed = encode_chunk(operations)?;
        let key = Self::chunk_key(doc_id, meta.chunk_count);

        meta.chunk_count += 1;
        meta.op_count += operations.len() as u64;
        meta.compressed_size += compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_history, key, &compressed);
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(meta.op_count as usize)
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn delete(&self, doc_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.metadata(doc_id)?.is_none() {
            return Ok(false);
        }
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_history = self.cf(CF_HISTORY)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_meta, doc_id.as_bytes());
        for (key, _) in self.chunks(doc_id)? {
            batch.delete_cf(cf_history, &key);
        }
        self.db.write_opt(batch, &self.write_options())?;
        log::debug!("deleted {doc_id}");
        Ok(true)
    }
}
