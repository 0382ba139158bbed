//! RocksDB-backed mesh store.
//!
//! Column families:
//! - `meshes`  : bincode-encoded [`MeshState`], LZ4 compressed, keyed by session id
//! - `metadata`: [`MeshMetadata`] (bincode), same key
//!
//! Mesh and metadata are always written and deleted together in one
//! atomic write batch.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{MeshStore, StoreError};
use crate::mesh::MeshState;

const CF_MESHES: &str = "meshes";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_MESHES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("clay_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
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

/// Bookkeeping stored next to each mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshMetadata {
    pub session_id: String,
    /// Number of writes since the entry was created
    pub write_count: u64,
    pub vertex_count: u64,
    /// Encoded size before compression
    pub encoded_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl MeshMetadata {
    fn new(session_id: &str) -> Self {
        let now = unix_now();
        Self {
            session_id: session_id.to_string(),
            write_count: 0,
            vertex_count: 0,
            encoded_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`MeshStore`].
pub struct RocksMeshStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksMeshStore {
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
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed by us
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Metadata for a stored session, `Ok(None)` if absent.
    pub fn load_metadata(&self, session_id: &str) -> Result<Option<MeshMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, session_id.as_bytes())? {
            Some(bytes) => Ok(Some(MeshMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All session ids with a persisted mesh.
    pub fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
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
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl MeshStore for RocksMeshStore {
    fn load(&self, session_id: &str) -> Result<Option<MeshState>, StoreError> {
        let cf = self.cf(CF_MESHES)?;
        let Some(compressed) = self.db.get_cf(&cf, session_id.as_bytes())? else {
            return Ok(None);
        };
        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (mesh, _) = bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(mesh))
    }

    fn store(&self, session_id: &str, mesh: &MeshState) -> Result<(), StoreError> {
        let cf_meshes = self.cf(CF_MESHES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = bincode::serde::encode_to_vec(mesh, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_metadata(session_id)?
            .unwrap_or_else(|| MeshMetadata::new(session_id));
        meta.write_count += 1;
        meta.vertex_count = mesh.vertex_count() as u64;
        meta.encoded_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_meshes, session_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, session_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        let cf_meshes = self.cf(CF_MESHES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_meshes, session_id.as_bytes());
        batch.delete_cf(&cf_meta, session_id.as_bytes());
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
