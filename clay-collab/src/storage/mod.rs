//! Persistence gateway for session meshes.
//!
//! ```text
//! ┌───────────────┐  load / store / clear   ┌──────────────────┐
//! │ SessionEngine │ ──────────────────────► │ dyn MeshStore    │
//! │ (in-memory)   │   keyed by session id   ├──────────────────┤
//! └───────────────┘                         │ RocksMeshStore   │
//!                                           │ MemoryMeshStore  │
//!                                           └──────────────────┘
//! ```
//!
//! Writes are full-state overwrites, so a repeated or reordered write is
//! harmless. The engine treats every error as non-fatal: failed loads fall
//! back to the default mesh, failed writes are logged and retried on the
//! next debounce window.

pub mod memory;
pub mod rocks;

pub use memory::MemoryMeshStore;
pub use rocks::{MeshMetadata, RocksMeshStore, StoreConfig};

use thiserror::Error;

use crate::mesh::MeshState;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend error (RocksDB or injected failure)
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Key-value persistence of one mesh per session.
///
/// Implementations must tolerate concurrent calls for different sessions.
pub trait MeshStore: Send + Sync {
    /// Load the persisted mesh, `Ok(None)` when nothing is stored.
    fn load(&self, session_id: &str) -> Result<Option<MeshState>, StoreError>;

    /// Overwrite the persisted mesh.
    fn store(&self, session_id: &str, mesh: &MeshState) -> Result<(), StoreError>;

    /// Remove the persisted mesh. Clearing a missing entry is not an error.
    fn clear(&self, session_id: &str) -> Result<(), StoreError>;

    /// Whether calls may block on disk or network.
    fn is_blocking(&self) -> bool {
        true
    }
}
