//! In-process mesh store.
//!
//! Used when the server runs without a storage path, and by tests that need
//! to count writes or simulate an unavailable backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use super::{MeshStore, StoreError};
use crate::mesh::MeshState;

#[derive(Default)]
pub struct MemoryMeshStore {
    meshes: RwLock<HashMap<String, MeshState>>,
    loads: AtomicU64,
    writes: AtomicU64,
    clears: AtomicU64,
    failing: AtomicBool,
}

impl MemoryMeshStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stored mesh, bypassing counters and failure injection.
    pub fn get(&self, session_id: &str) -> Option<MeshState> {
        self.meshes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    /// Seed a mesh without counting a write.
    pub fn insert(&self, session_id: impl Into<String>, mesh: MeshState) {
        self.meshes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.into(), mesh);
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> u64 {
        self.clears.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("store unavailable".into()));
        }
        Ok(())
    }
}

impl MeshStore for MemoryMeshStore {
    fn load(&self, session_id: &str) -> Result<Option<MeshState>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.get(session_id))
    }

    fn store(&self, session_id: &str, mesh: &MeshState) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.insert(session_id, mesh.clone());
        Ok(())
    }

    fn clear(&self, session_id: &str) -> Result<(), StoreError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.meshes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        Ok(())
    }

    fn is_blocking(&self) -> bool {
        false
    }
}
