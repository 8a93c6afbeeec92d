use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::chunk::SharedChunk;
use super::position::ChunkPos;

/// Map from packed chunk key to resident chunk.
pub type ChunkMap = HashMap<u64, SharedChunk>;

/// The set of chunks currently in memory, behind one read/write lock.
///
/// Point lookups take the read side. Inserts, removals and the per-tick
/// eviction scan take the write side; the scan holds it for the whole pass,
/// so readers on other threads must not assume a stable view across calls.
pub struct ChunkStore {
    chunks: RwLock<ChunkMap>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a resident chunk. Never returns a chunk after it was removed.
    pub fn get(&self, pos: ChunkPos) -> Option<SharedChunk> {
        self.chunks
            .read()
            .expect("chunk store poisoned")
            .get(&pos.key())
            .cloned()
    }

    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.chunks
            .read()
            .expect("chunk store poisoned")
            .contains_key(&pos.key())
    }

    /// Insert a chunk unless one is already resident at its position.
    /// Returns whichever chunk ends up resident.
    pub fn insert_if_absent(&self, chunk: SharedChunk) -> SharedChunk {
        let mut chunks = self.chunks.write().expect("chunk store poisoned");
        chunks.entry(chunk.pos().key()).or_insert(chunk).clone()
    }

    /// Insert or replace. The replaced chunk (if any) is invalidated.
    pub fn insert(&self, chunk: SharedChunk) -> Option<SharedChunk> {
        let previous = self
            .chunks
            .write()
            .expect("chunk store poisoned")
            .insert(chunk.pos().key(), chunk);
        if let Some(old) = &previous {
            old.invalidate();
        }
        previous
    }

    /// Remove a chunk and invalidate it.
    pub fn remove(&self, pos: ChunkPos) -> Option<SharedChunk> {
        let removed = self
            .chunks
            .write()
            .expect("chunk store poisoned")
            .remove(&pos.key());
        if let Some(chunk) = &removed {
            chunk.invalidate();
        }
        removed
    }

    /// Shared access held across several lookups. Nothing can be inserted or
    /// removed while the guard lives; do not take the store lock again on the
    /// same thread until it is dropped.
    pub fn read(&self) -> RwLockReadGuard<'_, ChunkMap> {
        self.chunks.read().expect("chunk store poisoned")
    }

    /// Exclusive access for multi-step passes (tick, eviction, shutdown).
    pub fn write(&self) -> RwLockWriteGuard<'_, ChunkMap> {
        self.chunks.write().expect("chunk store poisoned")
    }

    /// Clone out every resident chunk. The result is a point-in-time copy.
    pub fn snapshot(&self) -> Vec<SharedChunk> {
        self.chunks
            .read()
            .expect("chunk store poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn positions(&self) -> Vec<ChunkPos> {
        self.chunks
            .read()
            .expect("chunk store poisoned")
            .keys()
            .map(|&k| ChunkPos::from_key(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.read().expect("chunk store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::world::chunk::{Chunk, ChunkContent};

    #[test]
    fn removed_chunks_are_invalid_and_unreachable() {
        let store = ChunkStore::new();
        let pos = ChunkPos::new(3, -4);
        store.insert(Chunk::shared(pos, ChunkContent::new_empty()));

        let chunk = store.get(pos).expect("resident");
        let removed = store.remove(pos).expect("removed");
        assert!(Arc::ptr_eq(&chunk, &removed));
        assert!(!chunk.is_valid());
        assert!(store.get(pos).is_none());
    }

    #[test]
    fn insert_if_absent_keeps_first() {
        let store = ChunkStore::new();
        let pos = ChunkPos::new(0, 0);
        let first = store.insert_if_absent(Chunk::shared(pos, ChunkContent::new_empty()));
        let second = store.insert_if_absent(Chunk::shared(pos, ChunkContent::new_empty()));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);
    }
}
