//! Seams to the outside world: where chunk content comes from and where it
//! goes. The engine never touches the filesystem or noise functions itself.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::chunk::{ChunkContent, SharedChunk};
use super::position::ChunkPos;
use crate::error::ChunkError;

/// Identifies a biome. Meaning is assigned by the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BiomeId(pub u16);

/// Procedural content source. Pure with respect to world state.
pub trait ChunkGenerator: Send + Sync + 'static {
    /// Base terrain for one chunk.
    fn generate(&self, seed: u64, pos: ChunkPos) -> ChunkContent;

    /// Surface height of the column at `world_x`.
    fn height(&self, seed: u64, world_x: i64) -> i64;

    fn biome(&self, seed: u64, world_x: i64) -> BiomeId;

    /// Feature pass (trees, ores...) run after the chunk is resident.
    fn decorate(&self, _seed: u64, _pos: ChunkPos, _content: &mut ChunkContent) {}
}

/// Persisted chunk snapshots.
pub trait ChunkStorage: Send + Sync + 'static {
    /// `Ok(None)` when nothing was ever saved for `pos`.
    fn load(&self, pos: ChunkPos) -> Result<Option<ChunkContent>, ChunkError>;

    fn save(&self, pos: ChunkPos, content: &ChunkContent) -> Result<(), ChunkError>;
}

/// How a chunk became resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOrigin {
    Disk,
    Generated,
}

/// Lifecycle notifications. Called outside the store lock.
pub trait ChunkListener: Send + Sync + 'static {
    fn chunk_loaded(&self, _chunk: &SharedChunk, _origin: LoadOrigin) {}

    fn chunk_unloaded(&self, _pos: ChunkPos) {}
}

/// Listener that ignores everything.
pub struct NoopListener;

impl ChunkListener for NoopListener {}

/// Storage that keeps snapshots in memory. Used by the thin client (which
/// never persists) and by tests.
pub struct MemoryStorage {
    chunks: DashMap<ChunkPos, ChunkContent>,
    loads: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            chunks: DashMap::new(),
            loads: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, pos: ChunkPos, content: ChunkContent) {
        self.chunks.insert(pos, content);
    }

    pub fn contains(&self, pos: ChunkPos) -> bool {
        self.chunks.contains_key(&pos)
    }

    pub fn get(&self, pos: ChunkPos) -> Option<ChunkContent> {
        self.chunks.get(&pos).map(|c| c.clone())
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkStorage for MemoryStorage {
    fn load(&self, pos: ChunkPos) -> Result<Option<ChunkContent>, ChunkError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(pos))
    }

    fn save(&self, pos: ChunkPos, content: &ChunkContent) -> Result<(), ChunkError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.chunks.insert(pos, content.clone());
        Ok(())
    }
}
