pub mod block;
pub mod chunk;
pub mod loader;
pub mod position;
pub mod storage;
pub mod store;
pub mod view;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use block::Block;
use chunk::SharedChunk;
use loader::ChunkLoader;
use position::{BlockPos, ChunkPos};
use storage::{ChunkGenerator, ChunkListener, ChunkStorage};
use store::{ChunkMap, ChunkStore};
use view::{ViewRegion, ViewTracker, ViewerId, ViewerKind};

use crate::error::ChunkError;

/// Immutable world parameters, fixed at startup.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    pub seed: u64,
    pub ticks_per_second: u32,
    /// Chunks visible on each side of a viewer's chunk.
    pub view_distance: u32,
    /// Ticks a chunk must go unseen before it may be evicted. `None` means
    /// five seconds' worth of ticks.
    pub eviction_ticks: Option<u64>,
    /// In-world seconds per real second.
    pub time_scale: f64,
    /// Length of one in-world day, in in-world seconds.
    pub day_length: f64,
    pub spawn: BlockPos,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            ticks_per_second: 20,
            view_distance: 4,
            eviction_ticks: None,
            time_scale: 72.0,
            day_length: 86_400.0,
            spawn: BlockPos::new(0, 0),
        }
    }
}

impl WorldConfig {
    pub fn eviction_threshold(&self) -> u64 {
        self.eviction_ticks
            .unwrap_or(5 * self.ticks_per_second as u64)
    }
}

/// What one main tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub ticked: usize,
    pub evicted: usize,
    /// Invalid chunks found resident and dropped.
    pub purged: usize,
    /// Evictions postponed because the save failed.
    pub save_failures: usize,
}

/// The world: resident chunks, the loader that fills them, and the viewers
/// that keep them alive.
///
/// The world owns its store by value; everything else refers to chunks by
/// coordinate.
pub struct World {
    config: WorldConfig,
    store: ChunkStore,
    loader: ChunkLoader,
    views: RwLock<ViewTracker>,
    tick: AtomicU64,
    time_of_day: RwLock<f64>,
}

impl World {
    pub fn new(
        config: WorldConfig,
        generator: Arc<dyn ChunkGenerator>,
        storage: Arc<dyn ChunkStorage>,
        listener: Arc<dyn ChunkListener>,
    ) -> Self {
        let loader = ChunkLoader::new(config.seed, generator, storage, listener);
        let mut views = ViewTracker::new(config.view_distance);
        views.set_spawn(config.spawn);
        Self {
            config,
            store: ChunkStore::new(),
            loader,
            views: RwLock::new(views),
            tick: AtomicU64::new(0),
            time_of_day: RwLock::new(0.0),
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn loader(&self) -> &ChunkLoader {
        &self.loader
    }

    /// The most recent main tick processed.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub fn time_of_day(&self) -> f64 {
        *self.time_of_day.read().expect("world clock poisoned")
    }

    pub fn set_persistence(&self, allowed: bool) {
        self.loader.set_may_persist(allowed);
    }

    // ── Chunk access ────────────────────────────────────────────────────

    pub fn get_chunk(&self, pos: ChunkPos) -> Option<SharedChunk> {
        self.store.get(pos)
    }

    /// Blocking load; see [`ChunkLoader::ensure_loaded`].
    pub fn ensure_loaded(&self, pos: ChunkPos) -> Result<SharedChunk, ChunkError> {
        self.loader
            .ensure_loaded(&self.store, pos, self.current_tick())
    }

    pub fn unload(&self, pos: ChunkPos) -> Result<bool, ChunkError> {
        self.loader.unload(&self.store, pos)
    }

    /// Read a block. `None` when its chunk is not resident.
    pub fn get_block(&self, pos: BlockPos) -> Option<Block> {
        self.blocks().get(pos)
    }

    /// Write a block into a resident chunk, returning the old value.
    /// `None` (and no write) when the chunk is not resident.
    pub fn set_block(&self, pos: BlockPos, block: Block) -> Option<Block> {
        self.blocks().set(pos, block)
    }

    /// Block access pinned to the current set of resident chunks. Edits made
    /// through it cannot race with eviction.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            chunks: self.store.read(),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.store.len()
    }

    // ── Viewers ─────────────────────────────────────────────────────────

    pub fn add_viewer(&self, kind: ViewerKind, at: BlockPos) -> ViewerId {
        self.views
            .write()
            .expect("view tracker poisoned")
            .add_viewer(kind, at)
    }

    pub fn move_viewer(&self, id: ViewerId, to: BlockPos) -> bool {
        self.views
            .write()
            .expect("view tracker poisoned")
            .move_viewer(id, to)
    }

    pub fn remove_viewer(&self, id: ViewerId) {
        self.views
            .write()
            .expect("view tracker poisoned")
            .remove_viewer(id);
    }

    pub fn viewer_region(&self, id: ViewerId) -> Option<ViewRegion> {
        self.views
            .read()
            .expect("view tracker poisoned")
            .viewer(id)
            .map(|v| v.region)
    }

    pub fn set_view_distance(&self, distance: u32) {
        self.views
            .write()
            .expect("view tracker poisoned")
            .set_view_distance(distance);
    }

    pub fn view_distance(&self) -> u32 {
        self.views.read().expect("view tracker poisoned").view_distance()
    }

    pub fn active_regions(&self) -> Vec<ViewRegion> {
        self.views
            .read()
            .expect("view tracker poisoned")
            .active_regions()
    }

    /// Viewed coordinates that are not resident, nearest to a viewer first.
    pub fn missing_chunks(&self) -> Vec<ChunkPos> {
        let mut missing = Vec::new();
        for region in self.active_regions() {
            for pos in region.positions_nearest_first() {
                if !self.store.contains(pos) && !missing.contains(&pos) {
                    missing.push(pos);
                }
            }
        }
        missing
    }

    // ── Ticking ─────────────────────────────────────────────────────────

    /// One main tick.
    ///
    /// Under the store's write lock: drop invalid chunks, refresh last-viewed
    /// stamps and pick eviction candidates. Candidates are then saved with
    /// the lock released. Back under the write lock, every candidate that is
    /// still clean is removed, and what remains is ticked.
    pub fn tick_main(&self, tick: u64) -> TickReport {
        self.tick.store(tick, Ordering::Release);
        let regions = self.active_regions();
        let viewed = |pos: ChunkPos| regions.iter().any(|r| r.contains(pos));
        let threshold = self.config.eviction_threshold();
        let mut report = TickReport::default();

        let candidates: Vec<SharedChunk> = {
            let mut chunks = self.store.write();
            chunks.retain(|_, chunk| {
                if !chunk.is_valid() {
                    tracing::warn!("Invalid chunk {} was still resident, dropping it", chunk.pos());
                    report.purged += 1;
                    return false;
                }
                if viewed(chunk.pos()) {
                    chunk.touch(tick);
                }
                true
            });
            chunks
                .values()
                .filter(|c| !viewed(c.pos()) && is_evictable(c, tick, threshold))
                .cloned()
                .collect()
        };

        let mut saved = Vec::with_capacity(candidates.len());
        for chunk in candidates {
            match self.loader.persist(&chunk) {
                Ok(_) => saved.push(chunk),
                Err(e) => {
                    tracing::error!("Keeping chunk {} resident, save failed: {}", chunk.pos(), e);
                    report.save_failures += 1;
                }
            }
        }

        let mut evicted = Vec::new();
        {
            let mut chunks = self.store.write();
            let persisting = self.loader.may_persist();
            for chunk in saved {
                let key = chunk.pos().key();
                if !chunks.get(&key).is_some_and(|c| Arc::ptr_eq(c, &chunk)) {
                    continue;
                }
                if chunk.is_dirty() {
                    if persisting {
                        // Edited while its snapshot was written; next tick saves again.
                        continue;
                    }
                    tracing::warn!("Dropping unsaved chunk {} (persistence disabled)", chunk.pos());
                }
                chunks.remove(&key);
                chunk.invalidate();
                evicted.push(chunk.pos());
            }

            for chunk in chunks.values() {
                chunk.tick();
            }
            report.ticked = chunks.len();
        }

        report.evicted = evicted.len();
        for pos in evicted {
            self.loader.listener().chunk_unloaded(pos);
        }
        report
    }

    /// One rare tick: slow per-chunk maintenance, and advance the in-world
    /// clock by `elapsed_secs × time_scale`.
    pub fn tick_rare(&self, elapsed_secs: f64) {
        for chunk in self.store.snapshot() {
            if chunk.is_valid() {
                chunk.tick_rare();
            }
        }
        let mut time = self.time_of_day.write().expect("world clock poisoned");
        *time = (*time + elapsed_secs * self.config.time_scale).rem_euclid(self.config.day_length);
    }

    /// Persist every dirty resident chunk. Returns how many were written.
    /// A failed save does not stop the others; the first error is returned
    /// once all were attempted.
    pub fn save_all(&self) -> Result<usize, ChunkError> {
        self.persist_each(&self.store.snapshot())
    }

    /// Save everything, then drop every chunk. Saving and removal happen
    /// under one write lock, so no edit slips in between. Chunks whose save
    /// failed are dropped too; the first error is returned.
    pub fn shutdown(&self) -> Result<usize, ChunkError> {
        let (result, drained) = {
            let mut chunks = self.store.write();
            let resident: Vec<SharedChunk> = chunks.drain().map(|(_, c)| c).collect();
            let result = self.persist_each(&resident);
            for chunk in &resident {
                chunk.invalidate();
            }
            (result, resident)
        };
        for chunk in drained {
            self.loader.listener().chunk_unloaded(chunk.pos());
        }
        result
    }

    fn persist_each(&self, chunks: &[SharedChunk]) -> Result<usize, ChunkError> {
        let mut saved = 0;
        let mut first_error = None;
        for chunk in chunks {
            match self.loader.persist(chunk) {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Could not save chunk {}: {}", chunk.pos(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }
}

/// Block reads and writes under the store's read lock. While it lives no
/// chunk can be inserted, evicted or unloaded, so a write it reports as
/// done is in a resident chunk and will be saved with it. Do not call back
/// into the [`World`] while holding one.
pub struct Blocks<'a> {
    chunks: RwLockReadGuard<'a, ChunkMap>,
}

impl Blocks<'_> {
    pub fn get(&self, pos: BlockPos) -> Option<Block> {
        self.chunks
            .get(&pos.chunk().key())
            .map(|chunk| chunk.get_block(pos.local()))
    }

    pub fn set(&self, pos: BlockPos, block: Block) -> Option<Block> {
        self.chunks
            .get(&pos.chunk().key())
            .map(|chunk| chunk.set_block(pos.local(), block))
    }
}

/// Eviction rule for a chunk outside every view region: it must allow
/// unloading, have finished its feature pass, and have gone unseen for at
/// least `threshold` ticks.
pub fn is_evictable(chunk: &chunk::Chunk, tick: u64, threshold: u64) -> bool {
    chunk.allows_unload()
        && chunk.is_decorated()
        && tick.saturating_sub(chunk.last_viewed()) >= threshold
}
