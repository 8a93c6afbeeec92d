//! Turning a requested coordinate into a resident chunk.
//!
//! `ensure_loaded` checks the store, then persisted snapshots, then the
//! generator. Loads are serialized per coordinate: concurrent callers for the
//! same position queue on one in-flight gate, and everyone after the first
//! finds the chunk already resident when they get through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use super::chunk::{Chunk, SharedChunk};
use super::position::{ChunkPos, LocalBlockPos};
use super::storage::{ChunkGenerator, ChunkListener, ChunkStorage, LoadOrigin};
use super::store::ChunkStore;
use crate::error::ChunkError;

pub struct ChunkLoader {
    seed: u64,
    generator: Arc<dyn ChunkGenerator>,
    storage: Arc<dyn ChunkStorage>,
    listener: Arc<dyn ChunkListener>,
    in_flight: DashMap<ChunkPos, Arc<Mutex<()>>>,
    may_persist: AtomicBool,
}

impl ChunkLoader {
    pub fn new(
        seed: u64,
        generator: Arc<dyn ChunkGenerator>,
        storage: Arc<dyn ChunkStorage>,
        listener: Arc<dyn ChunkListener>,
    ) -> Self {
        Self {
            seed,
            generator,
            storage,
            listener,
            in_flight: DashMap::new(),
            may_persist: AtomicBool::new(true),
        }
    }

    pub fn generator(&self) -> &Arc<dyn ChunkGenerator> {
        &self.generator
    }

    pub fn listener(&self) -> &Arc<dyn ChunkListener> {
        &self.listener
    }

    /// Whether snapshots may be written at all (gated by the world lock).
    pub fn may_persist(&self) -> bool {
        self.may_persist.load(Ordering::Acquire)
    }

    pub fn set_may_persist(&self, allowed: bool) {
        self.may_persist.store(allowed, Ordering::Release);
    }

    /// Number of coordinates with a load currently running or queued.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Return the resident chunk at `pos`, loading or generating it first if
    /// needed. Blocks on disk I/O and generation: never call this from the
    /// simulation thread.
    pub fn ensure_loaded(
        &self,
        store: &ChunkStore,
        pos: ChunkPos,
        now: u64,
    ) -> Result<SharedChunk, ChunkError> {
        if let Some(chunk) = store.get(pos) {
            return Ok(chunk);
        }

        // Clone the gate out so the DashMap shard lock is released before we
        // block on the gate itself.
        let gate = self
            .in_flight
            .entry(pos)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _held = gate.lock().unwrap_or_else(PoisonError::into_inner);
            match store.get(pos) {
                Some(chunk) => Ok(chunk),
                None => self.load_uncached(store, pos, now),
            }
        };

        self.in_flight.remove_if(&pos, |_, g| Arc::ptr_eq(g, &gate));
        result
    }

    fn load_uncached(
        &self,
        store: &ChunkStore,
        pos: ChunkPos,
        now: u64,
    ) -> Result<SharedChunk, ChunkError> {
        let (chunk, origin) = match self.storage.load(pos)? {
            Some(content) => {
                let chunk = Chunk::shared(pos, content);
                // Snapshots are written after the feature pass.
                chunk.mark_decorated();
                (chunk, LoadOrigin::Disk)
            }
            None => {
                let content = self.generator.generate(self.seed, pos);
                (Chunk::shared(pos, content), LoadOrigin::Generated)
            }
        };
        chunk.touch(now);

        let resident = store.insert_if_absent(Arc::clone(&chunk));
        if !Arc::ptr_eq(&resident, &chunk) {
            // Someone inserted directly (e.g. a network snapshot); theirs wins.
            tracing::debug!("Chunk {} appeared during load, discarding ours", pos);
            return Ok(resident);
        }

        tracing::trace!("Chunk {} resident ({:?})", pos, origin);
        self.listener.chunk_loaded(&resident, origin);
        if origin == LoadOrigin::Generated {
            self.schedule_features(Arc::clone(&resident));
        }
        Ok(resident)
    }

    /// Run the generator's feature pass on the rayon pool.
    fn schedule_features(&self, chunk: SharedChunk) {
        let generator = Arc::clone(&self.generator);
        let seed = self.seed;
        rayon::spawn(move || {
            if !chunk.is_valid() {
                return;
            }
            let mut content = chunk.snapshot();
            let before = content.clone();
            generator.decorate(seed, chunk.pos(), &mut content);
            if content != before {
                chunk.edit(|c| {
                    // Only overwrite cells the feature pass changed, so edits
                    // made meanwhile survive.
                    for (i, (new, old)) in content.blocks().iter().zip(before.blocks()).enumerate() {
                        if new != old {
                            c.set(LocalBlockPos::from_index(i), *new);
                        }
                    }
                });
            }
            chunk.mark_decorated();
        });
    }

    /// Write the chunk's snapshot if it is dirty and persistence is allowed.
    /// Returns whether anything was written.
    pub fn persist(&self, chunk: &Chunk) -> Result<bool, ChunkError> {
        if !self.may_persist() {
            return Ok(false);
        }
        let _saving = chunk.save_guard();
        if !chunk.take_dirty() {
            return Ok(false);
        }
        let snapshot = chunk.snapshot();
        if let Err(e) = self.storage.save(chunk.pos(), &snapshot) {
            chunk.mark_dirty();
            return Err(e);
        }
        Ok(true)
    }

    /// Persist (if dirty) and remove one chunk. Returns whether it was
    /// resident. On a failed save the chunk stays resident.
    pub fn unload(&self, store: &ChunkStore, pos: ChunkPos) -> Result<bool, ChunkError> {
        let mut chunks = store.write();
        let Some(chunk) = chunks.get(&pos.key()).cloned() else {
            return Ok(false);
        };
        self.persist(&chunk)?;
        chunks.remove(&pos.key());
        drop(chunks);

        chunk.invalidate();
        self.listener.chunk_unloaded(pos);
        Ok(true)
    }
}
