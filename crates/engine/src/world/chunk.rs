use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use super::block::Block;
use super::position::{ChunkPos, LocalBlockPos};

/// Number of blocks along each axis of a chunk.
pub const CHUNK_SIZE: usize = 32;
/// Total cell count in one chunk.
pub const CHUNK_AREA: usize = CHUNK_SIZE * CHUNK_SIZE;

/// The block grid of one chunk, stored row-major (`y * CHUNK_SIZE + x`).
///
/// This is plain data: it is what the generator produces, what gets
/// persisted, and what travels over the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkContent {
    blocks: Box<[Block; CHUNK_AREA]>,
}

impl ChunkContent {
    pub fn new_filled(block: Block) -> Self {
        Self {
            blocks: Box::new([block; CHUNK_AREA]),
        }
    }

    pub fn new_empty() -> Self {
        Self::new_filled(Block::AIR)
    }

    /// Build from a row-major cell list. Returns `None` unless exactly
    /// `CHUNK_AREA` cells are supplied.
    pub fn from_blocks(blocks: Vec<Block>) -> Option<Self> {
        let boxed: Box<[Block; CHUNK_AREA]> = blocks.into_boxed_slice().try_into().ok()?;
        Some(Self { blocks: boxed })
    }

    #[inline]
    pub fn get(&self, pos: LocalBlockPos) -> Block {
        self.blocks[pos.index()]
    }

    #[inline]
    pub fn set(&mut self, pos: LocalBlockPos, block: Block) -> Block {
        std::mem::replace(&mut self.blocks[pos.index()], block)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks[..]
    }

    pub fn non_air_count(&self) -> usize {
        self.blocks.iter().filter(|b| !b.is_air()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Block::is_air)
    }

    /// Highest non-air row of every column, `None` for all-air columns.
    pub fn surface(&self) -> [Option<u8>; CHUNK_SIZE] {
        let mut surface = [None; CHUNK_SIZE];
        for (x, top) in surface.iter_mut().enumerate() {
            *top = (0..CHUNK_SIZE)
                .rev()
                .find(|&y| !self.blocks[y * CHUNK_SIZE + x].is_air())
                .map(|y| y as u8);
        }
        surface
    }
}

impl Default for ChunkContent {
    fn default() -> Self {
        Self::new_empty()
    }
}

impl std::fmt::Debug for ChunkContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkContent")
            .field("non_air", &self.non_air_count())
            .finish()
    }
}

/// Handle shared between the store, loaders and tick passes. Identity
/// (`Arc::ptr_eq`) is what "the same chunk" means.
pub type SharedChunk = Arc<Chunk>;

/// A resident chunk: its content plus lifecycle bookkeeping.
///
/// All flags use interior mutability so the simulation thread can tick and
/// evict while I/O threads read content under the same `Arc`.
///
/// - `dirty`: content changed since it was last persisted.
/// - `stale`: content changed since the derived surface was last refreshed.
/// - `valid`: cleared once the chunk leaves the store; no further use allowed.
pub struct Chunk {
    pos: ChunkPos,
    content: RwLock<ChunkContent>,
    surface: RwLock<[Option<u8>; CHUNK_SIZE]>,
    dirty: AtomicBool,
    stale: AtomicBool,
    valid: AtomicBool,
    allow_unload: AtomicBool,
    decorated: AtomicBool,
    last_viewed: AtomicU64,
    ticks: AtomicU64,
    rare_ticks: AtomicU64,
    saving: Mutex<()>,
}

impl Chunk {
    pub fn new(pos: ChunkPos, content: ChunkContent) -> Self {
        let surface = content.surface();
        Self {
            pos,
            content: RwLock::new(content),
            surface: RwLock::new(surface),
            dirty: AtomicBool::new(false),
            stale: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            allow_unload: AtomicBool::new(true),
            decorated: AtomicBool::new(false),
            last_viewed: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            rare_ticks: AtomicU64::new(0),
            saving: Mutex::new(()),
        }
    }

    pub fn shared(pos: ChunkPos, content: ChunkContent) -> SharedChunk {
        Arc::new(Self::new(pos, content))
    }

    pub fn pos(&self) -> ChunkPos {
        self.pos
    }

    pub fn get_block(&self, pos: LocalBlockPos) -> Block {
        self.content().get(pos)
    }

    /// Write one cell, returning the previous value. Marks the chunk dirty
    /// only when the value actually changed.
    pub fn set_block(&self, pos: LocalBlockPos, block: Block) -> Block {
        let old = self
            .content
            .write()
            .expect("chunk content poisoned")
            .set(pos, block);
        if old != block {
            self.mark_dirty();
        }
        old
    }

    /// Borrow the content for reading. Do not hold across a `set_block` on
    /// the same thread.
    pub fn content(&self) -> RwLockReadGuard<'_, ChunkContent> {
        self.content.read().expect("chunk content poisoned")
    }

    /// Mutate the content in place and mark the chunk dirty.
    pub fn edit<R>(&self, f: impl FnOnce(&mut ChunkContent) -> R) -> R {
        let result = f(&mut self.content.write().expect("chunk content poisoned"));
        self.mark_dirty();
        result
    }

    /// Replace the whole content (used when a fresh snapshot arrives).
    pub fn replace_content(&self, content: ChunkContent) {
        *self.content.write().expect("chunk content poisoned") = content;
        self.stale.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> ChunkContent {
        self.content().clone()
    }

    pub fn surface(&self) -> [Option<u8>; CHUNK_SIZE] {
        *self.surface.read().expect("chunk surface poisoned")
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag, returning whether it was set. Callers that fail
    /// to persist afterwards must call [`Chunk::mark_dirty`] again.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Held by whoever is writing this chunk's snapshot, so two saves of the
    /// same chunk never finish out of order.
    pub fn save_guard(&self) -> MutexGuard<'_, ()> {
        self.saving.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn allows_unload(&self) -> bool {
        self.allow_unload.load(Ordering::Acquire)
    }

    pub fn set_allow_unload(&self, allow: bool) {
        self.allow_unload.store(allow, Ordering::Release);
    }

    pub fn is_decorated(&self) -> bool {
        self.decorated.load(Ordering::Acquire)
    }

    pub fn mark_decorated(&self) {
        self.decorated.store(true, Ordering::Release);
    }

    pub fn last_viewed(&self) -> u64 {
        self.last_viewed.load(Ordering::Acquire)
    }

    /// Record that some viewer could see this chunk at `tick`.
    pub fn touch(&self, tick: u64) {
        self.last_viewed.fetch_max(tick, Ordering::AcqRel);
    }

    /// Per-main-tick update: refresh the derived surface if content changed.
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        if self.stale.swap(false, Ordering::AcqRel) {
            let surface = self.content().surface();
            *self.surface.write().expect("chunk surface poisoned") = surface;
        }
    }

    /// Per-rare-tick update for slow maintenance.
    pub fn tick_rare(&self) {
        self.rare_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn rare_tick_count(&self) -> u64 {
        self.rare_ticks.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("pos", &self.pos)
            .field("dirty", &self.is_dirty())
            .field("valid", &self.is_valid())
            .field("last_viewed", &self.last_viewed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::block::BlockId;

    #[test]
    fn set_block_marks_dirty_only_on_change() {
        let chunk = Chunk::new(ChunkPos::new(0, 0), ChunkContent::new_empty());
        assert!(!chunk.is_dirty());

        chunk.set_block(LocalBlockPos::new(1, 1), Block::AIR);
        assert!(!chunk.is_dirty());

        let old = chunk.set_block(LocalBlockPos::new(1, 1), Block::new(BlockId(2)));
        assert_eq!(old, Block::AIR);
        assert!(chunk.take_dirty());
        assert!(!chunk.is_dirty());
    }

    #[test]
    fn tick_refreshes_surface_after_edit() {
        let chunk = Chunk::new(ChunkPos::new(0, 0), ChunkContent::new_empty());
        assert_eq!(chunk.surface()[4], None);

        chunk.set_block(LocalBlockPos::new(4, 10), Block::new(BlockId(1)));
        assert_eq!(chunk.surface()[4], None, "surface is derived lazily");

        chunk.tick();
        assert_eq!(chunk.surface()[4], Some(10));
        assert_eq!(chunk.tick_count(), 1);
    }

    #[test]
    fn from_blocks_rejects_wrong_length() {
        assert!(ChunkContent::from_blocks(vec![Block::AIR; CHUNK_AREA - 1]).is_none());
        assert!(ChunkContent::from_blocks(vec![Block::AIR; CHUNK_AREA]).is_some());
    }

    #[test]
    fn touch_never_moves_backwards() {
        let chunk = Chunk::new(ChunkPos::new(0, 0), ChunkContent::new_empty());
        chunk.touch(10);
        chunk.touch(4);
        assert_eq!(chunk.last_viewed(), 10);
    }
}
