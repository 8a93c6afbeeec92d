use serde::{Deserialize, Serialize};

use super::chunk::CHUNK_SIZE;

const CHUNK_SHIFT: u32 = CHUNK_SIZE.trailing_zeros();
const CHUNK_MASK: i64 = CHUNK_SIZE as i64 - 1;

/// Absolute block position in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i64,
    pub y: i64,
}

impl BlockPos {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// The chunk this block belongs to. Floors toward negative infinity, so
    /// block -1 lives in chunk -1.
    pub const fn chunk(&self) -> ChunkPos {
        ChunkPos {
            x: (self.x >> CHUNK_SHIFT) as i32,
            y: (self.y >> CHUNK_SHIFT) as i32,
        }
    }

    /// Position within the chunk (0..CHUNK_SIZE on both axes).
    pub const fn local(&self) -> LocalBlockPos {
        LocalBlockPos {
            x: (self.x & CHUNK_MASK) as u8,
            y: (self.y & CHUNK_MASK) as u8,
        }
    }

    /// The four cardinal neighbors.
    pub const fn neighbors(&self) -> [BlockPos; 4] {
        [
            Self::new(self.x + 1, self.y),
            Self::new(self.x - 1, self.y),
            Self::new(self.x, self.y + 1),
            Self::new(self.x, self.y - 1),
        ]
    }
}

/// Chunk position (each chunk is `CHUNK_SIZE` blocks on a side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Pack both axes into one 64-bit key: `x` in the high half, `y` in the
    /// low half, each as raw two's complement bits.
    pub const fn key(&self) -> u64 {
        ((self.x as u32 as u64) << 32) | (self.y as u32 as u64)
    }

    /// Inverse of [`ChunkPos::key`].
    pub const fn from_key(key: u64) -> Self {
        Self {
            x: (key >> 32) as u32 as i32,
            y: key as u32 as i32,
        }
    }

    pub const fn block_origin(&self) -> BlockPos {
        BlockPos::new(
            (self.x as i64) << CHUNK_SHIFT,
            (self.y as i64) << CHUNK_SHIFT,
        )
    }

    pub const fn block_at(&self, local: LocalBlockPos) -> BlockPos {
        let origin = self.block_origin();
        BlockPos::new(origin.x + local.x as i64, origin.y + local.y as i64)
    }
}

impl std::fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Block position local to a chunk (x, y in 0..CHUNK_SIZE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalBlockPos {
    pub x: u8,
    pub y: u8,
}

impl LocalBlockPos {
    pub const fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    /// Row-major index into a chunk's cell array.
    #[inline]
    pub const fn index(&self) -> usize {
        (self.y as usize) * CHUNK_SIZE + (self.x as usize)
    }

    #[inline]
    pub const fn from_index(index: usize) -> Self {
        Self {
            x: (index % CHUNK_SIZE) as u8,
            y: (index / CHUNK_SIZE) as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_packing_is_bijective_at_the_extremes() {
        let samples = [
            ChunkPos::new(0, 0),
            ChunkPos::new(-1, -1),
            ChunkPos::new(i32::MIN, i32::MAX),
            ChunkPos::new(i32::MAX, i32::MIN),
            ChunkPos::new(-12345, 678),
        ];
        for pos in samples {
            assert_eq!(ChunkPos::from_key(pos.key()), pos);
        }
        assert_ne!(ChunkPos::new(1, 0).key(), ChunkPos::new(0, 1).key());
        assert_ne!(ChunkPos::new(-1, 0).key(), ChunkPos::new(0, -1).key());
    }

    #[test]
    fn negative_blocks_floor_into_negative_chunks() {
        let pos = BlockPos::new(-1, -33);
        assert_eq!(pos.chunk(), ChunkPos::new(-1, -2));
        assert_eq!(pos.local(), LocalBlockPos::new(31, 31));
        assert_eq!(pos.chunk().block_at(pos.local()), pos);
    }

    #[test]
    fn local_index_roundtrip() {
        let local = LocalBlockPos::new(7, 19);
        assert_eq!(LocalBlockPos::from_index(local.index()), local);
    }
}
