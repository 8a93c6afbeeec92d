//! Deterministic layered terrain.
//!
//! Heights and biomes come from hashed lattice values blended between
//! neighboring lattice points, so a column's height depends only on
//! `(seed, x)` and chunks generate independently in any order.

use sandbox_engine::world::block::Block;
use sandbox_engine::world::chunk::{CHUNK_SIZE, ChunkContent};
use sandbox_engine::world::position::{ChunkPos, LocalBlockPos};
use sandbox_engine::world::storage::{BiomeId, ChunkGenerator};

use crate::block;

pub const DESERT: BiomeId = BiomeId(0);
pub const PLAINS: BiomeId = BiomeId(1);
pub const FOREST: BiomeId = BiomeId(2);

/// Everything at or below this row is bedrock.
pub const BEDROCK_Y: i64 = -64;
/// Empty space at or below this row fills with water.
pub const SEA_LEVEL: i64 = 28;

const BASE_HEIGHT: f64 = 24.0;
const HILL_AMPLITUDE: f64 = 20.0;
const DIRT_DEPTH: i64 = 4;
const TRUNK_HEIGHT: i64 = 4;

const HILL_SALT: u64 = 0x68_696c_6c;
const DETAIL_SALT: u64 = 0x64_6574_6169;
const BIOME_SALT: u64 = 0x62_696f_6d65;
const TREE_SALT: u64 = 0x74_7265_65;

#[derive(Debug, Clone, Copy, Default)]
pub struct LayeredGenerator;

impl LayeredGenerator {
    pub fn new() -> Self {
        Self
    }

    fn column(&self, seed: u64, world_x: i64, world_y: i64) -> Block {
        let height = self.height(seed, world_x);
        let desert = self.biome(seed, world_x) == DESERT;
        let id = if world_y <= BEDROCK_Y {
            block::BEDROCK
        } else if world_y < height - DIRT_DEPTH {
            block::STONE
        } else if world_y < height {
            if desert { block::SAND } else { block::DIRT }
        } else if world_y == height {
            if desert { block::SAND } else { block::GRASS }
        } else if world_y <= SEA_LEVEL {
            block::WATER
        } else {
            block::AIR
        };
        Block::new(id)
    }

    fn wants_tree(&self, seed: u64, world_x: i64) -> bool {
        let one_in = match self.biome(seed, world_x) {
            FOREST => 6,
            PLAINS => 20,
            _ => return false,
        };
        self.height(seed, world_x) > SEA_LEVEL && hash(seed ^ TREE_SALT, world_x) % one_in == 0
    }
}

impl ChunkGenerator for LayeredGenerator {
    fn generate(&self, seed: u64, pos: ChunkPos) -> ChunkContent {
        let origin = pos.block_origin();
        let mut content = ChunkContent::new_empty();
        for x in 0..CHUNK_SIZE as u8 {
            for y in 0..CHUNK_SIZE as u8 {
                let cell = self.column(seed, origin.x + x as i64, origin.y + y as i64);
                if !cell.is_air() {
                    content.set(LocalBlockPos::new(x, y), cell);
                }
            }
        }
        content
    }

    fn height(&self, seed: u64, world_x: i64) -> i64 {
        let hills = lattice(seed ^ HILL_SALT, world_x, 64);
        let detail = lattice(seed ^ DETAIL_SALT, world_x, 16);
        (BASE_HEIGHT + HILL_AMPLITUDE * (0.75 * hills + 0.25 * detail)).floor() as i64
    }

    fn biome(&self, seed: u64, world_x: i64) -> BiomeId {
        match lattice(seed ^ BIOME_SALT, world_x, 256) {
            v if v < 0.3 => DESERT,
            v if v < 0.7 => PLAINS,
            _ => FOREST,
        }
    }

    /// Trees. Each tree is placed only where it fits inside this chunk, so
    /// the pass never needs a neighbor.
    fn decorate(&self, seed: u64, pos: ChunkPos, content: &mut ChunkContent) {
        let origin = pos.block_origin();
        for lx in 1..CHUNK_SIZE as i64 - 1 {
            let world_x = origin.x + lx;
            if !self.wants_tree(seed, world_x) {
                continue;
            }
            let ground = self.height(seed, world_x);
            let top = ground + TRUNK_HEIGHT;

            let mut place = |x: i64, world_y: i64, id| {
                let y = world_y - origin.y;
                if !(0..CHUNK_SIZE as i64).contains(&y) {
                    return;
                }
                let local = LocalBlockPos::new(x as u8, y as u8);
                if content.get(local).is_air() {
                    content.set(local, Block::new(id));
                }
            };
            for world_y in ground + 1..=top {
                place(lx, world_y, block::LOG);
            }
            for dx in -1..=1 {
                place(lx + dx, top + 1, block::LEAVES);
                if dx != 0 {
                    place(lx + dx, top, block::LEAVES);
                }
            }
        }
    }
}

/// Smoothly interpolated lattice value in `[0, 1)`.
fn lattice(seed: u64, x: i64, period: i64) -> f64 {
    let cell = x.div_euclid(period);
    let t = x.rem_euclid(period) as f64 / period as f64;
    let a = unit(hash(seed, cell));
    let b = unit(hash(seed, cell + 1));
    let t = t * t * (3.0 - 2.0 * t);
    a + (b - a) * t
}

fn unit(h: u64) -> f64 {
    (h >> 11) as f64 / (1u64 << 53) as f64
}

/// splitmix64 over `(seed, x)`.
fn hash(seed: u64, x: i64) -> u64 {
    let mut z = seed.wrapping_add((x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let generator = LayeredGenerator::new();
        let pos = ChunkPos::new(-3, 0);
        assert_eq!(generator.generate(42, pos), generator.generate(42, pos));
        assert!((0..512).any(|x| generator.height(1, x) != generator.height(2, x)));
    }

    #[test]
    fn heights_stay_in_band_and_change_gently() {
        let generator = LayeredGenerator::new();
        let mut prev = generator.height(7, -1000);
        for x in -999..1000 {
            let h = generator.height(7, x);
            assert!((BASE_HEIGHT as i64..=(BASE_HEIGHT + HILL_AMPLITUDE) as i64).contains(&h));
            assert!((h - prev).abs() <= 3, "cliff at x={x}: {prev} -> {h}");
            prev = h;
        }
    }

    #[test]
    fn surface_matches_height() {
        let generator = LayeredGenerator::new();
        let seed = 99;
        // Chunk row 0 spans world y 0..32, which always holds the surface.
        let content = generator.generate(seed, ChunkPos::new(2, 0));
        let origin = ChunkPos::new(2, 0).block_origin();
        for x in 0..CHUNK_SIZE as u8 {
            let h = generator.height(seed, origin.x + x as i64);
            if h >= CHUNK_SIZE as i64 {
                continue;
            }
            let top = content.get(LocalBlockPos::new(x, h as u8));
            assert!(top.id == block::GRASS || top.id == block::SAND);
            if h + 1 < CHUNK_SIZE as i64 {
                let above = content.get(LocalBlockPos::new(x, h as u8 + 1));
                assert!(above.id == block::AIR || above.id == block::WATER);
            }
        }
    }

    #[test]
    fn deep_chunks_are_solid() {
        let generator = LayeredGenerator::new();
        let content = generator.generate(5, ChunkPos::new(0, -3));
        assert!(content.blocks().iter().all(|b| b.id == block::STONE || b.id == block::BEDROCK));
    }

    #[test]
    fn decoration_only_adds_tree_blocks() {
        let generator = LayeredGenerator::new();
        for cx in 0..20 {
            let pos = ChunkPos::new(cx, 1);
            let base = generator.generate(3, pos);
            let mut decorated = base.clone();
            generator.decorate(3, pos, &mut decorated);
            for (before, after) in base.blocks().iter().zip(decorated.blocks()) {
                if before != after {
                    assert!(before.is_air());
                    assert!(after.id == block::LOG || after.id == block::LEAVES);
                }
            }
        }
    }
}
