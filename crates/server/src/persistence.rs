//! Chunk snapshots on disk.
//!
//! One file per chunk, `<world>/chunks/c.<x>.<y>.dat`, holding a
//! gzip-compressed NBT compound:
//!
//! | tag       | type             | meaning                               |
//! |-----------|------------------|---------------------------------------|
//! | `Version` | int              | format version, currently 1           |
//! | `X`, `Y`  | int              | chunk coordinate                      |
//! | `Size`    | int              | cells per side                        |
//! | `Blocks`  | list of int      | material ids, row-major `y*Size + x`  |
//! | `Meta`    | list of compound | sparse `{Index, Value}` cell metadata |
//!
//! Anything that does not decode into exactly that shape is reported as
//! [`ChunkError::Corrupt`]; it is never mistaken for an empty chunk.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use sandbox_engine::error::ChunkError;
use sandbox_engine::world::block::{Block, BlockId};
use sandbox_engine::world::chunk::{CHUNK_AREA, CHUNK_SIZE, ChunkContent};
use sandbox_engine::world::position::ChunkPos;
use sandbox_engine::world::storage::ChunkStorage;

use crate::block;

/// Format version written into every snapshot.
pub const FORMAT_VERSION: i32 = 1;

// ── NBT structs (serde) ─────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug)]
struct ChunkNbt {
    #[serde(rename = "Version")]
    version: i32,
    #[serde(rename = "X")]
    x: i32,
    #[serde(rename = "Y")]
    y: i32,
    #[serde(rename = "Size")]
    size: i32,
    #[serde(rename = "Blocks")]
    blocks: Vec<i32>,
    #[serde(rename = "Meta", default)]
    meta: Vec<MetaNbt>,
}

#[derive(Serialize, Deserialize, Debug)]
struct MetaNbt {
    #[serde(rename = "Index")]
    index: i32,
    #[serde(rename = "Value")]
    value: i32,
}

// ── Encode / decode ─────────────────────────────────────────────────────────

/// Encode one chunk as gzip-compressed NBT.
pub fn encode(pos: ChunkPos, content: &ChunkContent) -> io::Result<Vec<u8>> {
    let mut meta = Vec::new();
    let blocks = content
        .blocks()
        .iter()
        .enumerate()
        .map(|(i, b)| {
            if let Some(value) = b.meta {
                meta.push(MetaNbt {
                    index: i as i32,
                    value: value as i32,
                });
            }
            b.id.0 as i32
        })
        .collect();

    let nbt = ChunkNbt {
        version: FORMAT_VERSION,
        x: pos.x,
        y: pos.y,
        size: CHUNK_SIZE as i32,
        blocks,
        meta,
    };
    let raw = fastnbt::to_bytes(&nbt).map_err(io::Error::other)?;

    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 4), Compression::default());
    encoder.write_all(&raw)?;
    encoder.finish()
}

/// Decode a snapshot that is expected to hold the chunk at `pos`.
pub fn decode(pos: ChunkPos, bytes: &[u8]) -> Result<ChunkContent, ChunkError> {
    let mut raw = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut raw)
        .map_err(|e| ChunkError::corrupt(pos, format!("decompression failed: {e}")))?;
    let nbt: ChunkNbt = fastnbt::from_bytes(&raw)
        .map_err(|e| ChunkError::corrupt(pos, format!("malformed NBT: {e}")))?;

    if nbt.version != FORMAT_VERSION {
        return Err(ChunkError::corrupt(
            pos,
            format!("unsupported version {}", nbt.version),
        ));
    }
    if (nbt.x, nbt.y) != (pos.x, pos.y) {
        return Err(ChunkError::corrupt(
            pos,
            format!("snapshot is for chunk ({}, {})", nbt.x, nbt.y),
        ));
    }
    if nbt.size != CHUNK_SIZE as i32 || nbt.blocks.len() != CHUNK_AREA {
        return Err(ChunkError::corrupt(
            pos,
            format!("size {} with {} cells", nbt.size, nbt.blocks.len()),
        ));
    }

    let mut cells = Vec::with_capacity(CHUNK_AREA);
    for (i, &raw_id) in nbt.blocks.iter().enumerate() {
        let id = u16::try_from(raw_id)
            .ok()
            .map(BlockId)
            .filter(|id| block::is_known(*id))
            .ok_or_else(|| ChunkError::corrupt(pos, format!("cell {i} has invalid id {raw_id}")))?;
        cells.push(Block::new(id));
    }
    for entry in &nbt.meta {
        let index = usize::try_from(entry.index)
            .ok()
            .filter(|i| *i < CHUNK_AREA)
            .ok_or_else(|| ChunkError::corrupt(pos, format!("meta index {} out of range", entry.index)))?;
        let value = u16::try_from(entry.value)
            .map_err(|_| ChunkError::corrupt(pos, format!("meta value {} out of range", entry.value)))?;
        cells[index].meta = Some(value);
    }

    ChunkContent::from_blocks(cells).ok_or_else(|| ChunkError::corrupt(pos, "wrong cell count"))
}

// ── Storage ─────────────────────────────────────────────────────────────────

/// [`ChunkStorage`] over a world directory.
pub struct NbtChunkStorage {
    dir: PathBuf,
}

impl NbtChunkStorage {
    /// Snapshots live under `<world_dir>/chunks/`, created on first save.
    pub fn new(world_dir: &Path) -> Self {
        Self {
            dir: world_dir.join("chunks"),
        }
    }

    pub fn path_for(&self, pos: ChunkPos) -> PathBuf {
        self.dir.join(format!("c.{}.{}.dat", pos.x, pos.y))
    }

    /// Number of snapshot files currently on disk.
    pub fn count(&self) -> io::Result<usize> {
        if !self.dir.is_dir() {
            return Ok(0);
        }
        let mut n = 0;
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if parse_file_name(&name.to_string_lossy()).is_some() {
                n += 1;
            }
        }
        Ok(n)
    }
}

impl ChunkStorage for NbtChunkStorage {
    fn load(&self, pos: ChunkPos) -> Result<Option<ChunkContent>, ChunkError> {
        let path = self.path_for(pos);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ChunkError::Io { pos, source }),
        };
        decode(pos, &bytes).map(Some)
    }

    fn save(&self, pos: ChunkPos, content: &ChunkContent) -> Result<(), ChunkError> {
        let io_err = |source| ChunkError::Io { pos, source };
        let bytes = encode(pos, content).map_err(io_err)?;
        fs::create_dir_all(&self.dir).map_err(io_err)?;

        // Write aside, then rename over, so a crash never leaves half a file.
        let path = self.path_for(pos);
        let tmp = path.with_extension("dat.tmp");
        fs::write(&tmp, &bytes).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        tracing::trace!("Saved chunk {} ({} bytes)", pos, bytes.len());
        Ok(())
    }
}

/// Parse `c.<x>.<y>.dat`.
fn parse_file_name(name: &str) -> Option<ChunkPos> {
    let rest = name.strip_prefix("c.")?.strip_suffix(".dat")?;
    let (x, y) = rest.split_once('.')?;
    Some(ChunkPos::new(x.parse().ok()?, y.parse().ok()?))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_engine::world::position::LocalBlockPos;

    fn sample() -> ChunkContent {
        let mut content = ChunkContent::new_empty();
        for x in 0..CHUNK_SIZE as u8 {
            content.set(LocalBlockPos::new(x, 0), Block::new(block::BEDROCK));
            content.set(LocalBlockPos::new(x, 1), Block::new(block::STONE));
        }
        content.set(LocalBlockPos::new(4, 2), Block::with_meta(block::WATER, 3));
        content
    }

    fn write_nbt(nbt: &ChunkNbt) -> Vec<u8> {
        let raw = fastnbt::to_bytes(nbt).unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        encoder.finish().unwrap()
    }

    fn valid_nbt(pos: ChunkPos) -> ChunkNbt {
        ChunkNbt {
            version: FORMAT_VERSION,
            x: pos.x,
            y: pos.y,
            size: CHUNK_SIZE as i32,
            blocks: vec![0; CHUNK_AREA],
            meta: Vec::new(),
        }
    }

    #[test]
    fn snapshot_preserves_content_and_coordinate() {
        let pos = ChunkPos::new(-7, 12);
        let content = sample();
        let bytes = encode(pos, &content).unwrap();
        assert_eq!(decode(pos, &bytes).unwrap(), content);

        let err = decode(ChunkPos::new(7, 12), &bytes).unwrap_err();
        assert!(err.is_corrupt());
        assert_eq!(err.pos(), ChunkPos::new(7, 12));
    }

    #[test]
    fn repeated_round_trips_are_stable() {
        let pos = ChunkPos::new(3, -9);
        let first = encode(pos, &sample()).unwrap();
        let once = decode(pos, &first).unwrap();
        let second = encode(pos, &once).unwrap();
        let twice = decode(pos, &second).unwrap();
        assert_eq!(first, second);
        assert_eq!(once, twice);
        assert_eq!(twice, sample());
    }

    #[test]
    fn all_air_chunk_is_not_corrupt() {
        let pos = ChunkPos::new(0, 0);
        let bytes = encode(pos, &ChunkContent::new_empty()).unwrap();
        assert!(decode(pos, &bytes).unwrap().is_empty());
    }

    #[test]
    fn garbage_is_corrupt() {
        let pos = ChunkPos::new(1, 1);
        assert!(decode(pos, b"definitely not gzip").unwrap_err().is_corrupt());

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"not nbt either").unwrap();
        let bytes = encoder.finish().unwrap();
        assert!(decode(pos, &bytes).unwrap_err().is_corrupt());
    }

    #[test]
    fn shape_violations_are_corrupt() {
        let pos = ChunkPos::new(2, -3);

        let mut nbt = valid_nbt(pos);
        nbt.version = 2;
        assert!(decode(pos, &write_nbt(&nbt)).unwrap_err().is_corrupt());

        let mut nbt = valid_nbt(pos);
        nbt.blocks.pop();
        assert!(decode(pos, &write_nbt(&nbt)).unwrap_err().is_corrupt());

        let mut nbt = valid_nbt(pos);
        nbt.blocks[10] = 999;
        assert!(decode(pos, &write_nbt(&nbt)).unwrap_err().is_corrupt());

        let mut nbt = valid_nbt(pos);
        nbt.meta.push(MetaNbt {
            index: CHUNK_AREA as i32,
            value: 1,
        });
        assert!(decode(pos, &write_nbt(&nbt)).unwrap_err().is_corrupt());

        assert!(decode(pos, &write_nbt(&valid_nbt(pos))).is_ok());
    }

    #[test]
    fn storage_round_trips_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = NbtChunkStorage::new(dir.path());
        let pos = ChunkPos::new(3, -4);

        assert!(storage.load(pos).unwrap().is_none());
        storage.save(pos, &sample()).unwrap();
        assert!(dir.path().join("chunks/c.3.-4.dat").exists());
        assert!(!dir.path().join("chunks/c.3.-4.dat.tmp").exists());
        assert_eq!(storage.load(pos).unwrap(), Some(sample()));
        assert_eq!(storage.count().unwrap(), 1);
    }

    #[test]
    fn truncated_file_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let storage = NbtChunkStorage::new(dir.path());
        let pos = ChunkPos::new(0, 5);
        storage.save(pos, &sample()).unwrap();

        let path = storage.path_for(pos);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = storage.load(pos).unwrap_err();
        assert!(err.is_corrupt());
        assert_eq!(err.pos(), pos);
    }

    #[test]
    fn file_names_parse() {
        assert_eq!(parse_file_name("c.-1.20.dat"), Some(ChunkPos::new(-1, 20)));
        assert_eq!(parse_file_name("c.1.dat"), None);
        assert_eq!(parse_file_name("r.0.0.mca"), None);
    }
}
