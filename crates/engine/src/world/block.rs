use serde::{Deserialize, Serialize};

/// Opaque material identifier. The engine stores these without interpreting them.
/// Game-specific layers assign meaning to specific IDs (e.g. 1 = stone, 3 = grass).
///
/// The only semantic the engine enforces is that `BlockId::AIR` (0) is the
/// "empty" material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockId(pub u16);

impl BlockId {
    /// The universal "empty" block.
    pub const AIR: BlockId = BlockId(0);

    pub const fn new(id: u16) -> Self {
        Self(id)
    }
}

/// One cell of a chunk: a material plus optional per-cell metadata
/// (orientation, growth stage, fluid level...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<u16>,
}

impl Block {
    pub const AIR: Block = Block {
        id: BlockId::AIR,
        meta: None,
    };

    pub const fn new(id: BlockId) -> Self {
        Self { id, meta: None }
    }

    pub const fn with_meta(id: BlockId, meta: u16) -> Self {
        Self {
            id,
            meta: Some(meta),
        }
    }

    pub fn is_air(&self) -> bool {
        self.id == BlockId::AIR
    }
}

impl From<BlockId> for Block {
    fn from(id: BlockId) -> Self {
        Self::new(id)
    }
}
