//! Sandbox material ids and property lookups.
//!
//! The engine stores `BlockId`s without interpreting them; this module gives
//! the sandbox's small sequential ids their meaning.

use sandbox_engine::world::block::{Block, BlockId};

pub const AIR: BlockId = BlockId(0);
pub const STONE: BlockId = BlockId(1);
pub const DIRT: BlockId = BlockId(2);
pub const GRASS: BlockId = BlockId(3);
pub const SAND: BlockId = BlockId(4);
pub const LOG: BlockId = BlockId(5);
pub const LEAVES: BlockId = BlockId(6);
pub const WATER: BlockId = BlockId(7);
pub const BEDROCK: BlockId = BlockId(8);

/// Highest id the sandbox knows about. Snapshots naming anything above are
/// rejected as corrupt.
pub const MAX_ID: u16 = 8;

pub fn name(id: BlockId) -> &'static str {
    match id {
        AIR => "air",
        STONE => "stone",
        DIRT => "dirt",
        GRASS => "grass",
        SAND => "sand",
        LOG => "log",
        LEAVES => "leaves",
        WATER => "water",
        BEDROCK => "bedrock",
        _ => "unknown",
    }
}

pub fn is_known(id: BlockId) -> bool {
    id.0 <= MAX_ID
}

/// Does this block fall when unsupported?
pub fn has_gravity(id: BlockId) -> bool {
    id == SAND
}

pub fn is_fluid(id: BlockId) -> bool {
    id == WATER
}

/// Can another block be placed in this space?
pub fn is_replaceable(id: BlockId) -> bool {
    id == AIR || id == WATER
}

pub fn is_solid(id: BlockId) -> bool {
    !is_replaceable(id)
}

/// Players may not remove these.
pub fn is_unbreakable(id: BlockId) -> bool {
    id == BEDROCK
}

pub const fn block(id: BlockId) -> Block {
    Block::new(id)
}
