//! World-change event bus.
//!
//! Everything that edits the world (client `SetBlock`s, physics steps)
//! publishes a [`WorldChangeBatch`] to a shared `tokio::sync::broadcast`
//! channel. Each connection subscribes and forwards the changes its client
//! can see, except the ones it originated itself.

use std::sync::Arc;

use sandbox_engine::world::block::Block;
use sandbox_engine::world::position::BlockPos;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Slow subscribers lag and skip.
pub const BUS_CAPACITY: usize = 256;

/// Where a batch of changes came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeSource {
    /// A client connection, by connection id.
    Client(u64),
    /// A simulation clock, by name.
    Simulation(&'static str),
}

/// Block changes from one action or one step.
///
/// `Arc<[...]>` so cloning per subscriber is a refcount bump.
#[derive(Clone, Debug)]
pub struct WorldChangeBatch {
    pub source: ChangeSource,
    pub changes: Arc<[(BlockPos, Block)]>,
}

impl WorldChangeBatch {
    pub fn new(source: ChangeSource, changes: Vec<(BlockPos, Block)>) -> Self {
        Self {
            source,
            changes: changes.into(),
        }
    }
}

pub fn channel() -> broadcast::Sender<WorldChangeBatch> {
    broadcast::channel(BUS_CAPACITY).0
}

/// Publish unless empty. Having no subscribers is fine.
pub fn publish(bus: &broadcast::Sender<WorldChangeBatch>, batch: WorldChangeBatch) {
    if batch.changes.is_empty() {
        return;
    }
    let _ = bus.send(batch);
}
