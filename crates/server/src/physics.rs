//! Falling blocks, advanced on the physics clock.
//!
//! Edits notify the stepper; each step moves every notified gravity block
//! one cell down if the cell below is replaceable, and re-notifies the moved
//! block and whatever sat on top of it. A column of sand therefore settles
//! one cell per step, bottom block first.

use std::collections::HashSet;
use std::sync::Mutex;

use sandbox_engine::world::World;
use sandbox_engine::world::block::Block;
use sandbox_engine::world::position::BlockPos;

use crate::block;

#[derive(Default)]
pub struct GravityStepper {
    pending: Mutex<HashSet<BlockPos>>,
}

impl GravityStepper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A block at `pos` changed: it and its neighbors may need to fall.
    pub fn notify(&self, pos: BlockPos) {
        let mut pending = self.pending.lock().expect("gravity queue poisoned");
        pending.insert(pos);
        pending.extend(pos.neighbors());
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().expect("gravity queue poisoned").len()
    }

    /// Advance one step. Returns every cell written, in write order.
    pub fn step(&self, world: &World) -> Vec<(BlockPos, Block)> {
        let mut queue: Vec<BlockPos> = {
            let mut pending = self.pending.lock().expect("gravity queue poisoned");
            pending.drain().collect()
        };
        queue.sort_by_key(|p| (p.y, p.x));

        let mut changes = Vec::new();
        let mut next = HashSet::new();
        // One guard for the whole step: both halves of a swap land together.
        let blocks = world.blocks();
        for pos in queue {
            let Some(falling) = blocks.get(pos) else {
                continue;
            };
            if !block::has_gravity(falling.id) {
                continue;
            }
            let below = BlockPos::new(pos.x, pos.y - 1);
            // Unloaded below: hold still until something notifies again.
            let Some(under) = blocks.get(below) else {
                continue;
            };
            if !block::is_replaceable(under.id) {
                continue;
            }
            blocks.set(below, falling);
            blocks.set(pos, under);
            changes.push((below, falling));
            changes.push((pos, under));
            next.insert(below);
            next.insert(BlockPos::new(pos.x, pos.y + 1));
        }
        drop(blocks);

        if !next.is_empty() {
            self.pending
                .lock()
                .expect("gravity queue poisoned")
                .extend(next);
        }
        changes
    }
}
