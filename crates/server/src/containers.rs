//! Inventory containers.
//!
//! A container is addressed by its owner: a player (by name) or a block
//! that holds items (by position). The server keeps the authoritative copy
//! in a [`ContainerRegistry`]; clients mirror what they need through
//! [`crate::remote::ContainerSyncCache`].

use dashmap::DashMap;
use sandbox_engine::world::position::BlockPos;
use serde::{Deserialize, Serialize};

/// Slots in a player inventory.
pub const PLAYER_SLOTS: usize = 36;
/// Slots in a block container.
pub const BLOCK_SLOTS: usize = 27;
pub const MAX_STACK: u16 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerKey {
    Player { name: String },
    Block { pos: BlockPos },
}

impl ContainerKey {
    pub fn player(name: impl Into<String>) -> Self {
        Self::Player { name: name.into() }
    }

    pub fn block(pos: BlockPos) -> Self {
        Self::Block { pos }
    }

    pub fn slot_count(&self) -> usize {
        match self {
            Self::Player { .. } => PLAYER_SLOTS,
            Self::Block { .. } => BLOCK_SLOTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub item: u16,
    pub count: u16,
}

impl ItemStack {
    pub fn new(item: u16, count: u16) -> Self {
        Self {
            item,
            count: count.min(MAX_STACK),
        }
    }
}

/// A fixed number of slots, each empty or holding one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerContent {
    slots: Vec<Option<ItemStack>>,
}

impl ContainerContent {
    pub fn empty(slots: usize) -> Self {
        Self {
            slots: vec![None; slots],
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, slot: usize) -> Option<ItemStack> {
        self.slots.get(slot).copied().flatten()
    }

    /// Put a stack into a slot, returning what was there. `None` when the
    /// slot does not exist.
    pub fn set(&mut self, slot: usize, stack: Option<ItemStack>) -> Option<Option<ItemStack>> {
        let cell = self.slots.get_mut(slot)?;
        Some(std::mem::replace(cell, stack))
    }

    /// Add items, topping up matching stacks first. Returns how many did not
    /// fit.
    pub fn add(&mut self, item: u16, mut count: u16) -> u16 {
        for stack in self.slots.iter_mut().flatten() {
            if count == 0 {
                break;
            }
            if stack.item == item && stack.count < MAX_STACK {
                let moved = count.min(MAX_STACK - stack.count);
                stack.count += moved;
                count -= moved;
            }
        }
        for cell in &mut self.slots {
            if count == 0 {
                break;
            }
            if cell.is_none() {
                let moved = count.min(MAX_STACK);
                *cell = Some(ItemStack::new(item, moved));
                count -= moved;
            }
        }
        count
    }

    pub fn total(&self, item: u16) -> u32 {
        self.slots
            .iter()
            .flatten()
            .filter(|s| s.item == item)
            .map(|s| s.count as u32)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// Authoritative containers held by the server.
#[derive(Default)]
pub struct ContainerRegistry {
    containers: DashMap<ContainerKey, ContainerContent>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ContainerKey) -> Option<ContainerContent> {
        self.containers.get(key).map(|c| c.clone())
    }

    pub fn insert(&self, key: ContainerKey, content: ContainerContent) {
        self.containers.insert(key, content);
    }

    pub fn remove(&self, key: &ContainerKey) -> Option<ContainerContent> {
        self.containers.remove(key).map(|(_, c)| c)
    }

    /// The player's inventory, created empty on first use.
    pub fn ensure_player(&self, name: &str) -> ContainerContent {
        self.containers
            .entry(ContainerKey::player(name))
            .or_insert_with(|| ContainerContent::empty(PLAYER_SLOTS))
            .clone()
    }

    /// Edit a container in place. `None` when it does not exist.
    pub fn update<R>(&self, key: &ContainerKey, f: impl FnOnce(&mut ContainerContent) -> R) -> Option<R> {
        self.containers.get_mut(key).map(|mut c| f(&mut c))
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_tops_up_then_fills_empty_slots() {
        let mut content = ContainerContent::empty(3);
        assert_eq!(content.add(4, 10), 0);
        assert_eq!(content.add(4, 60), 0);
        assert_eq!(content.get(0), Some(ItemStack::new(4, 64)));
        assert_eq!(content.get(1), Some(ItemStack::new(4, 6)));
        assert_eq!(content.add(5, 200), 200 - 64);
        assert_eq!(content.total(4), 70);
    }

    #[test]
    fn player_inventory_is_created_once() {
        let registry = ContainerRegistry::new();
        assert!(registry.get(&ContainerKey::player("ana")).is_none());
        registry.ensure_player("ana");
        registry
            .update(&ContainerKey::player("ana"), |c| c.add(1, 3))
            .unwrap();
        let inv = registry.ensure_player("ana");
        assert_eq!(inv.slot_count(), PLAYER_SLOTS);
        assert_eq!(inv.total(1), 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn keys_serialize_tagged() {
        let json = serde_json::to_string(&ContainerKey::block(BlockPos::new(3, -2))).unwrap();
        assert_eq!(json, r#"{"kind":"block","pos":{"x":3,"y":-2}}"#);
    }
}
