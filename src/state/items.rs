//! Floor items and the seeded item generator.
//!
//! Items on the ground live in a per-floor manager with a strict id
//! uniqueness invariant. Item ids are carved from disjoint namespaces: each
//! client slot owns a sub-range for items it creates, and the server owns a
//! separate range for drops it generates, so ids never collide across
//! creators without coordination.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ItemError;
use crate::tables::{CommonItemSet, RareItemSet};

/// 12 bytes of game-format item data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemData(pub [u8; 12]);

impl ItemData {
    pub const EMPTY: ItemData = ItemData([0; 12]);

    /// A meseta pile. The amount lives in the trailing dword.
    pub fn meseta(amount: u32) -> ItemData {
        let mut data = [0u8; 12];
        data[0] = 0x04;
        data[8..12].copy_from_slice(&amount.to_le_bytes());
        ItemData(data)
    }

    pub fn is_meseta(&self) -> bool {
        self.0[0] == 0x04
    }

    pub fn meseta_amount(&self) -> u32 {
        u32::from_le_bytes([self.0[8], self.0[9], self.0[10], self.0[11]])
    }
}

/// Visibility: one bit per client slot allowed to see the item.
pub const VISIBLE_TO_ALL: u16 = 0x0FFF;

/// An item lying on the ground in a game.
#[derive(Debug, Clone, PartialEq)]
pub struct FloorItem {
    pub item_id: u32,
    pub item: ItemData,
    pub visibility_mask: u16,
    pub drop_number: u64,
    pub floor: u8,
    pub x: f32,
    pub z: f32,
}

/// Who is creating an item, for id namespace selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSource {
    /// A client slot (0-11).
    Client(u8),
    /// The server itself (authoritative drops).
    Server,
}

const MAX_CLIENT_SLOTS: usize = 12;
const CLIENT_ID_RANGE: u32 = 0x0001_0000;
const SERVER_ID_BASE: u32 = 0x0081_0000;
const MAX_ITEMS_PER_FLOOR: usize = 0x200;
const FLOOR_COUNT: usize = 0x12;

/// Per-game floor item state, indexed by floor.
#[derive(Debug)]
pub struct FloorItemManager {
    floors: Vec<HashMap<u32, FloorItem>>,
    next_client_id: [u32; MAX_CLIENT_SLOTS],
    next_server_id: u32,
    next_drop_number: u64,
}

impl Default for FloorItemManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FloorItemManager {
    pub fn new() -> Self {
        let mut next_client_id = [0u32; MAX_CLIENT_SLOTS];
        for (slot, next) in next_client_id.iter_mut().enumerate() {
            *next = CLIENT_ID_RANGE * (slot as u32 + 1);
        }
        FloorItemManager {
            floors: (0..FLOOR_COUNT).map(|_| HashMap::new()).collect(),
            next_client_id,
            next_server_id: SERVER_ID_BASE,
            next_drop_number: 0,
        }
    }

    /// The id the next item from `source` will get.
    pub fn peek_next_id(&self, source: ItemSource) -> u32 {
        match source {
            ItemSource::Client(slot) => self.next_client_id[slot as usize % MAX_CLIENT_SLOTS],
            ItemSource::Server => self.next_server_id,
        }
    }

    fn allocate_id(&mut self, source: ItemSource) -> u32 {
        match source {
            ItemSource::Client(slot) => {
                let slot = slot as usize % MAX_CLIENT_SLOTS;
                let id = self.next_client_id[slot];
                self.next_client_id[slot] = id.wrapping_add(1);
                id
            }
            ItemSource::Server => {
                let id = self.next_server_id;
                self.next_server_id = id.wrapping_add(1);
                id
            }
        }
    }

    /// Place an item on a floor. Returns the assigned id.
    pub fn add(
        &mut self,
        item: ItemData,
        floor: u8,
        x: f32,
        z: f32,
        visibility_mask: u16,
        source: ItemSource,
    ) -> Result<u32, ItemError> {
        let floor_items = self
            .floors
            .get_mut(floor as usize)
            .ok_or(ItemError::NotFound)?;
        if floor_items.len() >= MAX_ITEMS_PER_FLOOR {
            return Err(ItemError::TooManyItems);
        }
        let item_id = self.allocate_id(source);
        let drop_number = self.next_drop_number;
        self.next_drop_number += 1;
        // Ids are never reused while any allocation cursor is behind them,
        // so an insert collision means a corrupted cursor.
        let floor_items = &mut self.floors[floor as usize];
        debug_assert!(!floor_items.contains_key(&item_id));
        floor_items.insert(
            item_id,
            FloorItem {
                item_id,
                item,
                visibility_mask,
                drop_number,
                floor,
                x,
                z,
            },
        );
        Ok(item_id)
    }

    /// Take an item off the floor.
    pub fn remove(&mut self, item_id: u32) -> Result<FloorItem, ItemError> {
        for floor_items in &mut self.floors {
            if let Some(item) = floor_items.remove(&item_id) {
                return Ok(item);
            }
        }
        Err(ItemError::NotFound)
    }

    pub fn get(&self, item_id: u32) -> Option<&FloorItem> {
        self.floors.iter().find_map(|f| f.get(&item_id))
    }

    /// Nearest item on a floor by squared distance.
    pub fn find_nearest(&self, floor: u8, x: f32, z: f32) -> Option<&FloorItem> {
        let floor_items = self.floors.get(floor as usize)?;
        floor_items.values().min_by(|a, b| {
            let da = (a.x - x).powi(2) + (a.z - z).powi(2);
            let db = (b.x - x).powi(2) + (b.z - z).powi(2);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// Drop every item on a floor (warp-to-next-level cleanup).
    pub fn clear(&mut self, floor: u8) -> Vec<FloorItem> {
        match self.floors.get_mut(floor as usize) {
            Some(floor_items) => floor_items.drain().map(|(_, v)| v).collect(),
            None => Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.floors.iter().map(HashMap::len).sum()
    }

    pub fn iter_floor(&self, floor: u8) -> impl Iterator<Item = &FloorItem> {
        self.floors
            .get(floor as usize)
            .into_iter()
            .flat_map(HashMap::values)
    }
}

/// The RNG-backed item generator for server-authoritative drops.
///
/// Seeded per game so replays reproduce the same drops; the section id
/// biases which tables apply.
pub struct ItemCreator {
    rng: StdRng,
    section_id: u8,
    difficulty: u8,
    common: Arc<CommonItemSet>,
    rare: Arc<RareItemSet>,
}

impl std::fmt::Debug for ItemCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemCreator")
            .field("section_id", &self.section_id)
            .field("difficulty", &self.difficulty)
            .finish_non_exhaustive()
    }
}

impl ItemCreator {
    pub fn new(
        seed: u32,
        section_id: u8,
        difficulty: u8,
        common: Arc<CommonItemSet>,
        rare: Arc<RareItemSet>,
    ) -> Self {
        ItemCreator {
            rng: StdRng::seed_from_u64(seed as u64),
            section_id,
            difficulty,
            common,
            rare,
        }
    }

    /// Roll a drop for a killed enemy. `None` means no drop.
    pub fn enemy_drop(&mut self, enemy_type: u16) -> Option<ItemData> {
        // Rare table first; each entry is an independent chance.
        for entry in self.rare.entries_for(enemy_type, self.section_id) {
            if self.rng.gen::<u32>() < entry.chance {
                return Some(entry.item);
            }
        }
        self.common_roll()
    }

    /// Roll a drop for an opened box.
    pub fn box_drop(&mut self, _floor: u8) -> Option<ItemData> {
        self.common_roll()
    }

    fn common_roll(&mut self) -> Option<ItemData> {
        let table = self.common.for_difficulty(self.difficulty);
        let roll: u8 = self.rng.gen_range(0..100);
        if roll < table.pct_nothing {
            return None;
        }
        if roll < table.pct_nothing + table.pct_meseta {
            let amount = self
                .rng
                .gen_range(table.meseta_min as u32..=table.meseta_max as u32);
            return Some(ItemData::meseta(amount));
        }
        // Tools and equipment come straight from the weighted common table;
        // the section id rotates the starting point so profiles differ.
        let pool = self.common.item_pool();
        if pool.is_empty() {
            return None;
        }
        let offset = self.rng.gen_range(0..pool.len());
        let index = (offset + self.section_id as usize) % pool.len();
        Some(pool[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables;

    #[test]
    fn ids_are_unique_across_sources() {
        let mut manager = FloorItemManager::new();
        let a = manager
            .add(ItemData::meseta(10), 1, 0.0, 0.0, VISIBLE_TO_ALL, ItemSource::Client(0))
            .unwrap();
        let b = manager
            .add(ItemData::meseta(20), 1, 1.0, 1.0, VISIBLE_TO_ALL, ItemSource::Client(1))
            .unwrap();
        let c = manager
            .add(ItemData::meseta(30), 1, 2.0, 2.0, VISIBLE_TO_ALL, ItemSource::Server)
            .unwrap();
        assert_eq!(a, CLIENT_ID_RANGE);
        assert_eq!(b, CLIENT_ID_RANGE * 2);
        assert_eq!(c, SERVER_ID_BASE);
        let ids = [a, b, c];
        assert_eq!(
            ids.len(),
            ids.iter().collect::<std::collections::HashSet<_>>().len()
        );
    }

    #[test]
    fn remove_and_not_found() {
        let mut manager = FloorItemManager::new();
        let id = manager
            .add(ItemData::meseta(5), 2, 0.0, 0.0, VISIBLE_TO_ALL, ItemSource::Server)
            .unwrap();
        let item = manager.remove(id).unwrap();
        assert_eq!(item.item.meseta_amount(), 5);
        assert_eq!(manager.remove(id), Err(ItemError::NotFound));
    }

    #[test]
    fn nearest_by_squared_distance() {
        let mut manager = FloorItemManager::new();
        manager
            .add(ItemData::meseta(1), 3, 100.0, 100.0, VISIBLE_TO_ALL, ItemSource::Server)
            .unwrap();
        let near = manager
            .add(ItemData::meseta(2), 3, 10.0, 10.0, VISIBLE_TO_ALL, ItemSource::Server)
            .unwrap();
        manager
            .add(ItemData::meseta(3), 4, 0.0, 0.0, VISIBLE_TO_ALL, ItemSource::Server)
            .unwrap();
        let found = manager.find_nearest(3, 12.0, 9.0).unwrap();
        assert_eq!(found.item_id, near);
        // Wrong floor finds nothing.
        assert!(manager.find_nearest(5, 0.0, 0.0).is_none());
    }

    #[test]
    fn floor_cap_enforced() {
        let mut manager = FloorItemManager::new();
        for _ in 0..MAX_ITEMS_PER_FLOOR {
            manager
                .add(ItemData::meseta(1), 0, 0.0, 0.0, VISIBLE_TO_ALL, ItemSource::Server)
                .unwrap();
        }
        assert_eq!(
            manager.add(
                ItemData::meseta(1),
                0,
                0.0,
                0.0,
                VISIBLE_TO_ALL,
                ItemSource::Server
            ),
            Err(ItemError::TooManyItems)
        );
        // Other floors are unaffected.
        assert!(manager
            .add(ItemData::meseta(1), 1, 0.0, 0.0, VISIBLE_TO_ALL, ItemSource::Server)
            .is_ok());
    }

    #[test]
    fn clear_empties_one_floor() {
        let mut manager = FloorItemManager::new();
        manager
            .add(ItemData::meseta(1), 1, 0.0, 0.0, VISIBLE_TO_ALL, ItemSource::Server)
            .unwrap();
        manager
            .add(ItemData::meseta(2), 2, 0.0, 0.0, VISIBLE_TO_ALL, ItemSource::Server)
            .unwrap();
        let dropped = manager.clear(1);
        assert_eq!(dropped.len(), 1);
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn item_creator_is_deterministic() {
        let common = Arc::new(CommonItemSet::default());
        let rare = Arc::new(RareItemSet::default());
        let drops = |seed: u32| -> Vec<Option<ItemData>> {
            let mut creator = ItemCreator::new(seed, 3, 1, common.clone(), rare.clone());
            (0..64).map(|_| creator.enemy_drop(7)).collect()
        };
        assert_eq!(drops(0xAAAA), drops(0xAAAA));
        assert_ne!(drops(0xAAAA), drops(0xBBBB));
    }

    #[test]
    fn meseta_item_encoding() {
        let item = ItemData::meseta(777);
        assert!(item.is_meseta());
        assert_eq!(item.meseta_amount(), 777);
        assert_eq!(tables::describe_item(&item), "Meseta x777");
    }
}
