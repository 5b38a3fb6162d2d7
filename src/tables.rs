//! Immutable shared game data tables.
//!
//! Drop tables and the level-up table load once at startup into `Arc`ed
//! objects; reloads build fresh tables and swap the pointers, so handlers
//! holding a snapshot never observe a half-updated table. Built-in defaults
//! apply when no table files are shipped.

use std::path::Path;

use crate::state::items::ItemData;

/// Table load errors.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("table file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("table file is malformed: {0}")]
    Malformed(String),
}

/// Human-readable item label for logs and `$what`.
pub fn describe_item(item: &ItemData) -> String {
    if item.is_meseta() {
        format!("Meseta x{}", item.meseta_amount())
    } else {
        let b = &item.0;
        format!(
            "{:02X}{:02X}{:02X}{:02X}",
            b[0], b[1], b[2], b[3]
        )
    }
}

/// One difficulty's common-drop parameters.
#[derive(Debug, Clone, Copy)]
pub struct CommonDifficulty {
    pub meseta_min: u16,
    pub meseta_max: u16,
    /// Percentages out of 100; the remainder is the item pool.
    pub pct_nothing: u8,
    pub pct_meseta: u8,
}

/// Common-item drop parameters for a version.
#[derive(Debug, Clone)]
pub struct CommonItemSet {
    difficulties: [CommonDifficulty; 4],
    pool: Vec<ItemData>,
}

impl Default for CommonItemSet {
    fn default() -> Self {
        // Monomaterial-ish pool: a few tools with climbing quantities.
        let mut pool = Vec::new();
        for tool in 0..8u8 {
            let mut data = [0u8; 12];
            data[0] = 0x03;
            data[1] = tool;
            pool.push(ItemData(data));
        }
        CommonItemSet {
            difficulties: [
                CommonDifficulty { meseta_min: 10, meseta_max: 60, pct_nothing: 40, pct_meseta: 35 },
                CommonDifficulty { meseta_min: 40, meseta_max: 160, pct_nothing: 40, pct_meseta: 35 },
                CommonDifficulty { meseta_min: 80, meseta_max: 320, pct_nothing: 45, pct_meseta: 30 },
                CommonDifficulty { meseta_min: 150, meseta_max: 650, pct_nothing: 45, pct_meseta: 30 },
            ],
            pool,
        }
    }
}

const COMMON_MAGIC: &[u8; 4] = b"RGCT";
const RARE_MAGIC: &[u8; 4] = b"RGRT";
const LEVEL_MAGIC: &[u8; 4] = b"RGLV";

impl CommonItemSet {
    pub fn for_difficulty(&self, difficulty: u8) -> &CommonDifficulty {
        &self.difficulties[(difficulty as usize).min(3)]
    }

    pub fn item_pool(&self) -> &[ItemData] {
        &self.pool
    }

    /// Binary layout: magic, 4 difficulty records (u16 min, u16 max, u8
    /// nothing, u8 meseta), u16 pool count, then 12 bytes per pool entry.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TableError> {
        if data.len() < 4 + 4 * 6 + 2 || &data[..4] != COMMON_MAGIC {
            return Err(TableError::Malformed("bad common-item table header".into()));
        }
        let mut pos = 4;
        let mut difficulties = [CommonDifficulty {
            meseta_min: 0,
            meseta_max: 0,
            pct_nothing: 0,
            pct_meseta: 0,
        }; 4];
        for entry in difficulties.iter_mut() {
            entry.meseta_min = u16::from_le_bytes([data[pos], data[pos + 1]]);
            entry.meseta_max = u16::from_le_bytes([data[pos + 2], data[pos + 3]]);
            entry.pct_nothing = data[pos + 4];
            entry.pct_meseta = data[pos + 5];
            if entry.meseta_max < entry.meseta_min {
                return Err(TableError::Malformed("meseta range inverted".into()));
            }
            if entry.pct_nothing as u16 + entry.pct_meseta as u16 > 100 {
                return Err(TableError::Malformed("percentages exceed 100".into()));
            }
            pos += 6;
        }
        let count = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2;
        if data.len() < pos + count * 12 {
            return Err(TableError::Malformed("pool truncated".into()));
        }
        let mut pool = Vec::with_capacity(count);
        for _ in 0..count {
            let mut item = [0u8; 12];
            item.copy_from_slice(&data[pos..pos + 12]);
            pool.push(ItemData(item));
            pos += 12;
        }
        Ok(CommonItemSet { difficulties, pool })
    }

    pub fn from_file(path: &Path) -> Result<Self, TableError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

/// One rare drop rule.
#[derive(Debug, Clone, Copy)]
pub struct RareItemEntry {
    pub enemy_type: u16,
    /// One bit per section id (0-9) the rule applies to.
    pub section_mask: u16,
    /// Probability as a fraction of 2^32.
    pub chance: u32,
    pub item: ItemData,
}

/// Rare drop rules for a version.
#[derive(Debug, Clone, Default)]
pub struct RareItemSet {
    entries: Vec<RareItemEntry>,
}

impl RareItemSet {
    pub fn new(entries: Vec<RareItemEntry>) -> Self {
        RareItemSet { entries }
    }

    pub fn entries_for(
        &self,
        enemy_type: u16,
        section_id: u8,
    ) -> impl Iterator<Item = &RareItemEntry> {
        let bit = 1u16 << (section_id as u16 % 10);
        self.entries
            .iter()
            .filter(move |e| e.enemy_type == enemy_type && (e.section_mask & bit) != 0)
    }

    /// Binary layout: magic, u16 count, then records of (u16 enemy type,
    /// u16 section mask, u32 chance, 12 item bytes).
    pub fn from_bytes(data: &[u8]) -> Result<Self, TableError> {
        if data.len() < 6 || &data[..4] != RARE_MAGIC {
            return Err(TableError::Malformed("bad rare-item table header".into()));
        }
        let count = u16::from_le_bytes([data[4], data[5]]) as usize;
        let mut pos = 6;
        if data.len() < pos + count * 20 {
            return Err(TableError::Malformed("rare table truncated".into()));
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let enemy_type = u16::from_le_bytes([data[pos], data[pos + 1]]);
            let section_mask = u16::from_le_bytes([data[pos + 2], data[pos + 3]]);
            let chance =
                u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
            let mut item = [0u8; 12];
            item.copy_from_slice(&data[pos + 8..pos + 20]);
            entries.push(RareItemEntry {
                enemy_type,
                section_mask,
                chance,
                item: ItemData(item),
            });
            pos += 20;
        }
        Ok(RareItemSet { entries })
    }

    pub fn from_file(path: &Path) -> Result<Self, TableError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

/// Cumulative experience thresholds per level.
#[derive(Debug, Clone)]
pub struct LevelTable {
    /// `thresholds[n]` = total EXP required to reach level n+2 (level 1
    /// needs none).
    thresholds: Vec<u64>,
}

pub const MAX_LEVEL: u32 = 200;

impl Default for LevelTable {
    fn default() -> Self {
        // Smooth cubic curve up to level 200.
        let thresholds = (2..=MAX_LEVEL as u64)
            .map(|level| level * level * level / 2)
            .collect();
        LevelTable { thresholds }
    }
}

impl LevelTable {
    /// Total EXP needed to reach `level` from zero.
    pub fn exp_for_level(&self, level: u32) -> u64 {
        if level <= 1 {
            return 0;
        }
        let index = (level - 2).min(self.thresholds.len() as u32 - 1) as usize;
        self.thresholds[index]
    }

    /// The level a running EXP total corresponds to.
    pub fn level_for_exp(&self, exp: u64) -> u32 {
        let reached = self.thresholds.partition_point(|&t| t <= exp) as u32;
        (reached + 1).min(MAX_LEVEL)
    }

    /// Binary layout: magic, u16 count, count u64 thresholds.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TableError> {
        if data.len() < 6 || &data[..4] != LEVEL_MAGIC {
            return Err(TableError::Malformed("bad level table header".into()));
        }
        let count = u16::from_le_bytes([data[4], data[5]]) as usize;
        if data.len() < 6 + count * 8 {
            return Err(TableError::Malformed("level table truncated".into()));
        }
        let mut thresholds = Vec::with_capacity(count);
        let mut pos = 6;
        let mut last = 0u64;
        for _ in 0..count {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[pos..pos + 8]);
            let value = u64::from_le_bytes(raw);
            if value < last {
                return Err(TableError::Malformed("level thresholds not monotonic".into()));
            }
            last = value;
            thresholds.push(value);
            pos += 8;
        }
        Ok(LevelTable { thresholds })
    }

    pub fn from_file(path: &Path) -> Result<Self, TableError> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_curve_is_monotonic() {
        let table = LevelTable::default();
        assert_eq!(table.exp_for_level(1), 0);
        assert!(table.exp_for_level(2) < table.exp_for_level(3));
        assert_eq!(table.level_for_exp(0), 1);
        let exp_10 = table.exp_for_level(10);
        assert_eq!(table.level_for_exp(exp_10), 10);
        assert_eq!(table.level_for_exp(exp_10 - 1), 9);
        assert_eq!(table.level_for_exp(u64::MAX), MAX_LEVEL);
    }

    #[test]
    fn common_table_round_trip() {
        let mut data = Vec::new();
        data.extend_from_slice(COMMON_MAGIC);
        for _ in 0..4 {
            data.extend_from_slice(&20u16.to_le_bytes());
            data.extend_from_slice(&80u16.to_le_bytes());
            data.push(50);
            data.push(25);
        }
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&[3u8; 12]);
        let table = CommonItemSet::from_bytes(&data).unwrap();
        assert_eq!(table.for_difficulty(0).meseta_max, 80);
        assert_eq!(table.item_pool().len(), 1);
        // Out-of-range difficulty clamps to Ultimate.
        assert_eq!(table.for_difficulty(9).meseta_min, 20);
    }

    #[test]
    fn malformed_tables_rejected() {
        assert!(CommonItemSet::from_bytes(b"nope").is_err());
        assert!(RareItemSet::from_bytes(b"RGRT").is_err());
        let mut inverted = Vec::new();
        inverted.extend_from_slice(COMMON_MAGIC);
        inverted.extend_from_slice(&80u16.to_le_bytes());
        inverted.extend_from_slice(&20u16.to_le_bytes());
        inverted.extend_from_slice(&[0, 0]);
        inverted.extend_from_slice(&[0u8; 24]);
        assert!(CommonItemSet::from_bytes(&inverted).is_err());
    }

    #[test]
    fn rare_entries_filter_by_section() {
        let set = RareItemSet::new(vec![RareItemEntry {
            enemy_type: 7,
            section_mask: 0b0000000010,
            chance: u32::MAX,
            item: ItemData([1; 12]),
        }]);
        assert_eq!(set.entries_for(7, 1).count(), 1);
        assert_eq!(set.entries_for(7, 2).count(), 0);
        assert_eq!(set.entries_for(8, 1).count(), 0);
    }
}
