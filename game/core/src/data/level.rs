//! The character level table: base stats for each of the twelve classes and
//! two hundred per-level deltas per class. Ships compressed.

use crate::player::{CharStats, CLASS_COUNT};
use crate::wire::{Reader, WireError};
use keel::compression;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

pub const LEVELS_PER_CLASS: usize = 200;
const LEVEL_RECORD_SIZE: usize = 8;

#[derive(Debug)]
pub enum LevelTableError {
    Io(io::Error),
    Decompress(compression::DecompressError),
    Truncated(WireError),
}

impl fmt::Display for LevelTableError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LevelTableError::Io(err) => write!(f, "level table io error: {}", err),
            LevelTableError::Decompress(err) => write!(f, "level table decompression: {}", err),
            LevelTableError::Truncated(err) => write!(f, "level table layout: {}", err),
        }
    }
}

impl std::error::Error for LevelTableError {}

impl From<io::Error> for LevelTableError {
    fn from(err: io::Error) -> Self {
        LevelTableError::Io(err)
    }
}

impl From<compression::DecompressError> for LevelTableError {
    fn from(err: compression::DecompressError) -> Self {
        LevelTableError::Decompress(err)
    }
}

impl From<WireError> for LevelTableError {
    fn from(err: WireError) -> Self {
        LevelTableError::Truncated(err)
    }
}

/// Stat deltas granted by one level.
#[derive(Debug, Copy, Clone, Default)]
pub struct LevelStats {
    pub atp: u8,
    pub mst: u8,
    pub evp: u8,
    pub hp: u8,
    pub dfp: u8,
    pub ata: u8,
    pub lck: u8,
    pub tp: u8,
}

impl LevelStats {
    /// Applies this level's deltas to a running stat block. Luck is present
    /// in the data but never applied; the game does the same.
    pub fn apply(&self, stats: &mut CharStats) {
        stats.atp += u16::from(self.atp);
        stats.mst += u16::from(self.mst);
        stats.evp += u16::from(self.evp);
        stats.hp += u16::from(self.hp);
        stats.dfp += u16::from(self.dfp);
        stats.ata += u16::from(self.ata);
    }
}

pub struct LevelTable {
    base_stats: Vec<CharStats>,
    levels: Vec<Vec<LevelStats>>,
}

impl LevelTable {
    /// A table of zeroes, used until the real file is loaded.
    pub fn empty() -> LevelTable {
        LevelTable {
            base_stats: vec![CharStats::default(); CLASS_COUNT],
            levels: vec![vec![LevelStats::default(); LEVELS_PER_CLASS]; CLASS_COUNT],
        }
    }

    pub fn load<P: AsRef<Path>>(path: P, compressed: bool) -> Result<LevelTable, LevelTableError> {
        let raw = fs::read(path)?;
        let data = if compressed { compression::decompress(&raw)? } else { raw };
        Self::parse(&data)
    }

    pub fn parse(data: &[u8]) -> Result<LevelTable, LevelTableError> {
        let mut reader = Reader::new(data);

        let mut base_stats = Vec::with_capacity(CLASS_COUNT);
        for _ in 0..CLASS_COUNT {
            base_stats.push(CharStats::read(&mut reader)?);
        }

        let mut levels = Vec::with_capacity(CLASS_COUNT);
        for _ in 0..CLASS_COUNT {
            let mut class_levels = Vec::with_capacity(LEVELS_PER_CLASS);
            for _ in 0..LEVELS_PER_CLASS {
                let record = reader.get_bytes(LEVEL_RECORD_SIZE)?;
                class_levels.push(LevelStats {
                    atp: record[0],
                    mst: record[1],
                    evp: record[2],
                    hp: record[3],
                    dfp: record[4],
                    ata: record[5],
                    lck: record[6],
                    tp: record[7],
                });
            }
            levels.push(class_levels);
        }

        Ok(LevelTable { base_stats, levels })
    }

    pub fn base_stats_for_class(&self, char_class: u8) -> Option<&CharStats> {
        self.base_stats.get(char_class as usize)
    }

    pub fn stats_delta_for_level(&self, char_class: u8, level: u8) -> Option<&LevelStats> {
        self.levels.get(char_class as usize)?.get(level as usize)
    }

    /// Rebuilds a stat block by walking a class from level 0 to `level`.
    pub fn stats_at_level(&self, char_class: u8, level: u8) -> Option<CharStats> {
        let mut stats = *self.base_stats_for_class(char_class)?;
        for step in 1..=level {
            self.stats_delta_for_level(char_class, step)?.apply(&mut stats);
        }
        Some(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Vec<u8> {
        let mut data = Vec::new();
        // Base stats: class c gets every stat set to c+1.
        for class in 0..CLASS_COUNT as u16 {
            for _ in 0..7 {
                data.extend_from_slice(&(class + 1).to_le_bytes());
            }
        }
        // Levels: every level grants +2 of everything.
        for _ in 0..CLASS_COUNT {
            for _ in 0..LEVELS_PER_CLASS {
                data.extend_from_slice(&[2u8; LEVEL_RECORD_SIZE]);
            }
        }
        data
    }

    #[test]
    fn parse_and_walk_levels() {
        let table = LevelTable::parse(&fixture()).unwrap();
        let base = table.base_stats_for_class(2).unwrap();
        assert_eq!(base.atp, 3);

        let at_ten = table.stats_at_level(2, 10).unwrap();
        assert_eq!(at_ten.atp, 3 + 20);
        assert_eq!(at_ten.hp, 3 + 20);
        // Luck never accumulates from levels.
        assert_eq!(at_ten.lck, 3);
    }

    #[test]
    fn out_of_range_lookups_are_none() {
        let table = LevelTable::parse(&fixture()).unwrap();
        assert!(table.base_stats_for_class(12).is_none());
        assert!(table.stats_delta_for_level(0, 200).is_none());
    }

    #[test]
    fn truncated_table_fails() {
        assert!(LevelTable::parse(&[0u8; 100]).is_err());
    }
}
