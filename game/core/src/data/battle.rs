//! Monster combat parameters, indexed by online/offline mode, episode,
//! difficulty and monster type. The file is a dense array of fixed-size
//! records.

use crate::wire::{Reader, WireError};
use std::fs;
use std::io;
use std::path::Path;

pub const EPISODES: usize = 3;
pub const DIFFICULTIES: usize = 4;
pub const MONSTER_TYPES: usize = 0x60;
const RECORD_SIZE: usize = 40;

/// One monster's parameters at one difficulty.
#[derive(Debug, Copy, Clone, Default)]
pub struct BattleParams {
    pub atp: u16,
    pub psv: u16,
    pub evp: u16,
    pub hp: u16,
    pub dfp: u16,
    pub ata: u16,
    pub lck: u16,
    pub experience: u32,
    pub difficulty: u32,
}

impl BattleParams {
    fn read(reader: &mut Reader) -> Result<BattleParams, WireError> {
        let params = BattleParams {
            atp: reader.get_u16()?,
            psv: reader.get_u16()?,
            evp: reader.get_u16()?,
            hp: reader.get_u16()?,
            dfp: reader.get_u16()?,
            ata: reader.get_u16()?,
            lck: reader.get_u16()?,
            experience: {
                reader.skip(14)?;
                reader.get_u32()?
            },
            difficulty: reader.get_u32()?,
        };
        reader.skip(RECORD_SIZE - 36)?;
        Ok(params)
    }
}

pub struct BattleParamTable {
    // online/offline, episode, difficulty, monster type
    entries: Vec<BattleParams>,
}

impl BattleParamTable {
    pub fn empty() -> BattleParamTable {
        BattleParamTable {
            entries: vec![BattleParams::default(); 2 * EPISODES * DIFFICULTIES * MONSTER_TYPES],
        }
    }

    /// Loads the online and offline variants from `<prefix>_on.dat` and
    /// `<prefix>.dat`.
    pub fn load<P: AsRef<Path>>(prefix: P) -> io::Result<BattleParamTable> {
        let prefix = prefix.as_ref().to_string_lossy().into_owned();
        let offline = fs::read(format!("{}.dat", prefix))?;
        let online = fs::read(format!("{}_on.dat", prefix))?;
        let mut table = BattleParamTable::empty();
        table.fill(false, &offline);
        table.fill(true, &online);
        Ok(table)
    }

    fn fill(&mut self, online: bool, data: &[u8]) {
        let mut reader = Reader::new(data);
        for episode in 0..EPISODES {
            for difficulty in 0..DIFFICULTIES {
                for monster in 0..MONSTER_TYPES {
                    match BattleParams::read(&mut reader) {
                        Ok(params) => {
                            let index =
                                self.index_of(online, episode as u8, difficulty as u8, monster as u8);
                            self.entries[index] = params;
                        }
                        Err(_) => return,
                    }
                }
            }
        }
    }

    fn index_of(&self, online: bool, episode: u8, difficulty: u8, monster_type: u8) -> usize {
        let online = online as usize;
        (((online * EPISODES + episode as usize) * DIFFICULTIES) + difficulty as usize)
            * MONSTER_TYPES
            + monster_type as usize
    }

    pub fn get(
        &self,
        online: bool,
        episode: u8,
        difficulty: u8,
        monster_type: u8,
    ) -> Option<&BattleParams> {
        if episode as usize >= EPISODES
            || difficulty as usize >= DIFFICULTIES
            || monster_type as usize >= MONSTER_TYPES
        {
            return None;
        }
        self.entries.get(self.index_of(online, episode, difficulty, monster_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_lookup() {
        let mut data = Vec::new();
        for record in 0..(EPISODES * DIFFICULTIES * MONSTER_TYPES) as u32 {
            let mut bytes = [0u8; RECORD_SIZE];
            bytes[0] = (record & 0xFF) as u8; // atp low byte
            bytes[28..32].copy_from_slice(&(record * 10).to_le_bytes()); // experience
            data.extend_from_slice(&bytes);
        }

        let mut table = BattleParamTable::empty();
        table.fill(true, &data);

        let first = table.get(true, 0, 0, 0).unwrap();
        assert_eq!(first.experience, 0);

        let second = table.get(true, 0, 0, 1).unwrap();
        assert_eq!(second.atp, 1);
        assert_eq!(second.experience, 10);

        // The offline half stays zeroed.
        assert_eq!(table.get(false, 0, 0, 1).unwrap().experience, 0);
        assert!(table.get(true, 3, 0, 0).is_none());
    }
}
