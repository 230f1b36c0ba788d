//! Episode 3 card and map indices. The definitions themselves are opaque
//! compressed blobs forwarded to clients verbatim; the server only needs to
//! look entries up by id and hand out the compressed archives.

use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use keel::compression::{self, DecompressError};
use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug)]
pub enum Ep3DataError {
    Io(io::Error),
    Decompress(DecompressError),
}

impl std::fmt::Display for Ep3DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Ep3DataError::Io(err) => write!(f, "ep3 data io error: {}", err),
            Ep3DataError::Decompress(err) => write!(f, "ep3 data decompression: {}", err),
        }
    }
}

impl std::error::Error for Ep3DataError {}

impl From<io::Error> for Ep3DataError {
    fn from(err: io::Error) -> Self {
        Ep3DataError::Io(err)
    }
}

impl From<DecompressError> for Ep3DataError {
    fn from(err: DecompressError) -> Self {
        Ep3DataError::Decompress(err)
    }
}

const CARD_RECORD_SIZE: usize = 0x108;

/// Card definitions, indexed by card id. The full compressed archive is
/// kept around because the B8 update command ships it whole.
pub struct Ep3CardIndex {
    compressed: Vec<u8>,
    card_ids: HashMap<u32, usize>,
}

impl Ep3CardIndex {
    pub fn empty() -> Ep3CardIndex {
        Ep3CardIndex { compressed: Vec::new(), card_ids: HashMap::new() }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Ep3CardIndex, Ep3DataError> {
        let compressed = fs::read(path)?;
        let decompressed = compression::decompress(&compressed)?;

        // Card id lives in the first dword of each fixed-size record.
        let mut card_ids = HashMap::new();
        for (index, record) in decompressed.chunks_exact(CARD_RECORD_SIZE).enumerate() {
            let id = LittleEndian::read_u32(&record[..4]);
            card_ids.insert(id, index);
        }

        Ok(Ep3CardIndex { compressed, card_ids })
    }

    pub fn compressed_definitions(&self) -> &[u8] {
        &self.compressed
    }

    pub fn card_count(&self) -> usize {
        self.card_ids.len()
    }

    pub fn has_card(&self, card_id: u32) -> bool {
        self.card_ids.contains_key(&card_id)
    }
}

/// One battle map: its id and the compressed map blob.
pub struct Ep3Map {
    pub map_id: u32,
    pub compressed_data: Vec<u8>,
}

pub struct Ep3MapIndex {
    maps: HashMap<u32, Ep3Map>,
}

impl Ep3MapIndex {
    pub fn empty() -> Ep3MapIndex {
        Ep3MapIndex { maps: HashMap::new() }
    }

    /// Scans a directory of compressed map files. The map id is the first
    /// dword of the decompressed contents.
    pub fn load<P: AsRef<Path>>(directory: P) -> Result<Ep3MapIndex, Ep3DataError> {
        let mut maps = HashMap::new();
        for entry in fs::read_dir(directory)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let compressed_data = fs::read(entry.path())?;
            let decompressed = match compression::decompress(&compressed_data) {
                Ok(data) => data,
                Err(_) => continue,
            };
            if decompressed.len() < 4 {
                continue;
            }
            let map_id = LittleEndian::read_u32(&decompressed[..4]);
            maps.insert(map_id, Ep3Map { map_id, compressed_data });
        }
        Ok(Ep3MapIndex { maps })
    }

    pub fn get(&self, map_id: u32) -> Option<&Ep3Map> {
        self.maps.get(&map_id)
    }

    pub fn map_count(&self) -> usize {
        self.maps.len()
    }

    /// A compact listing of (id, size) pairs for the map-list broadcast.
    pub fn list_entries(&self) -> Vec<(u32, u32)> {
        let mut entries: Vec<(u32, u32)> =
            self.maps.values().map(|m| (m.map_id, m.compressed_data.len() as u32)).collect();
        entries.sort_by_key(|&(id, _)| id);
        entries
    }
}
