//! The quest index: a directory scan that derives quest metadata from the
//! file names and pulls the human-readable strings out of the compressed
//! script headers.
//!
//! File names follow four grammars:
//!
//! - `b###-VV.bin`     battle mode
//! - `c###-VV.bin`     challenge mode
//! - `e###-gc3.bin`    Episode 3
//! - `q###-CAT-VV.bin` normal quests with a named category
//!
//! `VV` names the client dialect (`d1`, `dc`, `pc`, `gc`, `bb`); anything
//! that does not parse is skipped with a warning.

use crate::wire::Reader;
use hashbrown::HashMap;
use keel::compression;
use keel::logging;
use rigging::version::Version;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum QuestCategory {
    Retrieval,
    Extermination,
    Event,
    Shop,
    Vr,
    Tower,
    Government,
    Download,
    Battle,
    Challenge,
    Solo,
    Episode3,
}

impl QuestCategory {
    /// Battle, challenge and Episode 3 quests select a game mode rather
    /// than a mission.
    pub fn is_mode(self) -> bool {
        matches!(self, QuestCategory::Battle | QuestCategory::Challenge | QuestCategory::Episode3)
    }

    pub fn name(self) -> &'static str {
        match self {
            QuestCategory::Retrieval => "Retrieval",
            QuestCategory::Extermination => "Extermination",
            QuestCategory::Event => "Event",
            QuestCategory::Shop => "Shop",
            QuestCategory::Vr => "VR",
            QuestCategory::Tower => "Tower",
            QuestCategory::Government => "Government",
            QuestCategory::Download => "Download",
            QuestCategory::Battle => "Battle",
            QuestCategory::Challenge => "Challenge",
            QuestCategory::Solo => "Solo",
            QuestCategory::Episode3 => "Episode3",
        }
    }

    fn from_token(token: &str) -> Option<QuestCategory> {
        Some(match token {
            "ret" => QuestCategory::Retrieval,
            "ext" => QuestCategory::Extermination,
            "evt" => QuestCategory::Event,
            "shp" => QuestCategory::Shop,
            "vr" => QuestCategory::Vr,
            "twr" => QuestCategory::Tower,
            "gov" => QuestCategory::Government,
            "dl" => QuestCategory::Download,
            "1p" => QuestCategory::Solo,
            _ => return None,
        })
    }
}

fn version_from_token(token: &str) -> Option<(Version, bool)> {
    Some(match token {
        "d1" => (Version::Dc, true),
        "dc" => (Version::Dc, false),
        "pc" => (Version::Pc, false),
        "gc" => (Version::Gc, false),
        "gc3" => (Version::Gc, false),
        "bb" => (Version::Bb, false),
        _ => return None,
    })
}

#[derive(Debug)]
pub struct Quest {
    pub quest_id: u32,
    pub category: QuestCategory,
    /// 0 = ep1, 1 = ep2, 2 = ep4, 0xFF = ep3.
    pub episode: u8,
    pub is_dcv1: bool,
    pub joinable: bool,
    pub version: Version,
    pub name: String,
    pub short_description: String,
    pub long_description: String,
    /// Path without the `.bin`/`.dat` suffix.
    file_basename: PathBuf,
    bin_cache: Mutex<Option<Vec<u8>>>,
}

impl Quest {
    /// Parses one `.bin` path into quest metadata, reading the compressed
    /// header for the display strings.
    pub fn from_bin_path(path: &Path) -> Result<Quest, String> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| "not a utf-8 filename".to_string())?;
        let stem = file_name
            .strip_suffix(".bin")
            .ok_or_else(|| "missing .bin suffix".to_string())?;

        if stem.is_empty() {
            return Err("empty filename".to_string());
        }

        let mut category = match stem.as_bytes()[0] {
            b'b' => Some(QuestCategory::Battle),
            b'c' => Some(QuestCategory::Challenge),
            b'e' => Some(QuestCategory::Episode3),
            b'q' => None,
            _ => return Err("filename does not indicate a mode".to_string()),
        };

        let tokens: Vec<&str> = stem.split('-').collect();
        let expected_tokens = if category.is_none() { 3 } else { 2 };
        if tokens.len() != expected_tokens {
            return Err("incorrect filename format".to_string());
        }

        let quest_id: u32 = tokens[0][1..]
            .parse()
            .map_err(|_| "quest number is not numeric".to_string())?;

        if category.is_none() {
            category = QuestCategory::from_token(tokens[1]);
            if category.is_none() {
                return Err(format!("unknown quest category {}", tokens[1]));
            }
        }
        let category = category.unwrap();

        let (version, is_dcv1) = version_from_token(tokens[tokens.len() - 1])
            .ok_or_else(|| format!("unknown quest version {}", tokens[tokens.len() - 1]))?;

        let mut quest = Quest {
            quest_id,
            category,
            episode: if category == QuestCategory::Episode3 { 0xFF } else { 0 },
            is_dcv1,
            joinable: false,
            version,
            name: String::new(),
            short_description: String::new(),
            long_description: String::new(),
            file_basename: path.with_extension(""),
            bin_cache: Mutex::new(None),
        };
        quest.read_header()?;
        Ok(quest)
    }

    pub fn bin_filename(&self) -> PathBuf {
        self.file_basename.with_extension("bin")
    }

    pub fn dat_filename(&self) -> PathBuf {
        self.file_basename.with_extension("dat")
    }

    /// The decompressed script, decompressed once and cached.
    pub fn bin_contents(&self) -> Result<Vec<u8>, String> {
        let mut cache = self.bin_cache.lock().unwrap();
        if let Some(contents) = cache.as_ref() {
            return Ok(contents.clone());
        }
        let raw = fs::read(self.bin_filename()).map_err(|e| e.to_string())?;
        let contents = compression::decompress(&raw).map_err(|e| e.to_string())?;
        *cache = Some(contents.clone());
        Ok(contents)
    }

    pub fn dat_contents(&self) -> Result<Vec<u8>, String> {
        fs::read(self.dat_filename()).map_err(|e| e.to_string())
    }

    fn read_header(&mut self) -> Result<(), String> {
        let contents = self.bin_contents()?;
        let mut reader = Reader::new(&contents);

        let mut parse = || -> Result<(String, String, String, u8, bool), crate::wire::WireError> {
            match (self.version, self.category) {
                (_, QuestCategory::Episode3) => {
                    // The Episode 3 header is mostly map and cutscene data;
                    // only the text block matters here.
                    reader.skip(0x1DF0)?;
                    let name = reader.get_ascii(0x14)?;
                    let _location = reader.get_ascii(0x14)?;
                    let _location2 = reader.get_ascii(0x3C)?;
                    let description = reader.get_ascii(0x190)?;
                    Ok((name, description.clone(), description, 0xFF, false))
                }
                (Version::Dc, _) => {
                    reader.skip(16)?;
                    reader.skip(2)?; // language bytes
                    let _quest_number = reader.get_u16()?;
                    let name = reader.get_ascii(0x20)?;
                    let short = reader.get_ascii(0x80)?;
                    let long = reader.get_ascii(0x120)?;
                    Ok((name, short, long, 0, false))
                }
                (Version::Pc, _) => {
                    reader.skip(16)?;
                    reader.skip(2)?;
                    let _quest_number = reader.get_u16()?;
                    let name = reader.get_utf16(0x20)?;
                    let short = reader.get_utf16(0x80)?;
                    let long = reader.get_utf16(0x120)?;
                    Ok((name, short, long, 0, false))
                }
                (Version::Gc, _) => {
                    reader.skip(16)?;
                    reader.skip(2)?;
                    let _quest_number = reader.get_u8()?;
                    let episode_byte = reader.get_u8()?;
                    let name = reader.get_ascii(0x20)?;
                    let short = reader.get_ascii(0x80)?;
                    let long = reader.get_ascii(0x120)?;
                    // 1 means ep2; some quests carry 0xFF, which means ep1.
                    let episode = if episode_byte == 1 { 1 } else { 0 };
                    Ok((name, short, long, episode, false))
                }
                (Version::Bb, _) => {
                    reader.skip(16)?;
                    let _quest_number = reader.get_u16()?;
                    reader.skip(2)?;
                    let episode = reader.get_u8()?;
                    let _max_players = reader.get_u8()?;
                    let joinable = reader.get_u8()? != 0;
                    reader.skip(1)?;
                    let name = reader.get_utf16(0x20)?;
                    let short = reader.get_utf16(0x80)?;
                    let long = reader.get_utf16(0x120)?;
                    Ok((name, short, long, episode, joinable))
                }
                (Version::Patch, _) => {
                    Err(crate::wire::WireError::Truncated { wanted: 0, have: 0 })
                }
            }
        };

        let (name, short, long, episode, joinable) = parse().map_err(|e| e.to_string())?;
        self.name = name;
        self.short_description = short;
        self.long_description = long;
        if self.category != QuestCategory::Episode3 {
            self.episode = episode;
        }
        self.joinable = joinable;
        Ok(())
    }
}

pub struct QuestIndex {
    by_version_and_id: HashMap<(Version, u32), std::sync::Arc<Quest>>,
    by_category: HashMap<QuestCategory, Vec<std::sync::Arc<Quest>>>,
}

impl QuestIndex {
    pub fn empty() -> QuestIndex {
        QuestIndex { by_version_and_id: HashMap::new(), by_category: HashMap::new() }
    }

    /// Scans a quest directory. Files that fail to parse are logged and
    /// skipped; they never abort startup.
    pub fn load<P: AsRef<Path>>(directory: P, log: &logging::Logger) -> QuestIndex {
        let mut index = QuestIndex::empty();
        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(err) => {
                logging::warn!(log, "quest directory is unreadable"; "error" => %err);
                return index;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            match Quest::from_bin_path(&path) {
                Ok(quest) => index.insert(std::sync::Arc::new(quest)),
                Err(reason) => {
                    logging::warn!(log, "ignoring quest file";
                                   "file" => %path.display(),
                                   "reason" => reason);
                }
            }
        }

        index
    }

    fn insert(&mut self, quest: std::sync::Arc<Quest>) {
        self.by_category.entry(quest.category).or_insert_with(Vec::new).push(quest.clone());
        self.by_version_and_id.insert((quest.version, quest.quest_id), quest);
    }

    pub fn get(&self, version: Version, quest_id: u32) -> Option<&std::sync::Arc<Quest>> {
        self.by_version_and_id.get(&(version, quest_id))
    }

    /// Quests visible to one client version in one category, id-ordered.
    pub fn filter(
        &self,
        version: Version,
        is_dcv1: bool,
        category: QuestCategory,
    ) -> Vec<std::sync::Arc<Quest>> {
        let mut quests: Vec<_> = self
            .by_category
            .get(&category)
            .map(|quests| {
                quests
                    .iter()
                    .filter(|q| q.version == version && (!q.is_dcv1 || is_dcv1))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        quests.sort_by_key(|q| q.quest_id);
        quests
    }

    pub fn categories_with_quests(&self, version: Version) -> Vec<QuestCategory> {
        let mut categories: Vec<QuestCategory> = self
            .by_category
            .iter()
            .filter(|(_, quests)| quests.iter().any(|q| q.version == version))
            .map(|(category, _)| *category)
            .collect();
        categories.sort_by_key(|c| c.name());
        categories
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Writer;

    /// Builds a compressed GC-format quest script with the given strings.
    fn gc_quest_bin(name: &str, short: &str, long: &str, episode: u8) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.put_zeroes(16);
        writer.put_u16(0);
        writer.put_u8(7); // quest number inside the header
        writer.put_u8(episode);
        writer.put_ascii(name, 0x20);
        writer.put_ascii(short, 0x80);
        writer.put_ascii(long, 0x120);
        compress_literals(&writer.into_vec())
    }

    /// A trivial PRS stream: every byte literal, then the terminator.
    fn compress_literals(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut control: u16 = 0;
        let mut bits = 0;
        for &byte in data {
            control |= 1 << bits;
            bits += 1;
            pending.push(byte);
            if bits == 8 {
                out.push(control as u8);
                out.extend_from_slice(&pending);
                control = 0;
                bits = 0;
                pending.clear();
            }
        }
        // Terminator: bits 0,1 then a zero word. When only one bit is left
        // in the control byte, the 1 bit spills into a fresh control byte
        // that follows the pending literals.
        if bits == 7 {
            out.push(control as u8);
            out.extend_from_slice(&pending);
            out.push(0b1);
        } else {
            control |= 0b10 << bits;
            out.push(control as u8);
            out.extend_from_slice(&pending);
        }
        out.push(0);
        out.push(0);
        out
    }

    fn write_quest(dir: &Path, filename: &str, contents: &[u8]) {
        fs::write(dir.join(filename), contents).unwrap();
    }

    fn temp_quest_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pioneer-quest-test-{}", tag));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn filename_grammar_derives_category_and_version() {
        let dir = temp_quest_dir("grammar");
        write_quest(&dir, "q058-ret-gc.bin", &gc_quest_bin("Lost HEAT SWORD", "find it", "longer text", 0));
        write_quest(&dir, "b001-gc.bin", &gc_quest_bin("Battle 1", "fight", "fight more", 0));
        write_quest(&dir, "README.txt", b"not a quest");
        write_quest(&dir, "zzz-gc.bin", b"bogus");

        let index = QuestIndex::load(&dir, &logging::discard());

        let quest = index.get(Version::Gc, 58).unwrap();
        assert_eq!(quest.category, QuestCategory::Retrieval);
        assert_eq!(quest.name, "Lost HEAT SWORD");
        assert_eq!(quest.short_description, "find it");

        let battle = index.get(Version::Gc, 1).unwrap();
        assert_eq!(battle.category, QuestCategory::Battle);
        assert!(battle.category.is_mode());

        assert!(index.get(Version::Gc, 999).is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn episode_byte_maps_to_episode_two() {
        let dir = temp_quest_dir("episode");
        write_quest(&dir, "q100-gov-gc.bin", &gc_quest_bin("Seat of the Heart", "ep2", "ep2 quest", 1));
        let index = QuestIndex::load(&dir, &logging::discard());
        assert_eq!(index.get(Version::Gc, 100).unwrap().episode, 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn filter_is_version_gated_and_ordered() {
        let dir = temp_quest_dir("filter");
        write_quest(&dir, "q003-ret-gc.bin", &gc_quest_bin("Third", "3", "3", 0));
        write_quest(&dir, "q001-ret-gc.bin", &gc_quest_bin("First", "1", "1", 0));
        let index = QuestIndex::load(&dir, &logging::discard());

        let quests = index.filter(Version::Gc, false, QuestCategory::Retrieval);
        assert_eq!(quests.len(), 2);
        assert_eq!(quests[0].quest_id, 1);
        assert_eq!(quests[1].quest_id, 3);

        assert!(index.filter(Version::Pc, false, QuestCategory::Retrieval).is_empty());
        let _ = fs::remove_dir_all(&dir);
    }
}
