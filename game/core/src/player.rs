//! The in-memory character and its wire/disk serializations. The Blue Burst
//! shape is canonical: every other dialect's data is converted to it on
//! ingest and back on the way out.

use crate::items::{self, Bank, Inventory, InventoryItem, ItemError};
use crate::wire::{Reader, WireError, Writer};
use keel::text;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

pub const NAME_WIDTH: usize = 0x10;
pub const GUILD_CARD_DESC_WIDTH: usize = 0x58;
pub const INFO_BOARD_WIDTH: usize = 0xAC;
pub const AUTO_REPLY_WIDTH: usize = 0xAC;
pub const TEAM_NAME_WIDTH: usize = 0x10;
pub const BLOCKED_SENDERS: usize = 30;

pub const TECHNIQUE_COUNT: usize = 0x14;
pub const CONFIG_PCGC_SIZE: usize = 0x48;
pub const CONFIG_BB_SIZE: usize = 0xE8;

pub const QUEST_DATA1_SIZE: usize = 0x208;
pub const QUEST_DATA2_SIZE: usize = 0x58;
pub const CHALLENGE_DATA_SIZE: usize = 0x140;
pub const TECH_MENU_CONFIG_SIZE: usize = 0x28;
pub const SYMBOL_CHATS_SIZE: usize = 0x04E0;
pub const SHORTCUTS_SIZE: usize = 0x0A40;
pub const KEY_CONFIG_SIZE: usize = 0x0AF0;
pub const GUILD_CARD_FILE_SIZE: usize = 0xD5A0;

const PLAYER_FILE_SIGNATURE: &str = "pioneer character file; sequential sections; rev 1";
const ACCOUNT_FILE_SIGNATURE: &str = "pioneer account file; sequential sections; rev 1";
const SIGNATURE_WIDTH: usize = 0x40;

/// There are twelve character classes; the PC client only knows the first
/// nine, so exports substitute lookalikes (and fall back to an NPC model
/// when even that fails).
pub const CLASS_COUNT: usize = 12;
pub const PC_CLASS_COUNT: usize = 9;

#[derive(Debug)]
pub enum PlayerFileError {
    BadSignature,
    Truncated(WireError),
    Io(io::Error),
}

impl fmt::Display for PlayerFileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PlayerFileError::BadSignature => write!(f, "save file signature mismatch"),
            PlayerFileError::Truncated(err) => write!(f, "save file truncated: {}", err),
            PlayerFileError::Io(err) => write!(f, "save file io error: {}", err),
        }
    }
}

impl std::error::Error for PlayerFileError {}

impl From<WireError> for PlayerFileError {
    fn from(err: WireError) -> Self {
        PlayerFileError::Truncated(err)
    }
}

impl From<io::Error> for PlayerFileError {
    fn from(err: io::Error) -> Self {
        PlayerFileError::Io(err)
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CharStats {
    pub atp: u16,
    pub mst: u16,
    pub evp: u16,
    pub hp: u16,
    pub dfp: u16,
    pub ata: u16,
    pub lck: u16,
}

impl CharStats {
    pub fn write(&self, writer: &mut Writer) {
        writer.put_u16(self.atp);
        writer.put_u16(self.mst);
        writer.put_u16(self.evp);
        writer.put_u16(self.hp);
        writer.put_u16(self.dfp);
        writer.put_u16(self.ata);
        writer.put_u16(self.lck);
    }

    pub fn read(reader: &mut Reader) -> Result<CharStats, WireError> {
        Ok(CharStats {
            atp: reader.get_u16()?,
            mst: reader.get_u16()?,
            evp: reader.get_u16()?,
            hp: reader.get_u16()?,
            dfp: reader.get_u16()?,
            ata: reader.get_u16()?,
            lck: reader.get_u16()?,
        })
    }
}

/// Appearance and progression data, held in the wide (Blue Burst) shape.
#[derive(Clone)]
pub struct DispData {
    pub stats: CharStats,
    pub unknown1: u16,
    pub unknown2: [u32; 2],
    pub level: u32,
    pub experience: u32,
    pub meseta: u32,
    pub guild_card: String,
    pub unknown3: [u32; 2],
    pub name_color: u32,
    pub extra_model: u8,
    pub play_time: u32,
    pub name_color_checksum: u32,
    pub section_id: u8,
    pub char_class: u8,
    pub v2_flags: u8,
    pub version: u8,
    pub v1_flags: u32,
    pub costume: u16,
    pub skin: u16,
    pub face: u16,
    pub head: u16,
    pub hair: u16,
    pub hair_r: u16,
    pub hair_g: u16,
    pub hair_b: u16,
    pub proportion_x: f32,
    pub proportion_y: f32,
    pub name: String,
    pub config: [u8; CONFIG_BB_SIZE],
    pub technique_levels: [u8; TECHNIQUE_COUNT],
}

impl Default for DispData {
    fn default() -> DispData {
        DispData {
            stats: CharStats::default(),
            unknown1: 0,
            unknown2: [0; 2],
            level: 0,
            experience: 0,
            meseta: 0,
            guild_card: "         0".to_string(),
            unknown3: [0; 2],
            name_color: 0xFFFF_FFFF,
            extra_model: 0,
            play_time: 0,
            name_color_checksum: 0,
            section_id: 0,
            char_class: 0,
            v2_flags: 0,
            version: 3,
            v1_flags: 0x25,
            costume: 0,
            skin: 0,
            face: 0,
            head: 0,
            hair: 0,
            hair_r: 0,
            hair_g: 0,
            hair_b: 0,
            proportion_x: 0.0,
            proportion_y: 0.0,
            name: String::new(),
            config: [0; CONFIG_BB_SIZE],
            technique_levels: [0xFF; TECHNIQUE_COUNT],
        }
    }
}

impl DispData {
    /// Normalizes the display name at ingest time: exactly one language
    /// marker, defaulting to 'J' the way the Japanese-era clients do.
    pub fn normalize_name(&mut self) {
        let bare = text::remove_language_marker(&self.name).to_string();
        self.name = text::add_language_marker(&bare, 'J');
    }

    /// Serializes the narrow (PC/GC) 0xD0-byte shape.
    pub fn write_pcgc(&self, writer: &mut Writer) {
        self.stats.write(writer);
        writer.put_u16(self.unknown1);
        writer.put_u32(self.unknown2[0]);
        writer.put_u32(self.unknown2[1]);
        writer.put_u32(self.level);
        writer.put_u32(self.experience);
        writer.put_u32(self.meseta);
        writer.put_ascii(text::remove_language_marker(&self.name), NAME_WIDTH);
        writer.put_u32(self.unknown3[0]);
        writer.put_u32(self.unknown3[1]);
        writer.put_u32(self.name_color);
        writer.put_u8(self.extra_model);
        writer.put_zeroes(15);
        writer.put_u32(self.name_color_checksum);
        writer.put_u8(self.section_id);
        writer.put_u8(self.char_class);
        writer.put_u8(self.v2_flags);
        writer.put_u8(self.version);
        writer.put_u32(self.v1_flags);
        writer.put_u16(self.costume);
        writer.put_u16(self.skin);
        writer.put_u16(self.face);
        writer.put_u16(self.head);
        writer.put_u16(self.hair);
        writer.put_u16(self.hair_r);
        writer.put_u16(self.hair_g);
        writer.put_u16(self.hair_b);
        writer.put_f32(self.proportion_x);
        writer.put_f32(self.proportion_y);
        writer.put_bytes(&self.config[..CONFIG_PCGC_SIZE]);
        writer.put_bytes(&self.technique_levels);
    }

    pub fn read_pcgc(reader: &mut Reader) -> Result<DispData, WireError> {
        let mut disp = DispData::default();
        disp.stats = CharStats::read(reader)?;
        disp.unknown1 = reader.get_u16()?;
        disp.unknown2 = [reader.get_u32()?, reader.get_u32()?];
        disp.level = reader.get_u32()?;
        disp.experience = reader.get_u32()?;
        disp.meseta = reader.get_u32()?;
        disp.name = reader.get_ascii(NAME_WIDTH)?;
        disp.unknown3 = [reader.get_u32()?, reader.get_u32()?];
        disp.name_color = reader.get_u32()?;
        disp.extra_model = reader.get_u8()?;
        reader.skip(15)?;
        disp.name_color_checksum = reader.get_u32()?;
        disp.section_id = reader.get_u8()?;
        disp.char_class = reader.get_u8()?;
        disp.v2_flags = reader.get_u8()?;
        disp.version = reader.get_u8()?;
        disp.v1_flags = reader.get_u32()?;
        disp.costume = reader.get_u16()?;
        disp.skin = reader.get_u16()?;
        disp.face = reader.get_u16()?;
        disp.head = reader.get_u16()?;
        disp.hair = reader.get_u16()?;
        disp.hair_r = reader.get_u16()?;
        disp.hair_g = reader.get_u16()?;
        disp.hair_b = reader.get_u16()?;
        disp.proportion_x = reader.get_f32()?;
        disp.proportion_y = reader.get_f32()?;
        disp.config[..CONFIG_PCGC_SIZE].copy_from_slice(reader.get_bytes(CONFIG_PCGC_SIZE)?);
        disp.technique_levels.copy_from_slice(reader.get_bytes(TECHNIQUE_COUNT)?);
        disp.normalize_name();
        Ok(disp)
    }

    /// Serializes the wide (Blue Burst) shape.
    pub fn write_bb(&self, writer: &mut Writer) {
        self.stats.write(writer);
        writer.put_u16(self.unknown1);
        writer.put_u32(self.unknown2[0]);
        writer.put_u32(self.unknown2[1]);
        writer.put_u32(self.level);
        writer.put_u32(self.experience);
        writer.put_u32(self.meseta);
        writer.put_ascii(&self.guild_card, NAME_WIDTH);
        writer.put_u32(self.unknown3[0]);
        writer.put_u32(self.unknown3[1]);
        writer.put_u32(self.name_color);
        writer.put_u8(self.extra_model);
        writer.put_zeroes(11);
        writer.put_u32(self.play_time);
        writer.put_u32(self.name_color_checksum);
        writer.put_u8(self.section_id);
        writer.put_u8(self.char_class);
        writer.put_u8(self.v2_flags);
        writer.put_u8(self.version);
        writer.put_u32(self.v1_flags);
        writer.put_u16(self.costume);
        writer.put_u16(self.skin);
        writer.put_u16(self.face);
        writer.put_u16(self.head);
        writer.put_u16(self.hair);
        writer.put_u16(self.hair_r);
        writer.put_u16(self.hair_g);
        writer.put_u16(self.hair_b);
        writer.put_f32(self.proportion_x);
        writer.put_f32(self.proportion_y);
        writer.put_utf16(&self.name, NAME_WIDTH);
        writer.put_bytes(&self.config);
        writer.put_bytes(&self.technique_levels);
    }

    pub fn read_bb(reader: &mut Reader) -> Result<DispData, WireError> {
        let mut disp = DispData::default();
        disp.stats = CharStats::read(reader)?;
        disp.unknown1 = reader.get_u16()?;
        disp.unknown2 = [reader.get_u32()?, reader.get_u32()?];
        disp.level = reader.get_u32()?;
        disp.experience = reader.get_u32()?;
        disp.meseta = reader.get_u32()?;
        disp.guild_card = reader.get_ascii(NAME_WIDTH)?;
        disp.unknown3 = [reader.get_u32()?, reader.get_u32()?];
        disp.name_color = reader.get_u32()?;
        disp.extra_model = reader.get_u8()?;
        reader.skip(11)?;
        disp.play_time = reader.get_u32()?;
        disp.name_color_checksum = reader.get_u32()?;
        disp.section_id = reader.get_u8()?;
        disp.char_class = reader.get_u8()?;
        disp.v2_flags = reader.get_u8()?;
        disp.version = reader.get_u8()?;
        disp.v1_flags = reader.get_u32()?;
        disp.costume = reader.get_u16()?;
        disp.skin = reader.get_u16()?;
        disp.face = reader.get_u16()?;
        disp.head = reader.get_u16()?;
        disp.hair = reader.get_u16()?;
        disp.hair_r = reader.get_u16()?;
        disp.hair_g = reader.get_u16()?;
        disp.hair_b = reader.get_u16()?;
        disp.proportion_x = reader.get_f32()?;
        disp.proportion_y = reader.get_f32()?;
        disp.name = reader.get_utf16(NAME_WIDTH)?;
        disp.config.copy_from_slice(reader.get_bytes(CONFIG_BB_SIZE)?);
        disp.technique_levels.copy_from_slice(reader.get_bytes(TECHNIQUE_COUNT)?);
        disp.normalize_name();
        Ok(disp)
    }

    /// The character-select preview shape sent to Blue Burst clients.
    pub fn write_bb_preview(&self, writer: &mut Writer) {
        writer.put_u32(self.experience);
        writer.put_u32(self.level);
        writer.put_ascii(&self.guild_card, NAME_WIDTH);
        writer.put_u32(self.unknown3[0]);
        writer.put_u32(self.unknown3[1]);
        writer.put_u32(self.name_color);
        writer.put_u8(self.extra_model);
        writer.put_zeroes(15);
        writer.put_u32(self.name_color_checksum);
        writer.put_u8(self.section_id);
        writer.put_u8(self.char_class);
        writer.put_u8(self.v2_flags);
        writer.put_u8(self.version);
        writer.put_u32(self.v1_flags);
        writer.put_u16(self.costume);
        writer.put_u16(self.skin);
        writer.put_u16(self.face);
        writer.put_u16(self.head);
        writer.put_u16(self.hair);
        writer.put_u16(self.hair_r);
        writer.put_u16(self.hair_g);
        writer.put_u16(self.hair_b);
        writer.put_f32(self.proportion_x);
        writer.put_f32(self.proportion_y);
        writer.put_utf16(&self.name, NAME_WIDTH);
        writer.put_u32(self.play_time);
    }

    /// The class index shown to a PC client, substituting the three classes
    /// that version never shipped.
    pub fn pc_char_class(&self) -> u8 {
        match self.char_class {
            11 => 0, // FOmar walks as HUmar
            10 => 1, // RAmarl walks as HUnewearl
            9 => 5,  // HUcaseal walks as RAcaseal
            other => other,
        }
    }
}

/// The complete in-memory character, canonical shape.
#[derive(Clone)]
pub struct Player {
    pub disp: DispData,
    pub inventory: Inventory,
    pub bank: Bank,
    pub bank_name: String,
    pub guild_card_desc: String,
    pub auto_reply: String,
    pub info_board: String,
    pub blocked: [u32; BLOCKED_SENDERS],
    pub team_name: String,
    pub option_flags: u32,
    pub quest_data1: Vec<u8>,
    pub quest_data2: Vec<u8>,
    pub challenge_data: Vec<u8>,
    pub tech_menu_config: Vec<u8>,
    pub symbol_chats: Vec<u8>,
    pub shortcuts: Vec<u8>,
    pub key_config: Vec<u8>,
    pub guild_cards: Vec<u8>,
}

impl Default for Player {
    fn default() -> Player {
        Player {
            disp: DispData::default(),
            inventory: Inventory::default(),
            bank: Bank::default(),
            bank_name: String::new(),
            guild_card_desc: String::new(),
            auto_reply: String::new(),
            info_board: String::new(),
            blocked: [0; BLOCKED_SENDERS],
            team_name: String::new(),
            option_flags: 0,
            quest_data1: vec![0; QUEST_DATA1_SIZE],
            quest_data2: vec![0; QUEST_DATA2_SIZE],
            challenge_data: vec![0; CHALLENGE_DATA_SIZE],
            tech_menu_config: vec![0; TECH_MENU_CONFIG_SIZE],
            symbol_chats: vec![0; SYMBOL_CHATS_SIZE],
            shortcuts: vec![0; SHORTCUTS_SIZE],
            key_config: vec![0; KEY_CONFIG_SIZE],
            guild_cards: vec![0; GUILD_CARD_FILE_SIZE],
        }
    }
}

impl Player {
    pub fn add_item(&mut self, item: InventoryItem) -> Result<(), ItemError> {
        items::add_to_inventory(&mut self.inventory, &mut self.disp.meseta, item)
    }

    pub fn remove_item(&mut self, item_id: u32, amount: u32) -> Result<InventoryItem, ItemError> {
        items::remove_from_inventory(&mut self.inventory, &mut self.disp.meseta, item_id, amount)
    }

    /// Ingests a PC 61 command body.
    pub fn import_pc(&mut self, reader: &mut Reader) -> Result<(), WireError> {
        self.inventory = Inventory::read(reader)?;
        self.disp = DispData::read_pcgc(reader)?;
        self.auto_reply.clear();
        Ok(())
    }

    /// Ingests a GC 61 command body, which carries the info board, blocked
    /// list and auto reply after the display block.
    pub fn import_gc(&mut self, reader: &mut Reader) -> Result<(), WireError> {
        self.inventory = Inventory::read(reader)?;
        self.disp = DispData::read_pcgc(reader)?;
        reader.skip(0x134)?;
        self.info_board = reader.get_ascii(INFO_BOARD_WIDTH)?;
        for entry in self.blocked.iter_mut() {
            *entry = reader.get_u32()?;
        }
        let auto_reply_enabled = reader.get_u32()? != 0;
        self.auto_reply =
            if auto_reply_enabled { reader.get_text_to_end(false) } else { String::new() };
        Ok(())
    }

    /// Ingests a BB 61 command body. The inventory and display block are
    /// authoritative server-side already, so only the trailing fields are
    /// taken.
    pub fn import_bb(&mut self, reader: &mut Reader) -> Result<(), WireError> {
        let _ = Inventory::read(reader)?;
        let _ = DispData::read_bb(reader)?;
        reader.skip(0x174)?;
        self.info_board = reader.get_utf16(INFO_BOARD_WIDTH)?;
        for entry in self.blocked.iter_mut() {
            *entry = reader.get_u32()?;
        }
        let auto_reply_enabled = reader.get_u32()? != 0;
        self.auto_reply =
            if auto_reply_enabled { reader.get_text_to_end(true) } else { String::new() };
        Ok(())
    }

    /// Serializes the lobby-join entry body (inventory + display block) for
    /// a narrow-format client. `for_pc` applies the PC class substitutions.
    pub fn write_lobby_data_pcgc(&self, writer: &mut Writer, for_pc: bool) {
        self.inventory.write(writer);
        if for_pc {
            let mut disp = self.disp.clone();
            disp.char_class = disp.pc_char_class();
            if disp.char_class as usize >= PC_CLASS_COUNT {
                disp.extra_model = 0;
                disp.v2_flags |= 0x02;
            }
            disp.version = 2;
            disp.write_pcgc(writer);
        } else {
            self.disp.write_pcgc(writer);
        }
    }

    pub fn write_lobby_data_bb(&self, writer: &mut Writer) {
        self.inventory.write(writer);
        self.disp.write_bb(writer);
    }

    /// Serializes the full Blue Burst player blob (the E7 command body).
    pub fn write_bb_player(&self, writer: &mut Writer, serial_number: u32) {
        self.inventory.write(writer);
        self.disp.write_bb(writer);
        writer.put_zeroes(0x10);
        writer.put_u32(self.option_flags);
        writer.put_bytes(&self.quest_data1);
        self.write_bank_padded(writer);
        writer.put_u32(serial_number);
        writer.put_utf16(&self.disp.name, 0x18);
        writer.put_utf16(&self.team_name, TEAM_NAME_WIDTH);
        writer.put_utf16(&self.guild_card_desc, GUILD_CARD_DESC_WIDTH);
        writer.put_u8(0);
        writer.put_u8(0);
        writer.put_u8(self.disp.section_id);
        writer.put_u8(self.disp.char_class);
        writer.put_u32(0);
        writer.put_bytes(&self.symbol_chats);
        writer.put_bytes(&self.shortcuts);
        writer.put_utf16(&self.auto_reply, AUTO_REPLY_WIDTH);
        writer.put_utf16(&self.info_board, INFO_BOARD_WIDTH);
        writer.put_zeroes(0x1C);
        writer.put_bytes(&self.challenge_data);
        writer.put_bytes(&self.tech_menu_config);
        writer.put_zeroes(0x2C);
        writer.put_bytes(&self.quest_data2);
        writer.put_bytes(&self.key_config);
    }

    /// Bank serialization padded to the full 200-slot on-disk shape.
    fn write_bank_padded(&self, writer: &mut Writer) {
        writer.put_u32(self.bank.items.len() as u32);
        writer.put_u32(self.bank.meseta);
        for item in &self.bank.items {
            item.write(writer);
        }
        for _ in self.bank.items.len()..items::BANK_SLOTS {
            writer.put_zeroes(24);
        }
    }

    fn read_bank_padded(reader: &mut Reader) -> Result<Bank, WireError> {
        let count = reader.get_u32()? as usize;
        let meseta = reader.get_u32()?;
        let mut bank = Bank { meseta, items: Vec::with_capacity(count.min(items::BANK_SLOTS)) };
        for slot in 0..items::BANK_SLOTS {
            let item = crate::items::BankItem::read(reader)?;
            if slot < count {
                bank.items.push(item);
            }
        }
        Ok(bank)
    }

    /// Serializes the character save file.
    pub fn player_file_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.put_ascii(PLAYER_FILE_SIGNATURE, SIGNATURE_WIDTH);
        self.disp.write_bb_preview(&mut writer);
        writer.put_utf16(&self.auto_reply, AUTO_REPLY_WIDTH);
        self.write_bank_padded(&mut writer);
        writer.put_bytes(&self.challenge_data);
        self.disp.write_bb(&mut writer);
        writer.put_utf16(&self.guild_card_desc, GUILD_CARD_DESC_WIDTH);
        writer.put_utf16(&self.info_board, INFO_BOARD_WIDTH);
        self.inventory.write(&mut writer);
        writer.put_bytes(&self.quest_data1);
        writer.put_bytes(&self.quest_data2);
        writer.put_bytes(&self.tech_menu_config);
        writer.into_vec()
    }

    /// Loads the character sections from a save file, failing when the
    /// signature does not match.
    pub fn load_player_bytes(&mut self, data: &[u8]) -> Result<(), PlayerFileError> {
        let mut reader = Reader::new(data);
        let signature = reader.get_ascii(SIGNATURE_WIDTH)?;
        if signature != PLAYER_FILE_SIGNATURE {
            return Err(PlayerFileError::BadSignature);
        }
        reader.skip(PREVIEW_SIZE)?;
        self.auto_reply = reader.get_utf16(AUTO_REPLY_WIDTH)?;
        self.bank = Self::read_bank_padded(&mut reader)?;
        self.challenge_data = reader.get_bytes(CHALLENGE_DATA_SIZE)?.to_vec();
        self.disp = DispData::read_bb(&mut reader)?;
        self.guild_card_desc = reader.get_utf16(GUILD_CARD_DESC_WIDTH)?;
        self.info_board = reader.get_utf16(INFO_BOARD_WIDTH)?;
        self.inventory = Inventory::read(&mut reader)?;
        self.quest_data1 = reader.get_bytes(QUEST_DATA1_SIZE)?.to_vec();
        self.quest_data2 = reader.get_bytes(QUEST_DATA2_SIZE)?.to_vec();
        self.tech_menu_config = reader.get_bytes(TECH_MENU_CONFIG_SIZE)?.to_vec();
        Ok(())
    }

    pub fn save_player<P: AsRef<Path>>(&self, path: P) -> Result<(), PlayerFileError> {
        fs::write(path, self.player_file_bytes())?;
        Ok(())
    }

    pub fn load_player<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PlayerFileError> {
        let data = fs::read(path)?;
        self.load_player_bytes(&data)
    }

    /// Serializes the account save file.
    pub fn account_file_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.put_ascii(ACCOUNT_FILE_SIGNATURE, SIGNATURE_WIDTH);
        for entry in &self.blocked {
            writer.put_u32(*entry);
        }
        writer.put_bytes(&self.guild_cards);
        writer.put_bytes(&self.key_config);
        writer.put_u32(self.option_flags);
        writer.put_bytes(&self.shortcuts);
        writer.put_bytes(&self.symbol_chats);
        writer.put_utf16(&self.team_name, TEAM_NAME_WIDTH);
        writer.into_vec()
    }

    pub fn load_account_bytes(&mut self, data: &[u8]) -> Result<(), PlayerFileError> {
        let mut reader = Reader::new(data);
        let signature = reader.get_ascii(SIGNATURE_WIDTH)?;
        if signature != ACCOUNT_FILE_SIGNATURE {
            return Err(PlayerFileError::BadSignature);
        }
        for entry in self.blocked.iter_mut() {
            *entry = reader.get_u32()?;
        }
        self.guild_cards = reader.get_bytes(GUILD_CARD_FILE_SIZE)?.to_vec();
        self.key_config = reader.get_bytes(KEY_CONFIG_SIZE)?.to_vec();
        self.option_flags = reader.get_u32()?;
        self.shortcuts = reader.get_bytes(SHORTCUTS_SIZE)?.to_vec();
        self.symbol_chats = reader.get_bytes(SYMBOL_CHATS_SIZE)?.to_vec();
        self.team_name = reader.get_utf16(TEAM_NAME_WIDTH)?;
        Ok(())
    }

    pub fn save_account<P: AsRef<Path>>(&self, path: P) -> Result<(), PlayerFileError> {
        fs::write(path, self.account_file_bytes())?;
        Ok(())
    }

    pub fn load_account<P: AsRef<Path>>(&mut self, path: P) -> Result<(), PlayerFileError> {
        let data = fs::read(path)?;
        self.load_account_bytes(&data)
    }

    /// Loads a bank file, rewriting item ids into the bank token family so
    /// deposit/withdraw subcommands can name them unambiguously.
    pub fn load_bank_bytes(&mut self, data: &[u8]) -> Result<(), PlayerFileError> {
        let mut reader = Reader::new(data);
        self.bank = Self::read_bank_padded(&mut reader)?;
        for (index, item) in self.bank.items.iter_mut().enumerate() {
            item.data.item_id = 0x0F01_0000 + index as u32;
        }
        Ok(())
    }
}

const PREVIEW_SIZE: usize = 0x7C;

/// CRC-32 over the guild card file blob; the client checks this against the
/// header the server sends before the chunked download.
pub fn guild_card_checksum(data: &[u8]) -> u32 {
    let mut checksum: u32 = 0xFFFF_FFFF;
    for byte in data {
        checksum ^= u32::from(*byte);
        for _ in 0..8 {
            if checksum & 1 == 0 {
                checksum = (checksum >> 1) & 0x7FFF_FFFF;
            } else {
                checksum = ((checksum >> 1) & 0x7FFF_FFFF) ^ 0xEDB8_8320;
            }
        }
    }
    checksum ^ 0xFFFF_FFFF
}

pub fn player_filename(username: &str, player_index: u8) -> String {
    format!("system/players/player_{}_{}.psc", username, player_index + 1)
}

pub fn account_filename(username: &str) -> String {
    format!("system/players/account_{}.psa", username)
}

pub fn bank_filename(username: &str, bank_name: &str) -> String {
    format!("system/players/bank_{}_{}.psb", username, bank_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::BankItem;

    fn sample_player() -> Player {
        let mut player = Player::default();
        player.disp.name = "\tJEphinea".to_string();
        player.disp.level = 42;
        player.disp.meseta = 1234;
        player.disp.section_id = 6;
        player.disp.char_class = 2;
        player.guild_card_desc = "rare hunter".to_string();
        player.info_board = "afk".to_string();
        player.auto_reply = "brb".to_string();
        let mut item = BankItem::default();
        item.data.data1[0] = 0x03;
        item.data.data1[5] = 5;
        item.amount = 5;
        player.bank.items.push(item);
        player.bank.meseta = 777;
        player
    }

    #[test]
    fn pcgc_disp_layout_is_0xd0_bytes() {
        let mut writer = Writer::new();
        DispData::default().write_pcgc(&mut writer);
        assert_eq!(writer.len(), 0xD0);
    }

    #[test]
    fn bb_disp_roundtrip() {
        let mut disp = DispData::default();
        disp.name = "\tJAsh".to_string();
        disp.level = 199;
        disp.stats.atp = 1200;
        disp.section_id = 3;
        disp.char_class = 10;
        disp.technique_levels[4] = 14;

        let mut writer = Writer::new();
        disp.write_bb(&mut writer);
        let data = writer.into_vec();
        let decoded = DispData::read_bb(&mut Reader::new(&data)).unwrap();
        assert_eq!(decoded.name, "\tJAsh");
        assert_eq!(decoded.level, 199);
        assert_eq!(decoded.stats.atp, 1200);
        assert_eq!(decoded.section_id, 3);
        assert_eq!(decoded.char_class, 10);
        assert_eq!(decoded.technique_levels[4], 14);
    }

    #[test]
    fn narrow_export_strips_the_language_marker() {
        let mut disp = DispData::default();
        disp.name = "\tJKireek".to_string();
        let mut writer = Writer::new();
        disp.write_pcgc(&mut writer);
        let data = writer.into_vec();
        let decoded = DispData::read_pcgc(&mut Reader::new(&data)).unwrap();
        // Re-ingest normalizes the marker back on.
        assert_eq!(decoded.name, "\tJKireek");
        assert_eq!(&data[24..30], b"Kireek");
    }

    #[test]
    fn pc_class_substitution() {
        let mut disp = DispData::default();
        disp.char_class = 11;
        assert_eq!(disp.pc_char_class(), 0);
        disp.char_class = 10;
        assert_eq!(disp.pc_char_class(), 1);
        disp.char_class = 9;
        assert_eq!(disp.pc_char_class(), 5);
        disp.char_class = 4;
        assert_eq!(disp.pc_char_class(), 4);
    }

    #[test]
    fn player_file_roundtrip() {
        let player = sample_player();
        let data = player.player_file_bytes();

        let mut restored = Player::default();
        restored.load_player_bytes(&data).unwrap();
        assert_eq!(restored.disp.name, "\tJEphinea");
        assert_eq!(restored.disp.level, 42);
        assert_eq!(restored.guild_card_desc, "rare hunter");
        assert_eq!(restored.info_board, "afk");
        assert_eq!(restored.auto_reply, "brb");
        assert_eq!(restored.bank.meseta, 777);
        assert_eq!(restored.bank.items.len(), 1);
    }

    #[test]
    fn bad_signature_fails_the_load() {
        let mut data = sample_player().player_file_bytes();
        data[0] ^= 0xFF;
        let mut restored = Player::default();
        assert!(matches!(
            restored.load_player_bytes(&data),
            Err(PlayerFileError::BadSignature)
        ));
    }

    #[test]
    fn bank_load_rewrites_item_ids() {
        let player = sample_player();
        let mut writer = Writer::new();
        player.write_bank_padded(&mut writer);
        let data = writer.into_vec();

        let mut restored = Player::default();
        restored.load_bank_bytes(&data).unwrap();
        assert_eq!(restored.bank.items[0].data.item_id, 0x0F01_0000);
    }

    #[test]
    fn guild_card_checksum_matches_crc32() {
        // Standard CRC-32 of "123456789".
        assert_eq!(guild_card_checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(guild_card_checksum(&[]), 0);
    }

    #[test]
    fn bb_player_blob_has_stable_size() {
        let player = sample_player();
        let mut writer = Writer::new();
        player.write_bb_player(&mut writer, 42);
        let first = writer.len();

        let mut other = sample_player();
        other.bank.items.clear();
        let mut writer = Writer::new();
        other.write_bb_player(&mut writer, 42);
        assert_eq!(writer.len(), first);
    }
}
