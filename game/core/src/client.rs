//! One connected player. Most of a client's state is only touched from its
//! home worker thread, so the hot fields are plain atomics; the player data
//! and the security blob sit behind locks because lobby broadcasts and chat
//! commands reach across threads.

use crate::license::License;
use crate::player::Player;
use crate::wire::{Reader, WireError, Writer};
use bitflags::bitflags;
use rigging::channel::Conduit;
use rigging::version::Version;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

bitflags! {
    pub struct ClientFlags: u32 {
        /// After joining a lobby the client stops confirming message-box
        /// closes with D6 commands.
        const NO_MESSAGE_BOX_CLOSE_CONFIRMATION_AFTER_LOBBY_JOIN = 0x0004;
        const NO_MESSAGE_BOX_CLOSE_CONFIRMATION                  = 0x0008;
        const CAN_SEE_EXTRA_LOBBIES                              = 0x0010;
        const EPISODE_3                                          = 0x0020;
        const IS_DC_V1                                           = 0x0040;
        /// Currently loading into a game.
        const LOADING                                            = 0x0080;
        /// Browsing the information menu on the login server.
        const IN_INFORMATION_MENU                                = 0x0100;
        const AT_WELCOME_MESSAGE                                 = 0x0200;
    }
}

impl ClientFlags {
    /// The flags a fresh connection starts with, by version and the
    /// sub-version byte the client reports at login.
    pub fn defaults_for(version: Version, sub_version: u8) -> ClientFlags {
        match version {
            Version::Dc => ClientFlags::empty(),
            Version::Pc | Version::Patch => ClientFlags::empty(),
            Version::Gc => match sub_version {
                0x00..=0x34 => ClientFlags::empty(),
                0x35..=0x3F => ClientFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION_AFTER_LOBBY_JOIN,
                _ => {
                    ClientFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION_AFTER_LOBBY_JOIN
                        | ClientFlags::CAN_SEE_EXTRA_LOBBIES
                        | ClientFlags::EPISODE_3
                }
            },
            Version::Bb => {
                ClientFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION_AFTER_LOBBY_JOIN
                    | ClientFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION
            }
        }
    }
}

/// What a listening port does with fresh connections.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Behavior {
    LoginServer,
    LobbyServer,
    DataServerBB,
    PatchServer,
    /// Sends the PC/GC double-header redirect and nothing else.
    SplitReconnect,
}

impl Behavior {
    pub fn to_tag(self) -> u32 {
        match self {
            Behavior::LoginServer => 0,
            Behavior::LobbyServer => 1,
            Behavior::DataServerBB => 2,
            Behavior::PatchServer => 3,
            Behavior::SplitReconnect => 4,
        }
    }

    pub fn from_tag(tag: u32) -> Behavior {
        match tag {
            1 => Behavior::LobbyServer,
            2 => Behavior::DataServerBB,
            3 => Behavior::PatchServer,
            4 => Behavior::SplitReconnect,
            _ => Behavior::LoginServer,
        }
    }
}

/// The opaque "security data" blob the server hands to the client in the 04
/// (or E6) command and the client echoes back on later logins. Only the
/// magic is trusted; everything else is re-validated.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SecurityData {
    pub magic: u32,
    pub flags: u32,
    pub proxy_destination_address: u32,
    pub proxy_destination_port: u16,
    pub bb_player_index: u8,
}

pub const SECURITY_MAGIC: u32 = 0x8D3A_11F2;
const SECURITY_SIZE: usize = 24;
const SECURITY_SIZE_BB: usize = 32;

impl Default for SecurityData {
    fn default() -> SecurityData {
        SecurityData {
            magic: SECURITY_MAGIC,
            flags: 0,
            proxy_destination_address: 0,
            proxy_destination_port: 0,
            bb_player_index: 0,
        }
    }
}

impl SecurityData {
    pub fn size_for(version: Version) -> usize {
        if version == Version::Bb {
            SECURITY_SIZE_BB
        } else {
            SECURITY_SIZE
        }
    }

    pub fn write(&self, writer: &mut Writer, version: Version) {
        writer.put_u32(self.magic);
        writer.put_u32(self.flags);
        writer.put_u32(self.proxy_destination_address);
        writer.put_u16(self.proxy_destination_port);
        writer.put_u8(self.bb_player_index);
        writer.put_zeroes(Self::size_for(version) - 15);
    }

    /// Parses an echoed blob. Any byte soup is tolerated; a wrong magic just
    /// yields `None` and the server treats the client as fresh.
    pub fn parse(data: &[u8]) -> Option<SecurityData> {
        let mut reader = Reader::new(data);
        let parse = |reader: &mut Reader| -> Result<SecurityData, WireError> {
            Ok(SecurityData {
                magic: reader.get_u32()?,
                flags: reader.get_u32()?,
                proxy_destination_address: reader.get_u32()?,
                proxy_destination_port: reader.get_u16()?,
                bb_player_index: reader.get_u8()?,
            })
        };
        match parse(&mut reader) {
            Ok(sec) if sec.magic == SECURITY_MAGIC => Some(sec),
            _ => None,
        }
    }
}

pub struct Client {
    pub version: Version,
    pub behavior: Behavior,
    pub token: usize,
    pub conduit: Arc<Conduit>,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,

    pub license: RwLock<Option<Arc<License>>>,
    pub player: RwLock<Player>,
    pub security: Mutex<SecurityData>,

    pub flags: AtomicU32,
    pub lobby_id: AtomicI64,
    pub lobby_client_id: AtomicU8,
    pub can_chat: AtomicBool,
    pub infinite_hp: AtomicBool,
    pub infinite_tp: AtomicBool,
    pub area: AtomicU32,
    pub lobby_arrow_color: AtomicU32,
    pub bb_player_index: AtomicU8,

    /// Username and player index for a pending cross-version character
    /// conversion ($bbchar), consumed by the next 61 command.
    pub pending_bb_conversion: Mutex<Option<(String, u8)>>,
}

impl Client {
    pub fn new(
        version: Version,
        behavior: Behavior,
        token: usize,
        conduit: Arc<Conduit>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Client {
        Client {
            version,
            behavior,
            token,
            conduit,
            local_addr,
            peer_addr,
            license: RwLock::new(None),
            player: RwLock::new(Player::default()),
            security: Mutex::new(SecurityData::default()),
            flags: AtomicU32::new(0),
            lobby_id: AtomicI64::new(0),
            lobby_client_id: AtomicU8::new(0),
            can_chat: AtomicBool::new(true),
            infinite_hp: AtomicBool::new(false),
            infinite_tp: AtomicBool::new(false),
            area: AtomicU32::new(0),
            lobby_arrow_color: AtomicU32::new(0),
            bb_player_index: AtomicU8::new(0),
            pending_bb_conversion: Mutex::new(None),
        }
    }

    pub fn flags(&self) -> ClientFlags {
        ClientFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: ClientFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn add_flags(&self, flags: ClientFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: ClientFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn license(&self) -> Option<Arc<License>> {
        self.license.read().unwrap().clone()
    }

    pub fn set_license(&self, license: Arc<License>) {
        *self.license.write().unwrap() = Some(license);
    }

    pub fn serial_number(&self) -> u32 {
        self.license().map(|l| l.serial_number).unwrap_or(0)
    }

    pub fn lobby_id(&self) -> i64 {
        self.lobby_id.load(Ordering::Acquire)
    }

    pub fn lobby_client_id(&self) -> u8 {
        self.lobby_client_id.load(Ordering::Acquire)
    }

    pub fn should_disconnect(&self) -> bool {
        self.conduit.disconnect_requested()
    }

    pub fn request_disconnect(&self) {
        self.conduit.request_disconnect();
    }

    /// The security blob with the client's current flags folded in.
    pub fn export_security(&self) -> SecurityData {
        let mut security = *self.security.lock().unwrap();
        security.flags = self.flags.load(Ordering::Acquire);
        security.bb_player_index = self.bb_player_index.load(Ordering::Acquire);
        security
    }

    /// Applies an echoed security blob, keeping only what the magic vouches
    /// for.
    pub fn import_security(&self, data: &[u8]) {
        if let Some(parsed) = SecurityData::parse(data) {
            self.flags.store(parsed.flags, Ordering::Release);
            self.bb_player_index.store(parsed.bb_player_index, Ordering::Release);
            *self.security.lock().unwrap() = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_blob_roundtrip_and_magic_check() {
        let mut security = SecurityData::default();
        security.flags = 0x0088;
        security.proxy_destination_address = 0x0A00_0001;
        security.proxy_destination_port = 9100;
        security.bb_player_index = 2;

        let mut writer = Writer::new();
        security.write(&mut writer, Version::Gc);
        let data = writer.into_vec();
        assert_eq!(data.len(), SecurityData::size_for(Version::Gc));

        let parsed = SecurityData::parse(&data).unwrap();
        assert_eq!(parsed, security);

        let mut corrupted = data.clone();
        corrupted[0] ^= 1;
        assert!(SecurityData::parse(&corrupted).is_none());

        // Arbitrary byte soup must parse to nothing rather than panic.
        assert!(SecurityData::parse(&[0xFF; 3]).is_none());
    }

    #[test]
    fn bb_security_blob_is_wider() {
        let mut writer = Writer::new();
        SecurityData::default().write(&mut writer, Version::Bb);
        assert_eq!(writer.len(), 32);
    }

    #[test]
    fn gc_plus_sub_versions_unlock_extra_lobbies() {
        let flags = ClientFlags::defaults_for(Version::Gc, 0x40);
        assert!(flags.contains(ClientFlags::EPISODE_3));
        assert!(flags.contains(ClientFlags::CAN_SEE_EXTRA_LOBBIES));

        let flags = ClientFlags::defaults_for(Version::Gc, 0x30);
        assert!(flags.is_empty());
    }
}
