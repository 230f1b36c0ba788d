//! Process-wide server state: the lobby registry, the license store, the
//! static data indices and the address book. Static indices are swapped
//! atomically on reload; readers holding an old `Arc` keep using it.

use crate::addresses;
use crate::client::{Behavior, Client};
use crate::data::{BattleParamTable, CommonItemCreator, Ep3CardIndex, Ep3MapIndex, LevelTable, RareItemTable};
use crate::license::LicenseStore;
use crate::lobby::{Lobby, LobbyError, LobbyFlags};
use crate::menu::{self, MenuItem};
use crate::quest::QuestIndex;
use hashbrown::HashMap;
use keel::crypto::BbKeyFile;
use keel::logging;
use keel::text;
use rigging::version::Version;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

pub const DEFAULT_LOBBY_COUNT: i64 = 15;
pub const EPISODE_3_LOBBY_COUNT: i64 = 5;

/// One listening port: a name for the config file, the bound port, the
/// dialect spoken there and what the connection does first.
#[derive(Debug, Clone)]
pub struct PortSpec {
    pub name: &'static str,
    pub port: u16,
    pub version: Version,
    pub behavior: Behavior,
}

/// The ports the various client builds have hardcoded, plus our own lobby
/// ports that clients only reach via reconnect commands.
pub fn default_port_configuration() -> Vec<PortSpec> {
    vec![
        PortSpec { name: "gc-jp10", port: 9000, version: Version::Gc, behavior: Behavior::LoginServer },
        PortSpec { name: "gc-jp11", port: 9001, version: Version::Gc, behavior: Behavior::LoginServer },
        PortSpec { name: "gc-jp3", port: 9003, version: Version::Gc, behavior: Behavior::LoginServer },
        PortSpec { name: "gc-us10", port: 9100, version: Version::Pc, behavior: Behavior::SplitReconnect },
        PortSpec { name: "gc-us3", port: 9103, version: Version::Gc, behavior: Behavior::LoginServer },
        PortSpec { name: "gc-eu10", port: 9200, version: Version::Gc, behavior: Behavior::LoginServer },
        PortSpec { name: "gc-eu11", port: 9201, version: Version::Gc, behavior: Behavior::LoginServer },
        PortSpec { name: "gc-eu3", port: 9203, version: Version::Gc, behavior: Behavior::LoginServer },
        PortSpec { name: "pc-login", port: 9300, version: Version::Pc, behavior: Behavior::LoginServer },
        PortSpec { name: "pc-patch", port: 10000, version: Version::Patch, behavior: Behavior::PatchServer },
        PortSpec { name: "bb-patch", port: 11000, version: Version::Patch, behavior: Behavior::PatchServer },
        PortSpec { name: "bb-data", port: 12000, version: Version::Bb, behavior: Behavior::DataServerBB },
        PortSpec { name: "bb-data1", port: 12004, version: Version::Bb, behavior: Behavior::DataServerBB },
        PortSpec { name: "bb-data2", port: 12005, version: Version::Bb, behavior: Behavior::DataServerBB },
        PortSpec { name: "bb-login", port: 12008, version: Version::Bb, behavior: Behavior::LoginServer },
        PortSpec { name: "pc-lobby", port: 9420, version: Version::Pc, behavior: Behavior::LobbyServer },
        PortSpec { name: "gc-lobby", port: 9421, version: Version::Gc, behavior: Behavior::LobbyServer },
        PortSpec { name: "bb-lobby", port: 9422, version: Version::Bb, behavior: Behavior::LobbyServer },
    ]
}

struct LobbyTable {
    by_id: BTreeMap<i64, Arc<Lobby>>,
    by_name: HashMap<String, Arc<Lobby>>,
}

pub struct ServerState {
    pub name: String,
    pub log: logging::Logger,

    lobbies: RwLock<LobbyTable>,
    next_private_lobby_id: AtomicI64,
    next_game_id: AtomicI64,

    pub license_store: Arc<LicenseStore>,

    pub level_table: RwLock<Arc<LevelTable>>,
    pub battle_params: RwLock<Arc<BattleParamTable>>,
    pub rare_items: RwLock<Arc<RareItemTable>>,
    pub common_items: RwLock<Arc<CommonItemCreator>>,
    pub quest_index: RwLock<Arc<QuestIndex>>,
    pub ep3_cards: RwLock<Arc<Ep3CardIndex>>,
    pub ep3_maps: RwLock<Arc<Ep3MapIndex>>,

    pub bb_keys: Vec<Arc<BbKeyFile>>,
    /// The fixed data files Blue Burst clients may stream-download, in the
    /// order the index advertises them.
    pub bb_stream_files: Vec<(String, Vec<u8>)>,

    pub main_menu: Vec<MenuItem>,
    pub information_menu: Vec<MenuItem>,
    pub information_contents: Vec<String>,

    pub port_configuration: Vec<PortSpec>,
    pub local_address: u32,
    pub external_address: u32,
    pub num_threads: usize,
}

impl ServerState {
    pub fn new(name: String, license_store: Arc<LicenseStore>, log: &logging::Logger) -> ServerState {
        ServerState {
            name,
            log: log.new(logging::o!("source" => "server-state")),
            lobbies: RwLock::new(LobbyTable { by_id: BTreeMap::new(), by_name: HashMap::new() }),
            next_private_lobby_id: AtomicI64::new(DEFAULT_LOBBY_COUNT + EPISODE_3_LOBBY_COUNT + 1),
            next_game_id: AtomicI64::new(-1),
            license_store,
            level_table: RwLock::new(Arc::new(LevelTable::empty())),
            battle_params: RwLock::new(Arc::new(BattleParamTable::empty())),
            rare_items: RwLock::new(Arc::new(RareItemTable::empty())),
            common_items: RwLock::new(Arc::new(CommonItemCreator::default())),
            quest_index: RwLock::new(Arc::new(QuestIndex::empty())),
            ep3_cards: RwLock::new(Arc::new(Ep3CardIndex::empty())),
            ep3_maps: RwLock::new(Arc::new(Ep3MapIndex::empty())),
            bb_keys: Vec::new(),
            bb_stream_files: Vec::new(),
            main_menu: menu::main_menu(),
            information_menu: Vec::new(),
            information_contents: Vec::new(),
            port_configuration: default_port_configuration(),
            local_address: 0,
            external_address: 0,
            num_threads: 1,
        }
    }

    /// Creates the persistent public lobbies: fifteen plain ones and five
    /// more that only Episode 3 clients can see.
    pub fn create_default_lobbies(&self) {
        for id in 1..=DEFAULT_LOBBY_COUNT {
            let lobby = Lobby::new_lobby(id, Version::Gc, id as u8);
            self.add_lobby(Arc::new(lobby));
        }
        for offset in 1..=EPISODE_3_LOBBY_COUNT {
            let id = DEFAULT_LOBBY_COUNT + offset;
            let lobby = Lobby::new_lobby(id, Version::Gc, id as u8);
            lobby.write().flags |= LobbyFlags::EPISODE_3;
            self.add_lobby(Arc::new(lobby));
        }
    }

    pub fn allocate_game_id(&self) -> i64 {
        self.next_game_id.fetch_sub(1, Ordering::AcqRel)
    }

    pub fn allocate_lobby_id(&self) -> i64 {
        self.next_private_lobby_id.fetch_add(1, Ordering::AcqRel)
    }

    pub fn add_lobby(&self, lobby: Arc<Lobby>) {
        let mut table = self.lobbies.write().unwrap();
        let name = lobby.read().name.clone();
        if !name.is_empty() {
            table.by_name.insert(name, lobby.clone());
        }
        table.by_id.insert(lobby.lobby_id, lobby);
    }

    pub fn remove_lobby(&self, lobby_id: i64) {
        let mut table = self.lobbies.write().unwrap();
        if let Some(lobby) = table.by_id.remove(&lobby_id) {
            let name = lobby.read().name.clone();
            if !name.is_empty() {
                table.by_name.remove(&name);
            }
        }
    }

    pub fn find_lobby(&self, lobby_id: i64) -> Option<Arc<Lobby>> {
        self.lobbies.read().unwrap().by_id.get(&lobby_id).cloned()
    }

    pub fn find_lobby_by_name(&self, name: &str) -> Option<Arc<Lobby>> {
        self.lobbies.read().unwrap().by_name.get(name).cloned()
    }

    /// Snapshot of every lobby, so callers iterate without holding the
    /// registry lock.
    pub fn all_lobbies(&self) -> Vec<Arc<Lobby>> {
        self.lobbies.read().unwrap().by_id.values().cloned().collect()
    }

    /// The lobby a client currently sits in, if any.
    pub fn client_lobby(&self, client: &Client) -> Option<Arc<Lobby>> {
        let lobby_id = client.lobby_id();
        if lobby_id == 0 {
            return None;
        }
        self.find_lobby(lobby_id)
    }

    /// First public lobby with room for this client, preferring the block
    /// the client came from.
    pub fn find_available_lobby(&self, client: &Client) -> Option<Arc<Lobby>> {
        let wants_ep3 = client.flags().contains(crate::client::ClientFlags::EPISODE_3);
        self.all_lobbies().into_iter().find(|lobby| {
            let state = lobby.read();
            state.flags.contains(LobbyFlags::DEFAULT)
                && !state.flags.contains(LobbyFlags::IS_GAME)
                && (wants_ep3 || !state.flags.contains(LobbyFlags::EPISODE_3))
                && state.count_clients() < state.max_clients as usize
        })
    }

    /// Finds a connected client by display name (language markers ignored
    /// on both sides) or serial number, across all lobbies.
    pub fn find_client(
        &self,
        name: Option<&str>,
        serial_number: u64,
    ) -> Result<Arc<Client>, LobbyError> {
        let bare_name = name.map(|n| text::remove_language_marker(n).to_string());
        for lobby in self.all_lobbies() {
            if let Ok(client) = lobby.find_client(bare_name.as_deref(), serial_number) {
                return Ok(client);
            }
        }
        Err(LobbyError::ClientNotFound)
    }

    /// The address this client should reconnect to: peers on a private
    /// network get the local address, the internet gets the external one.
    pub fn connect_address_for_client(&self, client: &Client) -> u32 {
        match addresses::ipv4_of_sockaddr(&client.peer_addr) {
            Some(peer) if addresses::is_local_address(peer) => self.local_address,
            Some(_) => self.external_address,
            None => self.local_address,
        }
    }

    /// The Blue Burst stream files concatenated in index order, which is
    /// how chunked downloads address them.
    pub fn bb_stream_contents(&self) -> Vec<u8> {
        let total = self.bb_stream_files.iter().map(|(_, data)| data.len()).sum();
        let mut contents = Vec::with_capacity(total);
        for (_, data) in &self.bb_stream_files {
            contents.extend_from_slice(data);
        }
        contents
    }

    /// The port a version's lobby server listens on.
    pub fn lobby_port_for_version(&self, version: Version) -> Option<u16> {
        self.port_configuration
            .iter()
            .find(|spec| spec.version == version && spec.behavior == Behavior::LobbyServer)
            .map(|spec| spec.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigging::channel::Conduit;

    fn test_state() -> ServerState {
        let state = ServerState::new(
            "Pioneer".to_string(),
            Arc::new(LicenseStore::ephemeral()),
            &logging::discard(),
        );
        state.create_default_lobbies();
        state
    }

    fn test_client(version: Version) -> Arc<Client> {
        Arc::new(Client::new(
            version,
            Behavior::LobbyServer,
            0,
            Arc::new(Conduit::detached(version)),
            "192.168.1.5:9421".parse().unwrap(),
            "203.0.113.9:51000".parse().unwrap(),
        ))
    }

    #[test]
    fn default_lobbies_are_created_and_found() {
        let state = test_state();
        assert_eq!(state.all_lobbies().len(), 20);
        assert!(state.find_lobby(1).is_some());
        assert!(state.find_lobby(20).is_some());
        assert!(state.find_lobby(42).is_none());
    }

    #[test]
    fn game_ids_count_down() {
        let state = test_state();
        assert_eq!(state.allocate_game_id(), -1);
        assert_eq!(state.allocate_game_id(), -2);
    }

    #[test]
    fn games_are_registered_by_name() {
        let state = test_state();
        let id = state.allocate_game_id();
        let game = Arc::new(Lobby::new_game(id, Version::Gc, "Forest Run".into(), String::new()));
        state.add_lobby(game);

        assert!(state.find_lobby_by_name("Forest Run").is_some());
        state.remove_lobby(id);
        assert!(state.find_lobby_by_name("Forest Run").is_none());
    }

    #[test]
    fn find_client_ignores_language_markers() {
        let state = test_state();
        let client = test_client(Version::Gc);
        client.player.write().unwrap().disp.name = "\tJSue".to_string();
        state.find_lobby(1).unwrap().add_client(&client).unwrap();

        assert!(state.find_client(Some("Sue"), 0).is_ok());
        assert!(state.find_client(Some("\tESue"), 0).is_ok());
        assert!(state.find_client(Some("sue"), 0).is_err());
    }

    #[test]
    fn connect_address_depends_on_peer_network() {
        let mut state = test_state();
        state.local_address = addresses::parse_ipv4("192.168.1.5").unwrap();
        state.external_address = addresses::parse_ipv4("198.51.100.7").unwrap();

        let remote = test_client(Version::Gc);
        assert_eq!(state.connect_address_for_client(&remote), state.external_address);

        let local = Arc::new(Client::new(
            Version::Gc,
            Behavior::LoginServer,
            1,
            Arc::new(Conduit::detached(Version::Gc)),
            "192.168.1.5:9103".parse().unwrap(),
            "192.168.1.20:49000".parse().unwrap(),
        ));
        assert_eq!(state.connect_address_for_client(&local), state.local_address);
    }

    #[test]
    fn ep3_lobbies_are_hidden_from_plain_clients() {
        let state = test_state();
        // Fill the fifteen plain lobbies.
        for id in 1..=DEFAULT_LOBBY_COUNT {
            let lobby = state.find_lobby(id).unwrap();
            for _ in 0..lobby.read().max_clients {
                lobby.add_client(&test_client(Version::Gc)).unwrap();
            }
        }
        let plain = test_client(Version::Gc);
        assert!(state.find_available_lobby(&plain).is_none());

        let ep3 = test_client(Version::Gc);
        ep3.add_flags(crate::client::ClientFlags::EPISODE_3);
        let found = state.find_available_lobby(&ep3).unwrap();
        assert!(found.lobby_id > DEFAULT_LOBBY_COUNT);
    }
}
