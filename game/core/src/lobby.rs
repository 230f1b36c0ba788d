//! Lobby and game containers. Games and lobbies are the same structure;
//! games carry negative ids and the IS_GAME flag. All membership operations
//! take the lobby's write lock, and moving a client between two lobbies
//! locks both in address order.

use crate::client::Client;
use crate::items::InventoryItem;
use bitflags::bitflags;
use hashbrown::HashMap;
use keel::text;
use rigging::version::Version;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const LOBBY_MAX_CLIENTS: usize = 12;
pub const GAME_MAX_CLIENTS: usize = 4;
pub const VARIATION_COUNT: usize = 0x20;

/// First item id owned by client slot `i`; each slot gets a 0x200000-wide
/// range.
pub const CLIENT_ITEM_ID_BASE: u32 = 0x0001_0000;
pub const CLIENT_ITEM_ID_STRIDE: u32 = 0x0020_0000;
/// Floor items and server-spawned drops come from a separate game-wide pool.
pub const GAME_ITEM_ID_BASE: u32 = 0x0081_0000;

bitflags! {
    pub struct LobbyFlags: u32 {
        const IS_GAME                     = 0x01;
        const CHEATS_ENABLED              = 0x02; // game only
        const PUBLIC                      = 0x04; // lobby only
        const EPISODE_3                   = 0x08;
        const QUEST_IN_PROGRESS           = 0x10; // game only
        const JOINABLE_QUEST_IN_PROGRESS  = 0x20; // game only
        const DEFAULT                     = 0x40; // lobby only
        /// Kept alive when the last client leaves.
        const PERSISTENT                  = 0x80;
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LobbyError {
    NoSpaceLeft,
    ItemNotPresent { item_id: u32 },
    ClientNotFound,
}

impl fmt::Display for LobbyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LobbyError::NoSpaceLeft => write!(f, "no space left in lobby"),
            LobbyError::ItemNotPresent { item_id } => {
                write!(f, "item {:08X} is not on the floor", item_id)
            }
            LobbyError::ClientNotFound => write!(f, "client not found"),
        }
    }
}

impl std::error::Error for LobbyError {}

/// An enemy slot cloned from the map files at game creation; drop requests
/// reference enemies by index.
#[derive(Debug, Clone, Default)]
pub struct Enemy {
    pub experience: u32,
    pub rare_table_index: u32,
}

pub struct LobbyState {
    pub flags: LobbyFlags,
    pub max_clients: u8,
    pub clients: Vec<Option<Arc<Client>>>,
    pub leader_id: u8,

    pub name: String,
    pub password: String,
    pub section_id: u8,
    pub episode: u8,
    pub difficulty: u8,
    pub mode: u8,
    pub event: u8,
    pub block: u8,
    pub lobby_type: u8,
    pub min_level: u32,
    pub max_level: u32,

    pub rare_seed: u32,
    pub variations: [u32; VARIATION_COUNT],
    pub enemies: Vec<Enemy>,
    pub loading_quest_id: u32,

    next_item_id: [u32; LOBBY_MAX_CLIENTS],
    next_game_item_id: u32,
    pub next_drop_item: Option<InventoryItem>,
    pub floor_items: HashMap<u32, InventoryItem>,
}

pub struct Lobby {
    pub lobby_id: i64,
    pub version: Version,
    state: RwLock<LobbyState>,
}

impl Lobby {
    /// A persistent public lobby.
    pub fn new_lobby(lobby_id: i64, version: Version, block: u8) -> Lobby {
        let mut state = LobbyState::new(LOBBY_MAX_CLIENTS as u8);
        state.flags = LobbyFlags::PUBLIC | LobbyFlags::DEFAULT | LobbyFlags::PERSISTENT;
        state.block = block;
        state.lobby_type = block.wrapping_sub(1);
        Lobby { lobby_id, version, state: RwLock::new(state) }
    }

    /// A game, with per-slot item-id pools laid out so no two slots can ever
    /// collide.
    pub fn new_game(
        lobby_id: i64,
        version: Version,
        name: String,
        password: String,
    ) -> Lobby {
        let mut state = LobbyState::new(GAME_MAX_CLIENTS as u8);
        state.flags = LobbyFlags::IS_GAME;
        state.name = name;
        state.password = password;
        state.max_level = 0xFFFF_FFFF;
        Lobby { lobby_id, version, state: RwLock::new(state) }
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<LobbyState> {
        self.state.read().unwrap()
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<LobbyState> {
        self.state.write().unwrap()
    }

    pub fn is_game(&self) -> bool {
        self.read().flags.contains(LobbyFlags::IS_GAME)
    }

    pub fn flags(&self) -> LobbyFlags {
        self.read().flags
    }

    pub fn count_clients(&self) -> usize {
        self.read().count_clients()
    }

    pub fn any_client_loading(&self) -> bool {
        let state = self.read();
        let result = state.occupied_clients().any(|c| c.flags().contains(crate::client::ClientFlags::LOADING));
        result
    }

    /// Adds a client, scanning slots from the top down. Returns the slot
    /// index.
    pub fn add_client(&self, client: &Arc<Client>) -> Result<u8, LobbyError> {
        self.write().add_client(self.lobby_id, client)
    }

    /// Removes a client and reassigns the leader. Returns the vacated slot
    /// and the new leader id.
    pub fn remove_client(&self, client: &Arc<Client>) -> Result<(u8, u8), LobbyError> {
        self.write().remove_client(self.lobby_id, client)
    }

    /// Finds a client by display name (language markers ignored) or serial
    /// number.
    pub fn find_client(
        &self,
        name: Option<&str>,
        serial_number: u64,
    ) -> Result<Arc<Client>, LobbyError> {
        let state = self.read();
        for client in state.occupied_clients() {
            if serial_number != 0 && u64::from(client.serial_number()) == serial_number {
                return Ok(client.clone());
            }
            if let Some(name) = name {
                let player = client.player.read().unwrap();
                if text::remove_language_marker(&player.disp.name) == name {
                    return Ok(client.clone());
                }
            }
        }
        Err(LobbyError::ClientNotFound)
    }

    pub fn generate_item_id(&self, client_id: Option<u8>) -> u32 {
        self.write().generate_item_id(client_id)
    }

    pub fn add_floor_item(&self, item: InventoryItem) {
        self.write().floor_items.insert(item.data.item_id, item);
    }

    pub fn remove_floor_item(&self, item_id: u32) -> Result<InventoryItem, LobbyError> {
        self.write()
            .floor_items
            .remove(&item_id)
            .ok_or(LobbyError::ItemNotPresent { item_id })
    }

    /// The game event value shown for a lobby event; a few holiday events
    /// have no in-game equivalent.
    pub fn game_event_for_lobby_event(lobby_event: u8) -> u8 {
        match lobby_event {
            event if event > 7 => 0,
            7 => 2,
            2 => 0,
            event => event,
        }
    }
}

impl LobbyState {
    fn new(max_clients: u8) -> LobbyState {
        let mut next_item_id = [0u32; LOBBY_MAX_CLIENTS];
        for (slot, pool) in next_item_id.iter_mut().enumerate() {
            *pool = CLIENT_ITEM_ID_BASE + CLIENT_ITEM_ID_STRIDE * slot as u32;
        }
        LobbyState {
            flags: LobbyFlags::empty(),
            max_clients,
            clients: vec![None; max_clients as usize],
            leader_id: 0,
            name: String::new(),
            password: String::new(),
            section_id: 0,
            episode: 1,
            difficulty: 0,
            mode: 0,
            event: 0,
            block: 1,
            lobby_type: 0,
            min_level: 0,
            max_level: 0xFFFF_FFFF,
            rare_seed: 0,
            variations: [0; VARIATION_COUNT],
            enemies: Vec::new(),
            loading_quest_id: 0,
            next_item_id,
            next_game_item_id: GAME_ITEM_ID_BASE,
            next_drop_item: None,
            floor_items: HashMap::new(),
        }
    }

    pub fn count_clients(&self) -> usize {
        self.clients.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn occupied_clients(&self) -> impl Iterator<Item = &Arc<Client>> {
        self.clients.iter().filter_map(|slot| slot.as_ref())
    }

    fn add_client(&mut self, lobby_id: i64, client: &Arc<Client>) -> Result<u8, LobbyError> {
        let slot = self
            .clients
            .iter()
            .rposition(|slot| slot.is_none())
            .ok_or(LobbyError::NoSpaceLeft)?;

        self.clients[slot] = Some(client.clone());
        client.lobby_client_id.store(slot as u8, std::sync::atomic::Ordering::Release);
        client.lobby_id.store(lobby_id, std::sync::atomic::Ordering::Release);

        if self.count_clients() == 1 {
            self.leader_id = slot as u8;
        }
        Ok(slot as u8)
    }

    fn remove_client(&mut self, lobby_id: i64, client: &Arc<Client>) -> Result<(u8, u8), LobbyError> {
        let slot = client.lobby_client_id() as usize;
        match self.clients.get(slot) {
            Some(Some(occupant)) if Arc::ptr_eq(occupant, client) => {}
            _ => panic!("client's slot id {} does not match the client list", slot),
        }

        self.clients[slot] = None;

        // A concurrent move may already have reassigned the client to a new
        // lobby; only clear the backref if it still points here.
        if client.lobby_id() == lobby_id {
            client.lobby_id.store(0, std::sync::atomic::Ordering::Release);
        }

        self.reassign_leader_on_departure(slot);
        Ok((slot as u8, self.leader_id))
    }

    fn reassign_leader_on_departure(&mut self, leaving_slot: usize) {
        for (slot, occupant) in self.clients.iter().enumerate() {
            if slot == leaving_slot {
                continue;
            }
            if occupant.is_some() {
                self.leader_id = slot as u8;
                return;
            }
        }
        self.leader_id = 0;
    }

    /// Allocates an item id: from the owning client's pool, or from the
    /// game-wide pool when no client owns the item.
    pub fn generate_item_id(&mut self, client_id: Option<u8>) -> u32 {
        match client_id {
            Some(slot) if (slot as usize) < self.max_clients as usize => {
                let id = self.next_item_id[slot as usize];
                self.next_item_id[slot as usize] += 1;
                id
            }
            _ => {
                let id = self.next_game_item_id;
                self.next_game_item_id += 1;
                id
            }
        }
    }

    /// Stamps fresh ids over every item in an inventory as its owner joins.
    pub fn assign_item_ids_for_player(
        &mut self,
        client_id: u8,
        inventory: &mut crate::items::Inventory,
    ) {
        for item in inventory.items.iter_mut() {
            item.data.item_id = self.generate_item_id(Some(client_id));
        }
    }
}

/// Moves a client between two lobbies as one atomic step. The write locks
/// are taken in address order so two concurrent moves can never deadlock.
pub fn move_client(
    source: &Arc<Lobby>,
    dest: &Arc<Lobby>,
    client: &Arc<Client>,
) -> Result<(), LobbyError> {
    if Arc::ptr_eq(source, dest) {
        return Ok(());
    }

    let source_addr = Arc::as_ptr(source) as usize;
    let dest_addr = Arc::as_ptr(dest) as usize;
    let (mut source_state, mut dest_state) = if source_addr < dest_addr {
        let source_state = source.write();
        let dest_state = dest.write();
        (source_state, dest_state)
    } else {
        let dest_state = dest.write();
        let source_state = source.write();
        (source_state, dest_state)
    };

    if dest_state.count_clients() >= dest_state.max_clients as usize {
        return Err(LobbyError::NoSpaceLeft);
    }

    source_state.remove_client(source.lobby_id, client)?;
    dest_state.add_client(dest.lobby_id, client)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Behavior;
    use rigging::channel::Conduit;

    fn test_client() -> Arc<Client> {
        let conduit = Arc::new(Conduit::detached(Version::Gc));
        Arc::new(Client::new(
            Version::Gc,
            Behavior::LobbyServer,
            0,
            conduit,
            "127.0.0.1:9103".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        ))
    }

    fn assert_membership_invariants(lobby: &Lobby) {
        let state = lobby.read();
        let mut lowest_occupied = None;
        for (slot, occupant) in state.clients.iter().enumerate() {
            if let Some(client) = occupant {
                assert_eq!(client.lobby_client_id() as usize, slot);
                assert_eq!(client.lobby_id(), lobby.lobby_id);
                if lowest_occupied.is_none() {
                    lowest_occupied = Some(slot as u8);
                }
            }
        }
        match lowest_occupied {
            Some(lowest) => assert_eq!(state.leader_id, lowest),
            None => assert_eq!(state.leader_id, 0),
        }
    }

    #[test]
    fn add_fills_from_the_top_and_elects_a_leader() {
        let lobby = Lobby::new_lobby(1, Version::Gc, 1);
        let first = test_client();
        let slot = lobby.add_client(&first).unwrap();
        assert_eq!(slot, 11);
        assert_eq!(lobby.read().leader_id, 11);

        let second = test_client();
        assert_eq!(lobby.add_client(&second).unwrap(), 10);
        // Leader does not change when others join.
        assert_eq!(lobby.read().leader_id, 11);
        assert_membership_invariants(&lobby);
    }

    #[test]
    fn full_lobby_rejects_additions() {
        let lobby = Lobby::new_game(-1, Version::Gc, "game".into(), String::new());
        for _ in 0..GAME_MAX_CLIENTS {
            lobby.add_client(&test_client()).unwrap();
        }
        assert_eq!(lobby.add_client(&test_client()), Err(LobbyError::NoSpaceLeft));
    }

    #[test]
    fn leader_reassignment_picks_lowest_remaining_slot() {
        let lobby = Lobby::new_lobby(5, Version::Gc, 1);
        // Occupy specific slots directly to mirror a mid-session lobby.
        let clients: Vec<_> = (0..3).map(|_| test_client()).collect();
        {
            let mut state = lobby.write();
            for (client, &slot) in clients.iter().zip(&[0usize, 3, 7]) {
                state.clients[slot] = Some(client.clone());
                client.lobby_client_id.store(slot as u8, std::sync::atomic::Ordering::Release);
                client.lobby_id.store(5, std::sync::atomic::Ordering::Release);
            }
            state.leader_id = 3;
        }

        let (left_slot, new_leader) = lobby.remove_client(&clients[1]).unwrap();
        assert_eq!(left_slot, 3);
        assert_eq!(new_leader, 0);
        assert_membership_invariants(&lobby);

        // Remove the new leader too; slot 7 remains.
        let (_, new_leader) = lobby.remove_client(&clients[0]).unwrap();
        assert_eq!(new_leader, 7);

        let (_, new_leader) = lobby.remove_client(&clients[2]).unwrap();
        assert_eq!(new_leader, 0);
        assert_eq!(lobby.count_clients(), 0);
    }

    #[test]
    fn move_between_lobbies_is_atomic() {
        let source = Arc::new(Lobby::new_lobby(1, Version::Gc, 1));
        let dest = Arc::new(Lobby::new_lobby(2, Version::Gc, 2));
        let client = test_client();
        source.add_client(&client).unwrap();

        move_client(&source, &dest, &client).unwrap();
        assert_eq!(source.count_clients(), 0);
        assert_eq!(dest.count_clients(), 1);
        assert_eq!(client.lobby_id(), 2);
        assert_membership_invariants(&source);
        assert_membership_invariants(&dest);
    }

    #[test]
    fn move_to_a_full_lobby_fails_and_leaves_the_client_in_place() {
        let source = Arc::new(Lobby::new_lobby(1, Version::Gc, 1));
        let dest = Arc::new(Lobby::new_game(-3, Version::Gc, "full".into(), String::new()));
        for _ in 0..GAME_MAX_CLIENTS {
            dest.add_client(&test_client()).unwrap();
        }

        let client = test_client();
        let slot = source.add_client(&client).unwrap();

        assert_eq!(move_client(&source, &dest, &client), Err(LobbyError::NoSpaceLeft));
        assert_eq!(client.lobby_id(), 1);
        assert_eq!(client.lobby_client_id(), slot);
        assert_eq!(source.count_clients(), 1);
        assert_membership_invariants(&source);
    }

    #[test]
    fn item_ids_never_collide_across_pools() {
        let lobby = Lobby::new_game(-4, Version::Bb, "drops".into(), String::new());
        let mut seen = std::collections::HashSet::new();
        for slot in 0..GAME_MAX_CLIENTS as u8 {
            for _ in 0..1000 {
                assert!(seen.insert(lobby.generate_item_id(Some(slot))));
            }
        }
        for _ in 0..1000 {
            assert!(seen.insert(lobby.generate_item_id(None)));
        }
    }

    #[test]
    fn client_pools_have_the_documented_layout() {
        let lobby = Lobby::new_game(-5, Version::Bb, "ids".into(), String::new());
        assert_eq!(lobby.generate_item_id(Some(0)), 0x0001_0000);
        assert_eq!(lobby.generate_item_id(Some(0)), 0x0001_0001);
        assert_eq!(lobby.generate_item_id(Some(2)), 0x0041_0000);
        assert_eq!(lobby.generate_item_id(None), GAME_ITEM_ID_BASE);
    }

    #[test]
    fn floor_items_are_tracked_by_id() {
        let lobby = Lobby::new_game(-6, Version::Bb, "floor".into(), String::new());
        let mut item = InventoryItem::default();
        item.data.item_id = lobby.generate_item_id(None);
        let id = item.data.item_id;
        lobby.add_floor_item(item);

        let picked = lobby.remove_floor_item(id).unwrap();
        assert_eq!(picked.data.item_id, id);
        assert_eq!(
            lobby.remove_floor_item(id),
            Err(LobbyError::ItemNotPresent { item_id: id })
        );
    }

    #[test]
    fn game_event_mapping() {
        assert_eq!(Lobby::game_event_for_lobby_event(0), 0);
        assert_eq!(Lobby::game_event_for_lobby_event(1), 1);
        assert_eq!(Lobby::game_event_for_lobby_event(2), 0);
        assert_eq!(Lobby::game_event_for_lobby_event(7), 2);
        assert_eq!(Lobby::game_event_for_lobby_event(9), 0);
    }
}
