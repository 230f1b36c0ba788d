//! The in-game command fabric: 60/6C broadcast to the whole game, 62/6D
//! target one slot, C9/CB are their Episode 3 equivalents. Bodies are
//! sequences of subcommands, each with a one-byte id and size; most are
//! relayed opaquely, but a short whitelist is interpreted server-side.

use super::{HandlerError, HandlerResult};
use crate::client::Client;
use crate::items::{BankItem, InventoryItem, MESETA_ITEM_ID};
use crate::lobby::Lobby;
use crate::sends;
use crate::state::ServerState;
use crate::wire::Reader;
use rand::Rng;
use rigging::endpoint::CommandCtx;
use rigging::version::Version;
use std::sync::Arc;

/// 60/62 bodies above this size would overflow the receiving client's
/// subcommand buffer; the wide 6C/6D forms exist for bigger payloads.
const SMALL_RELAY_LIMIT: usize = 0x400;

/// 60 (and CB): broadcast to everyone else in the lobby or game.
pub fn on_broadcast_command(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    if payload.len() > SMALL_RELAY_LIMIT {
        return Err(HandlerError::Protocol("oversized 60 body"));
    }
    relay_broadcast(s, c, payload)
}

/// 6C: broadcast without the small-body limit.
pub fn on_wide_broadcast_command(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    relay_broadcast(s, c, payload)
}

/// 62 (and C9): send to the slot named in the flag.
pub fn on_target_command(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    flag: u32,
    payload: &[u8],
) -> HandlerResult {
    if payload.len() > SMALL_RELAY_LIMIT {
        return Err(HandlerError::Protocol("oversized 62 body"));
    }
    relay_target(s, c, flag, payload, 0x62)
}

/// 6D: targeted without the small-body limit.
pub fn on_wide_target_command(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    flag: u32,
    payload: &[u8],
) -> HandlerResult {
    relay_target(s, c, flag, payload, 0x6D)
}

fn relay_broadcast(s: &Arc<ServerState>, c: &Arc<Client>, payload: &[u8]) -> HandlerResult {
    let lobby = match s.client_lobby(c) {
        Some(lobby) => lobby,
        None => return Ok(()),
    };

    if intercept_broadcast(s, c, &lobby, payload)? {
        return Ok(());
    }

    sends::send_to_lobby(&lobby, 0x60, 0x00, payload, Some(c));
    Ok(())
}

fn relay_target(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    flag: u32,
    payload: &[u8],
    command: u16,
) -> HandlerResult {
    let lobby = match s.client_lobby(c) {
        Some(lobby) => lobby,
        None => return Ok(()),
    };

    let target = {
        let state = lobby.read();
        state
            .clients
            .get(flag as usize & 0x0F)
            .and_then(|slot| slot.as_ref())
            .cloned()
    };
    // A recipient that left mid-flight is just skipped.
    let target = match target {
        Some(target) => target,
        None => return Ok(()),
    };

    if intercept_target(c, &target, payload)? {
        return Ok(());
    }

    sends::send_command(&target, command, flag, payload);
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// interception

/// Handles broadcast subcommands the server must own. Returns true when the
/// command was consumed.
fn intercept_broadcast(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    lobby: &Arc<Lobby>,
    payload: &[u8],
) -> Result<bool, HandlerError> {
    if payload.is_empty() {
        return Ok(false);
    }

    match payload[0] {
        // Enemy and box drop requests: on Blue Burst the server is the drop
        // authority; elsewhere the leader's client decides and we relay.
        0x60 if c.version == Version::Bb => {
            on_enemy_drop_request(s, lobby, payload)?;
            Ok(true)
        }
        0xA2 if c.version == Version::Bb => {
            on_box_drop_request(s, lobby, payload)?;
            Ok(true)
        }
        // Floor pickups (Blue Burst): move the item into the inventory and
        // tell the whole game.
        0x5A if c.version == Version::Bb => {
            on_pick_up_item(c, lobby, payload)?;
            Ok(true)
        }
        // Bank interactions are entirely server-side on Blue Burst.
        0xBB if c.version == Version::Bb => {
            sends::send_bank(c);
            Ok(true)
        }
        0xBD if c.version == Version::Bb => {
            on_bank_action(c, lobby, payload)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Targeted subcommands the server rewrites rather than relaying raw.
fn intercept_target(
    c: &Arc<Client>,
    target: &Arc<Client>,
    payload: &[u8],
) -> Result<bool, HandlerError> {
    if payload.is_empty() {
        return Ok(false);
    }

    match payload[0] {
        // Guild card exchange: rebuild the card server-side so the serial
        // number is always the licensed one.
        0x06 => {
            sends::send_guild_card(target, c);
            Ok(true)
        }
        _ => Ok(false),
    }
}

struct DropRequest {
    area: u8,
    enemy_index: u16,
    request_id: u16,
    x: f32,
    z: f32,
}

fn parse_drop_request(payload: &[u8]) -> Result<DropRequest, HandlerError> {
    let mut reader = Reader::new(payload);
    let _subcommand = reader.get_u8()?;
    let _size = reader.get_u8()?;
    let enemy_index = reader.get_u16()?;
    let area = reader.get_u8()?;
    let _enemy_type = reader.get_u8()?;
    let request_id = reader.get_u16()?;
    let x = reader.get_f32()?;
    let z = reader.get_f32()?;
    Ok(DropRequest { area, enemy_index, request_id, x, z })
}

/// Decides what an enemy drops: the admin override first, then the rare
/// table, then the common item generator.
fn on_enemy_drop_request(
    s: &Arc<ServerState>,
    lobby: &Arc<Lobby>,
    payload: &[u8],
) -> HandlerResult {
    let request = parse_drop_request(payload)?;
    generate_drop(s, lobby, &request, false)
}

fn on_box_drop_request(s: &Arc<ServerState>, lobby: &Arc<Lobby>, payload: &[u8]) -> HandlerResult {
    let request = parse_drop_request(payload)?;
    generate_drop(s, lobby, &request, true)
}

fn generate_drop(
    s: &Arc<ServerState>,
    lobby: &Arc<Lobby>,
    request: &DropRequest,
    is_box: bool,
) -> HandlerResult {
    let mut rng = rand::thread_rng();

    let (episode, difficulty, section_id, override_item, rare_index) = {
        let state = lobby.read();
        let rare_index = state
            .enemies
            .get(request.enemy_index as usize)
            .map(|enemy| enemy.rare_table_index)
            .unwrap_or(0);
        (
            state.episode,
            state.difficulty,
            state.section_id,
            state.next_drop_item,
            rare_index,
        )
    };

    let mut dropped: Option<InventoryItem> = None;

    if let Some(chosen) = override_item {
        dropped = Some(chosen);
        lobby.write().next_drop_item = None;
    }

    if dropped.is_none() && !is_box {
        let rare_table = s.rare_items.read().unwrap().clone();
        if let Some(set) = rare_table.get(episode.saturating_sub(1), difficulty, section_id) {
            if let Some(rare) = set.enemy_rares.get(rare_index as usize) {
                if crate::data::rares::sample_rare_drop(rare.probability, rng.gen()) {
                    let mut item = InventoryItem::default();
                    item.data.data1[0] = rare.item_code[0];
                    item.data.data1[1] = rare.item_code[1];
                    item.data.data1[2] = rare.item_code[2];
                    dropped = Some(item);
                }
            }
        }
    }

    if dropped.is_none() {
        let common = s.common_items.read().unwrap().clone();
        dropped = common
            .create_drop_item(is_box, difficulty, request.area, &mut rng)
            .map(|data| {
                let mut item = InventoryItem::default();
                item.data = data;
                item
            });
    }

    let mut item = match dropped {
        Some(item) => item,
        None => return Ok(()),
    };

    item.data.item_id = lobby.generate_item_id(None);
    lobby.add_floor_item(item);
    sends::send_drop_item(
        lobby,
        &item.data,
        !is_box,
        request.area,
        request.x,
        request.z,
        request.request_id,
    );
    Ok(())
}

/// 6x5A: a player grabs a floor item.
fn on_pick_up_item(c: &Arc<Client>, lobby: &Arc<Lobby>, payload: &[u8]) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let _subcommand = reader.get_u8()?;
    let _size = reader.get_u8()?;
    reader.skip(2)?;
    let item_id = reader.get_u32()?;
    let area = reader.get_u8()?;

    let item = match lobby.remove_floor_item(item_id) {
        Ok(item) => item,
        // Two players grabbing at once; the loser's request just evaporates.
        Err(_) => return Ok(()),
    };

    {
        let mut player = c.player.write().unwrap();
        if player.add_item(item).is_err() {
            // No room after all; put it back where it was.
            lobby.add_floor_item(item);
            return Ok(());
        }
    }
    sends::send_pick_up_item(lobby, c, item_id, area);
    Ok(())
}

/// 6xBD: deposit into or withdraw from the bank.
fn on_bank_action(c: &Arc<Client>, lobby: &Arc<Lobby>, payload: &[u8]) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let _subcommand = reader.get_u8()?;
    let _size = reader.get_u8()?;
    reader.skip(2)?;
    let item_id = reader.get_u32()?;
    let meseta_amount = reader.get_u32()?;
    let item_amount = reader.get_u8()?;
    let action = reader.get_u8()?;

    match action {
        // Deposit.
        0x00 => {
            let mut player = c.player.write().unwrap();
            if item_id == MESETA_ITEM_ID || item_id == 0 {
                if meseta_amount > player.disp.meseta {
                    return Ok(());
                }
                player.disp.meseta -= meseta_amount;
                player.bank.meseta =
                    (player.bank.meseta + meseta_amount).min(crate::items::MESETA_LIMIT);
            } else {
                let taken = match player.remove_item(item_id, u32::from(item_amount)) {
                    Ok(taken) => taken,
                    Err(_) => return Ok(()),
                };
                let mut banked: BankItem = taken.to_bank_item();
                banked.data.item_id = 0x0F01_0000 + player.bank.items.len() as u32;
                if player.bank.add_item(banked).is_err() {
                    // Bank full: the item goes back where it came from.
                    let _ = player.add_item(taken);
                    drop(player);
                    sends::send_text_message(c, "$C6Your bank is full.");
                    return Ok(());
                }
                drop(player);
                sends::send_destroy_item(lobby, c, item_id, u32::from(item_amount));
            }
        }
        // Withdraw.
        0x01 => {
            let mut player = c.player.write().unwrap();
            if item_id == MESETA_ITEM_ID || item_id == 0 {
                if meseta_amount > player.bank.meseta {
                    return Ok(());
                }
                player.bank.meseta -= meseta_amount;
                player.disp.meseta =
                    (player.disp.meseta + meseta_amount).min(crate::items::MESETA_LIMIT);
            } else {
                let taken = match player.bank.remove_item(item_id, u32::from(item_amount)) {
                    Ok(taken) => taken,
                    Err(_) => return Ok(()),
                };
                let mut inventory_item = taken.to_inventory_item();
                inventory_item.data.item_id = lobby.generate_item_id(Some(c.lobby_client_id()));
                let data = inventory_item.data;
                if player.add_item(inventory_item).is_err() {
                    let _ = player.bank.add_item(taken);
                    drop(player);
                    sends::send_text_message(c, "$C6Your inventory\nis full.");
                    return Ok(());
                }
                drop(player);
                sends::send_create_inventory_item(lobby, c, &data);
            }
        }
        _ => {
            return Err(HandlerError::Protocol("unknown bank action"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Behavior;
    use rigging::channel::Conduit;
    use rigging::frame::Header;

    fn bb_client() -> Arc<Client> {
        Arc::new(Client::new(
            Version::Bb,
            Behavior::LobbyServer,
            0,
            Arc::new(Conduit::detached(Version::Bb)),
            "127.0.0.1:9422".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        ))
    }

    #[test]
    fn pick_up_moves_floor_item_into_inventory() {
        let lobby = Arc::new(Lobby::new_game(-1, Version::Bb, "g".into(), String::new()));
        let c = bb_client();
        lobby.add_client(&c).unwrap();

        let mut item = InventoryItem::default();
        item.data.data1 = [0x00, 0x01, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        item.data.item_id = lobby.generate_item_id(None);
        let item_id = item.data.item_id;
        lobby.add_floor_item(item);

        let mut payload = Vec::new();
        payload.extend_from_slice(&[0x5A, 0x03, 0x00, 0x00]);
        payload.extend_from_slice(&item_id.to_le_bytes());
        payload.push(0x02); // area
        payload.extend_from_slice(&[0, 0, 0]);

        on_pick_up_item(&c, &lobby, &payload).unwrap();

        assert!(lobby.remove_floor_item(item_id).is_err());
        let player = c.player.read().unwrap();
        assert_eq!(player.inventory.items.len(), 1);
        assert_eq!(player.inventory.items[0].data.item_id, item_id);

        // The 6x59 pickup notification went out to the game.
        let data = c.conduit.take_pending();
        let header = Header::parse(Version::Bb, &data);
        assert_eq!(header.command, 0x60);
        assert_eq!(data[8], 0x59);
    }

    #[test]
    fn admin_override_wins_the_next_drop() {
        let log = keel::logging::discard();
        let s = Arc::new(ServerState::new(
            "test".into(),
            Arc::new(crate::license::LicenseStore::ephemeral()),
            &log,
        ));
        let lobby = Arc::new(Lobby::new_game(-2, Version::Bb, "g".into(), String::new()));
        let c = bb_client();
        lobby.add_client(&c).unwrap();

        let mut wanted = InventoryItem::default();
        wanted.data.data1 = [0x00, 0x03, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0];
        lobby.write().next_drop_item = Some(wanted);

        let request =
            DropRequest { area: 1, enemy_index: 0, request_id: 7, x: 0.0, z: 0.0 };
        generate_drop(&s, &lobby, &request, false).unwrap();

        // The override is consumed and the dropped item hit the floor map.
        assert!(lobby.read().next_drop_item.is_none());
        let state = lobby.read();
        assert_eq!(state.floor_items.len(), 1);
        let dropped = state.floor_items.values().next().unwrap();
        assert_eq!(&dropped.data.data1[..4], &[0x00, 0x03, 0x00, 0x00]);
    }
}
