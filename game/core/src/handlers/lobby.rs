//! Lobby movement, menus, chat entry and game creation.

use super::{HandlerError, HandlerResult};
use crate::chat;
use crate::client::{Behavior, Client, ClientFlags};
use crate::lobby::{self, Lobby, LobbyError, LobbyFlags, GAME_MAX_CLIENTS};
use crate::menu::{self, MenuItem, MenuItemFlags};
use crate::quest::QuestCategory;
use crate::sends;
use crate::state::ServerState;
use crate::wire::Reader;
use keel::logging;
use keel::text;
use rand::Rng;
use rigging::endpoint::CommandCtx;
use rigging::version::Version;
use std::sync::Arc;

////////////////////////////////////////////////////////////////////////////////
// membership plumbing shared by handlers and the disconnect path

/// Adds a client to a lobby and fans out the join notifications: the joiner
/// gets the full 67/64 state, everyone else gets a 68/65.
pub fn add_client_to_lobby(_s: &Arc<ServerState>, l: &Arc<Lobby>, c: &Arc<Client>) -> HandlerResult {
    l.add_client(c)?;

    if l.is_game() {
        c.add_flags(ClientFlags::LOADING);
        let mut player = c.player.write().unwrap();
        let mut state = l.write();
        let slot = c.lobby_client_id();
        state.assign_item_ids_for_player(slot, &mut player.inventory);
    }

    sends::send_join_lobby(c, l);
    let members: Vec<Arc<Client>> = l.read().occupied_clients().cloned().collect();
    for member in members {
        if Arc::ptr_eq(&member, c) {
            continue;
        }
        sends::send_player_join_notification(&member, l, c);
    }

    if !l.is_game() {
        sends::send_arrow_update(l);
    }
    Ok(())
}

/// Removes a client from its current lobby (if any), notifies the others,
/// and reaps empty non-persistent games.
pub fn leave_current_lobby(s: &Arc<ServerState>, c: &Arc<Client>) {
    let lobby = match s.client_lobby(c) {
        Some(lobby) => lobby,
        None => return,
    };

    let leaving_id = c.lobby_client_id();
    if lobby.remove_client(c).is_err() {
        return;
    }
    sends::send_player_leave_notification(&lobby, leaving_id);

    if lobby.count_clients() == 0 && !lobby.flags().contains(LobbyFlags::PERSISTENT) {
        logging::info!(s.log, "deleting empty game"; "lobby_id" => lobby.lobby_id);
        s.remove_lobby(lobby.lobby_id);
    }
}

/// Drops the client into the first public lobby with room.
pub fn add_to_available_lobby(s: &Arc<ServerState>, c: &Arc<Client>) -> HandlerResult {
    let lobby = s
        .find_available_lobby(c)
        .ok_or(HandlerError::Lobby(LobbyError::NoSpaceLeft))?;
    add_client_to_lobby(s, &lobby, c)
}

////////////////////////////////////////////////////////////////////////////////
// simple per-command handlers

/// 05: the client is about to close the connection.
pub fn on_client_exit(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    c.request_disconnect();
    Ok(())
}

/// 1D: keepalive reply; nothing to do.
pub fn on_ping_reply(
    _s: &Arc<ServerState>,
    _c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    Ok(())
}

/// B1: the client asked for the server clock.
pub fn on_time_request(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    sends::send_server_time(c);
    Ok(())
}

/// 06: chat. A leading `$` (after the language marker) makes it a chat
/// command instead of a relayed line.
pub fn on_chat(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let _unused = reader.get_u32()?;
    let _guild_card_number = reader.get_u32()?;
    let raw_text = reader.get_text_to_end(c.version.uses_utf16());
    let stripped = text::remove_language_marker(&raw_text).to_string();

    if stripped.starts_with('$') {
        chat::process_chat_command(s, c, &stripped);
        return Ok(());
    }

    if !c.can_chat.load(std::sync::atomic::Ordering::Acquire) {
        return Ok(());
    }

    let lobby = match s.client_lobby(c) {
        Some(lobby) => lobby,
        None => return Ok(()),
    };
    let (from_serial, from_name) = {
        let player = c.player.read().unwrap();
        (c.serial_number(), player.disp.name.clone())
    };
    let state = lobby.read();
    for member in state.occupied_clients() {
        sends::send_chat_message(member, from_serial, &from_name, &stripped);
    }
    Ok(())
}

/// 61: the client's player data. Also completes the lobby-server login and
/// any pending cross-version character conversion.
pub fn on_player_data(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    {
        let mut player = c.player.write().unwrap();
        let mut reader = Reader::new(payload);
        match c.version {
            Version::Pc => player.import_pc(&mut reader)?,
            Version::Dc | Version::Gc => player.import_gc(&mut reader)?,
            Version::Bb => player.import_bb(&mut reader)?,
            Version::Patch => return Err(HandlerError::Protocol("player data on patch port")),
        }
    }

    // A $bbchar conversion grabs this data and writes it out as a
    // Blue Burst character file.
    let pending = c.pending_bb_conversion.lock().unwrap().take();
    if let Some((username, player_index)) = pending {
        let path = crate::player::player_filename(&username, player_index);
        let player = c.player.read().unwrap();
        match player.save_player(&path) {
            Ok(()) => sends::send_text_message(c, "$C6Character converted."),
            Err(err) => {
                logging::warn!(s.log, "character conversion failed";
                               "path" => path, "error" => %err);
                sends::send_text_message(c, "$C6Conversion failed.");
            }
        }
        return Ok(());
    }

    if c.lobby_id() == 0 && c.behavior == Behavior::LobbyServer {
        add_to_available_lobby(s, c)?;
    }
    Ok(())
}

/// 6F: done loading into a game.
pub fn on_done_loading(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    c.clear_flags(ClientFlags::LOADING);
    if let Some(lobby) = s.client_lobby(c) {
        if lobby.is_game() {
            sends::send_resume_game(&lobby, c);
        }
    }
    Ok(())
}

/// 89: lobby arrow color change; the flag carries the color.
pub fn on_arrow_color(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    c.lobby_arrow_color.store(flag, std::sync::atomic::Ordering::Release);
    if let Some(lobby) = s.client_lobby(c) {
        if !lobby.is_game() {
            sends::send_arrow_update(&lobby);
        }
    }
    Ok(())
}

/// 8A: the client wants the name of what it joined.
pub fn on_lobby_name_request(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    let name = match s.client_lobby(c) {
        Some(lobby) => lobby.read().name.clone(),
        None => s.name.clone(),
    };
    sends::send_lobby_name(c, &name);
    Ok(())
}

/// D6: a message box was dismissed; matters only for menu flows that wait
/// on it.
pub fn on_message_box_closed(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    if c.flags().contains(ClientFlags::IN_INFORMATION_MENU) {
        sends::send_menu(c, "Information", menu::MENU_ID_INFORMATION, &s.information_menu, true);
    }
    Ok(())
}

/// C6: the updated blocked-senders list.
pub fn on_blocked_list_update(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let mut player = c.player.write().unwrap();
    for entry in player.blocked.iter_mut() {
        *entry = reader.get_u32()?;
    }
    Ok(())
}

/// C7: enable the auto reply with new text.
pub fn on_auto_reply_enable(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let reply = reader.get_text_to_end(c.version.uses_utf16());
    c.player.write().unwrap().auto_reply = reply;
    Ok(())
}

/// C8: disable the auto reply.
pub fn on_auto_reply_disable(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    c.player.write().unwrap().auto_reply.clear();
    Ok(())
}

/// D8: info board request.
pub fn on_info_board_request(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    if let Some(lobby) = s.client_lobby(c) {
        sends::send_info_board(c, &lobby);
    }
    Ok(())
}

/// D9: info board write.
pub fn on_info_board_write(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let board = reader.get_text_to_end(c.version.uses_utf16());
    c.player.write().unwrap().info_board = board;
    Ok(())
}

/// 40: guild card search by serial number.
pub fn on_guild_card_search(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let _player_tag = reader.get_u32()?;
    let _searcher = reader.get_u32()?;
    let target_serial = reader.get_u32()?;

    if let Ok(target) = s.find_client(None, u64::from(target_serial)) {
        if let Some(target_lobby) = s.client_lobby(&target) {
            sends::send_card_search_result(s, c, &target, &target_lobby);
        }
    }
    Ok(())
}

/// 81: simple mail, forwarded to the addressee if connected.
pub fn on_simple_mail(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let _player_tag = reader.get_u32()?;
    let _from = reader.get_u32()?;
    let from_name = reader.get_text(0x10, c.version.uses_utf16())?;
    let to_serial = reader.get_u32()?;
    let body = reader.get_text_to_end(c.version.uses_utf16());

    if let Ok(target) = s.find_client(None, u64::from(to_serial)) {
        let blocked = {
            let target_player = target.player.read().unwrap();
            target_player.blocked.contains(&c.serial_number())
        };
        if !blocked {
            sends::send_simple_mail(&target, c.serial_number(), &from_name, &body);
        }
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// menus

/// 09: hover info for a menu entry.
pub fn on_menu_item_info_request(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let menu_id = reader.get_u32()?;
    let item_id = reader.get_u32()?;

    match menu_id {
        menu::MENU_ID_MAIN => {
            if let Some(item) = s.main_menu.iter().find(|i| i.item_id == item_id) {
                sends::send_ship_info(c, &item.description);
            }
        }
        menu::MENU_ID_INFORMATION => {
            if let Some(item) = s.information_menu.iter().find(|i| i.item_id == item_id) {
                sends::send_ship_info(c, &item.description);
            }
        }
        menu::MENU_ID_GAME => {
            if let Some(game) = s.find_lobby(i64::from(item_id as i32)) {
                let state = game.read();
                let info = format!(
                    "{}\n{} players\nEpisode {}",
                    state.name,
                    state.count_clients(),
                    state.episode
                );
                drop(state);
                sends::send_ship_info(c, &info);
            }
        }
        menu::MENU_ID_QUEST => {
            let quest_index = s.quest_index.read().unwrap().clone();
            if let Some(quest) = quest_index.get(c.version, item_id) {
                sends::send_quest_info(c, &quest.long_description, false);
            }
        }
        _ => {}
    }
    Ok(())
}

/// 10: a menu selection. The low flag bits say whether a password (and an
/// extra field) trail the ids.
pub fn on_menu_selection(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    ctx: &mut CommandCtx,
    flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let menu_id = reader.get_u32()?;
    let item_id = reader.get_u32()?;
    if flag & 0x02 != 0 && reader.remaining() >= 4 {
        reader.skip(4)?;
    }
    let password = if flag & 0x01 != 0 {
        reader.get_text_to_end(c.version.uses_utf16())
    } else {
        String::new()
    };

    match menu_id {
        menu::MENU_ID_MAIN => on_main_menu_selection(s, c, ctx, item_id),
        menu::MENU_ID_INFORMATION => {
            if item_id == menu::INFORMATION_MENU_GO_BACK {
                c.clear_flags(ClientFlags::IN_INFORMATION_MENU);
                sends::send_menu(c, &s.name, menu::MENU_ID_MAIN, &s.main_menu, false);
            } else if let Some(contents) = s.information_contents.get(item_id as usize) {
                c.add_flags(ClientFlags::IN_INFORMATION_MENU);
                sends::send_message_box(c, contents);
            }
            Ok(())
        }
        menu::MENU_ID_LOBBY => {
            let lobby = s
                .find_lobby(i64::from(item_id as i32))
                .ok_or(HandlerError::Lobby(LobbyError::ClientNotFound))?;
            move_to_lobby(s, c, &lobby)
        }
        menu::MENU_ID_GAME => on_game_selection(s, c, item_id, &password),
        menu::MENU_ID_QUEST_CATEGORY => on_quest_category_selection(s, c, item_id),
        menu::MENU_ID_QUEST => on_quest_selection(s, c, item_id),
        _ => Ok(()),
    }
}

fn on_main_menu_selection(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    item_id: u32,
) -> HandlerResult {
    match item_id {
        menu::MAIN_MENU_GO_TO_LOBBY => {
            let port = s
                .lobby_port_for_version(c.version)
                .ok_or(HandlerError::Protocol("no lobby port for this version"))?;
            let address = s.connect_address_for_client(c);
            sends::send_reconnect(c, address, port);
            Ok(())
        }
        menu::MAIN_MENU_INFORMATION => {
            c.add_flags(ClientFlags::IN_INFORMATION_MENU);
            sends::send_menu(c, "Information", menu::MENU_ID_INFORMATION, &s.information_menu, true);
            Ok(())
        }
        menu::MAIN_MENU_DISCONNECT => {
            c.request_disconnect();
            Ok(())
        }
        _ => Ok(()),
    }
}

fn move_to_lobby(s: &Arc<ServerState>, c: &Arc<Client>, dest: &Arc<Lobby>) -> HandlerResult {
    let source = s.client_lobby(c);
    match source {
        Some(source) => {
            let leaving_id = c.lobby_client_id();
            match lobby::move_client(&source, dest, c) {
                Ok(()) => {
                    sends::send_player_leave_notification(&source, leaving_id);
                }
                Err(LobbyError::NoSpaceLeft) => {
                    sends::send_text_message(c, "$C6The lobby is full.");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
        None => {
            dest.add_client(c)?;
        }
    }

    sends::send_join_lobby(c, dest);
    let members: Vec<Arc<Client>> = dest.read().occupied_clients().cloned().collect();
    for member in members {
        if !Arc::ptr_eq(&member, c) {
            sends::send_player_join_notification(&member, dest, c);
        }
    }
    sends::send_arrow_update(dest);
    Ok(())
}

fn on_game_selection(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    item_id: u32,
    password: &str,
) -> HandlerResult {
    let game = match s.find_lobby(i64::from(item_id as i32)) {
        Some(game) => game,
        None => {
            sends::send_text_message(c, "$C6The game no longer\nexists.");
            return Ok(());
        }
    };

    {
        let state = game.read();
        if !state.flags.contains(LobbyFlags::IS_GAME) {
            return Err(HandlerError::Protocol("game menu selected a non-game"));
        }
        if state.count_clients() >= GAME_MAX_CLIENTS {
            sends::send_text_message(c, "$C6This game is full.");
            return Ok(());
        }
        if !state.password.is_empty() && state.password != password {
            sends::send_text_message(c, "$C6Incorrect password.");
            return Ok(());
        }
        let level = c.player.read().unwrap().disp.level;
        if level < state.min_level {
            sends::send_text_message(c, "$C6Your level is too\nlow to join this\ngame.");
            return Ok(());
        }
        if level > state.max_level {
            sends::send_text_message(c, "$C6Your level is too\nhigh to join this\ngame.");
            return Ok(());
        }
        if state.flags.contains(LobbyFlags::QUEST_IN_PROGRESS)
            && !state.flags.contains(LobbyFlags::JOINABLE_QUEST_IN_PROGRESS)
        {
            sends::send_text_message(c, "$C6A quest is in\nprogress in this\ngame.");
            return Ok(());
        }
    }

    leave_current_lobby(s, c);
    add_client_to_lobby(s, &game, c)
}

/// C1 (and its variants): create a game and move the creator into it.
pub fn on_create_game(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let utf16 = c.version.uses_utf16();
    let mut reader = Reader::new(payload);
    reader.skip(0x08)?;
    let name = reader.get_text(0x10, utf16)?;
    let password = reader.get_text(0x10, utf16)?;
    let difficulty = reader.get_u8()?;
    let battle = reader.get_u8()?;
    let challenge = reader.get_u8()?;
    let episode_byte = reader.get_u8()?;

    let game_id = s.allocate_game_id();
    let game = Lobby::new_game(game_id, c.version, name.clone(), password);
    {
        let mut state = game.write();
        state.difficulty = difficulty;
        state.mode = if battle != 0 {
            1
        } else if challenge != 0 {
            2
        } else if episode_byte == 0xFF {
            3
        } else {
            0
        };
        state.episode = if episode_byte == 0 || episode_byte == 0xFF { 1 } else { episode_byte };
        state.section_id = c.player.read().unwrap().disp.section_id;
        state.block = 1;

        let mut rng = rand::thread_rng();
        state.rare_seed = rng.gen();
        for variation in state.variations.iter_mut() {
            *variation = rng.gen_range(0..3);
        }
        if c.flags().contains(ClientFlags::EPISODE_3) {
            state.flags |= LobbyFlags::EPISODE_3;
        }
        state.event = Lobby::game_event_for_lobby_event(
            s.client_lobby(c).map(|l| l.read().event).unwrap_or(0),
        );
    }

    logging::info!(s.log, "game created";
                   "lobby_id" => game_id,
                   "name" => %name,
                   "version" => c.version.name());

    let game = Arc::new(game);
    s.add_lobby(game.clone());
    leave_current_lobby(s, c);
    add_client_to_lobby(s, &game, c)
}

/// 84: the lobby selector at the bottom of the screen.
pub fn on_lobby_change(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let _menu_id = reader.get_u32()?;
    let item_id = reader.get_u32()?;
    let dest = s
        .find_lobby(i64::from(item_id as i32))
        .ok_or(HandlerError::Lobby(LobbyError::ClientNotFound))?;
    if dest.is_game() {
        return Err(HandlerError::Protocol("lobby change into a game"));
    }
    move_to_lobby(s, c, &dest)
}

/// 98: leaving a game; the client expects to land back in a lobby.
pub fn on_leave_game(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    leave_current_lobby(s, c);
    add_to_available_lobby(s, c)
}

/// A0: back to the ship select.
pub fn on_change_ship(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    sends::send_menu(c, &s.name, menu::MENU_ID_MAIN, &s.main_menu, false);
    Ok(())
}

/// A1: block select; this build runs one block, so it behaves like A0.
pub fn on_change_block(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    ctx: &mut CommandCtx,
    flag: u32,
    payload: &[u8],
) -> HandlerResult {
    on_change_ship(s, c, ctx, flag, payload)
}

/// 08: the game list request.
pub fn on_game_list_request(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    sends::send_game_menu(c, s);
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// quests

fn quest_category_items(s: &ServerState, c: &Client, in_game_mode: u8) -> Vec<MenuItem> {
    let quest_index = s.quest_index.read().unwrap().clone();
    quest_index
        .categories_with_quests(c.version)
        .into_iter()
        .filter(|category| match in_game_mode {
            1 => *category == QuestCategory::Battle,
            2 => *category == QuestCategory::Challenge,
            _ => !category.is_mode(),
        })
        .enumerate()
        .map(|(index, category)| {
            MenuItem::new(index as u32, category.name(), "", MenuItemFlags::empty())
        })
        .collect()
}

/// A2: the quest menu. In a game this lists categories for the game's mode.
pub fn on_quest_menu_request(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    let mode = s
        .client_lobby(c)
        .filter(|l| l.is_game())
        .map(|l| l.read().mode)
        .unwrap_or(0);
    let items = quest_category_items(s, c, mode);
    if items.is_empty() {
        sends::send_text_message(c, "$C6No quests are\navailable.");
        return Ok(());
    }
    sends::send_quest_category_menu(c, menu::MENU_ID_QUEST_CATEGORY, &items, false);
    Ok(())
}

fn on_quest_category_selection(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    item_id: u32,
) -> HandlerResult {
    let mode = s
        .client_lobby(c)
        .filter(|l| l.is_game())
        .map(|l| l.read().mode)
        .unwrap_or(0);
    let quest_index = s.quest_index.read().unwrap().clone();
    let categories: Vec<QuestCategory> = quest_index
        .categories_with_quests(c.version)
        .into_iter()
        .filter(|category| match mode {
            1 => *category == QuestCategory::Battle,
            2 => *category == QuestCategory::Challenge,
            _ => !category.is_mode(),
        })
        .collect();
    let category = categories
        .get(item_id as usize)
        .ok_or(HandlerError::Protocol("quest category out of range"))?;

    let quests = quest_index.filter(c.version, c.flags().contains(ClientFlags::IS_DC_V1), *category);
    sends::send_quest_menu(c, menu::MENU_ID_QUEST, &quests, false);
    Ok(())
}

fn on_quest_selection(s: &Arc<ServerState>, c: &Arc<Client>, item_id: u32) -> HandlerResult {
    let lobby = s
        .client_lobby(c)
        .filter(|l| l.is_game())
        .ok_or(HandlerError::Protocol("quest selected outside a game"))?;

    let quest_index = s.quest_index.read().unwrap().clone();
    let quest = quest_index
        .get(c.version, item_id)
        .ok_or(HandlerError::Protocol("unknown quest selected"))?;

    let bin = quest
        .bin_contents()
        .map_err(|_| HandlerError::Protocol("quest script unreadable"))?;
    let dat = quest
        .dat_contents()
        .map_err(|_| HandlerError::Protocol("quest data unreadable"))?;

    {
        let mut state = lobby.write();
        state.flags |= LobbyFlags::QUEST_IN_PROGRESS;
        if quest.joinable {
            state.flags |= LobbyFlags::JOINABLE_QUEST_IN_PROGRESS;
        }
        state.loading_quest_id = quest.quest_id;
    }

    let bin_name = format!("quest{}.bin", quest.quest_id);
    let dat_name = format!("quest{}.dat", quest.quest_id);
    let state = lobby.read();
    for member in state.occupied_clients() {
        member.add_flags(ClientFlags::LOADING);
        sends::send_quest_file(member, &quest.name, &bin_name, &bin, sends::QuestFileType::Online);
        sends::send_quest_file(member, &quest.name, &dat_name, &dat, sends::QuestFileType::Online);
    }
    Ok(())
}

/// AC: the quest-load barrier; once every member is done loading, release
/// them together.
pub fn on_quest_barrier(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    c.clear_flags(ClientFlags::LOADING);
    if let Some(lobby) = s.client_lobby(c) {
        if lobby.is_game() && !lobby.any_client_loading() {
            sends::send_to_lobby(&lobby, 0xAC, 0x00, &[], None);
        }
    }
    Ok(())
}
