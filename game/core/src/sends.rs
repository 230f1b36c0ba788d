//! Builders for every command the server originates. Each function frames
//! and enqueues a command on a client's conduit; a failed enqueue (overrun
//! or cipher trouble) marks the client for disconnect rather than bubbling
//! an error through every call site.

use crate::client::{Client, ClientFlags};
use crate::items::ItemData;
use crate::lobby::{Lobby, LobbyFlags, VARIATION_COUNT};
use crate::menu::{MenuItem, MenuItemFlags};
use crate::player::NAME_WIDTH;
use crate::quest::Quest;
use crate::state::ServerState;
use crate::wire::Writer;
use keel::crypto::{bb_detector_pair, Cipher, GcCipher, PcCipher, BB_SEED_SIZE};
use keel::text;
use rigging::support::ErrorUtils;
use rigging::version::Version;
use std::sync::Arc;

// The clients check these strings byte-for-byte, so they are protocol
// constants rather than editorial content.
const ANTI_COPYRIGHT: &str = "This server is in no way affiliated, sponsored, or supported by SEGA Enterprises or SONICTEAM. The preceding message exists only in order to remain compatible with programs that expect it.";
const DC_PORT_MAP_COPYRIGHT: &str = "DreamCast Port Map. Copyright SEGA Enterprises. 1999";
const DC_LOBBY_SERVER_COPYRIGHT: &str = "DreamCast Lobby Server. Copyright SEGA Enterprises. 1999";
const BB_GAME_SERVER_COPYRIGHT: &str =
    "Phantasy Star Online Blue Burst Game Server. Copyright 1999-2004 SONICTEAM.";
const PATCH_SERVER_COPYRIGHT: &str = "Patch Server. Copyright SonicTeam, LTD. 2001";

pub const PLAYER_TAG: u32 = 0x0001_0000;

/// Frames one command onto a client's conduit.
pub fn send_command(c: &Client, command: u16, flag: u32, payload: &[u8]) {
    if c.conduit.send(command, flag, payload).has_failed() {
        c.request_disconnect();
    }
}

/// Sends to every member of a lobby, optionally excluding one client. Each
/// recipient's buffer is appended independently; a slow peer never delays
/// the others.
pub fn send_to_lobby(l: &Lobby, command: u16, flag: u32, payload: &[u8], except: Option<&Client>) {
    let state = l.read();
    for client in state.occupied_clients() {
        if let Some(except) = except {
            if std::ptr::eq(client.as_ref(), except) {
                continue;
            }
        }
        send_command(client, command, flag, payload);
    }
}

pub fn send_to_server(s: &ServerState, command: u16, flag: u32, payload: &[u8]) {
    for lobby in s.all_lobbies() {
        send_to_lobby(&lobby, command, flag, payload, None);
    }
}

////////////////////////////////////////////////////////////////////////////////
// handshake

/// Sends the init command that carries the cipher seeds, then installs both
/// ciphers. The init itself always travels in plaintext.
pub fn send_server_init(
    s: &ServerState,
    c: &Client,
    crypt_in: &mut Option<Box<dyn Cipher>>,
    initial_connection: bool,
) {
    match c.version {
        Version::Dc | Version::Pc | Version::Gc => {
            let command = if initial_connection { 0x17 } else { 0x02 };
            let server_key = rand::random::<u32>();
            let client_key = rand::random::<u32>();

            let mut w = Writer::new();
            let copyright = if initial_connection {
                DC_PORT_MAP_COPYRIGHT
            } else {
                DC_LOBBY_SERVER_COPYRIGHT
            };
            w.put_ascii(copyright, 0x40);
            w.put_u32(server_key);
            w.put_u32(client_key);
            w.put_ascii(ANTI_COPYRIGHT, 0xC0);
            send_command(c, command, 0x00, w.as_slice());

            if c.version == Version::Gc {
                c.conduit.set_crypt(Box::new(GcCipher::new(server_key)));
                *crypt_in = Some(Box::new(GcCipher::new(client_key)));
            } else {
                c.conduit.set_crypt(Box::new(PcCipher::new(server_key)));
                *crypt_in = Some(Box::new(PcCipher::new(client_key)));
            }
        }
        Version::Patch => {
            let server_key = rand::random::<u32>();
            let client_key = rand::random::<u32>();
            let mut w = Writer::new();
            w.put_ascii(PATCH_SERVER_COPYRIGHT, 0x40);
            w.put_u32(server_key);
            w.put_u32(client_key);
            send_command(c, 0x02, 0x00, w.as_slice());

            c.conduit.set_crypt(Box::new(PcCipher::new(server_key)));
            *crypt_in = Some(Box::new(PcCipher::new(client_key)));
        }
        Version::Bb => {
            let mut server_seed = [0u8; BB_SEED_SIZE];
            let mut client_seed = [0u8; BB_SEED_SIZE];
            for byte in server_seed.iter_mut() {
                *byte = rand::random();
            }
            for byte in client_seed.iter_mut() {
                *byte = rand::random();
            }

            let mut w = Writer::new();
            w.put_ascii(BB_GAME_SERVER_COPYRIGHT, 0x60);
            w.put_bytes(&server_seed);
            w.put_bytes(&client_seed);
            w.put_ascii(ANTI_COPYRIGHT, 0xC0);
            send_command(c, 0x03, 0x00, w.as_slice());

            let (detector, mirror) =
                bb_detector_pair(s.bb_keys.clone(), client_seed, server_seed, &s.log);
            *crypt_in = Some(Box::new(detector));
            c.conduit.set_crypt(Box::new(mirror));
        }
    }
}

/// 04: updates the client's guild card number and security blob.
pub fn send_update_client_config(c: &Client) {
    let mut w = Writer::new();
    w.put_u32(PLAYER_TAG);
    w.put_u32(c.serial_number());
    c.export_security().write(&mut w, c.version);
    send_command(c, 0x04, 0x00, w.as_slice());
}

/// 19 (14 on the patch server): tells the client to reconnect elsewhere.
pub fn send_reconnect(c: &Client, address: u32, port: u16) {
    let mut w = Writer::new();
    w.put_ipv4(address);
    w.put_u16(port);
    w.put_u16(0);
    let command = if c.version == Version::Patch { 0x14 } else { 0x19 };
    send_command(c, command, 0x00, w.as_slice());
}

/// The PC/GC shared-port redirect: one payload that parses as different
/// commands under the two header shapes, steering each dialect to its own
/// port. The layout is byte-exact and must not be "fixed".
pub fn send_pc_gc_split_reconnect(c: &Client, address: u32, pc_port: u16, gc_port: u16) {
    let mut w = Writer::new();
    w.put_ipv4(address);
    w.put_u16(pc_port);
    w.put_u8(0x19); // embedded GC header: command
    w.put_u8(0x00); // flag
    w.put_u16(0x97); // size, as the GC client reads it
    w.put_ipv4(address);
    w.put_u16(gc_port);
    send_command(c, 0x19, 0x00, w.as_slice());
}

////////////////////////////////////////////////////////////////////////////////
// Blue Burst data-server sequence

pub fn send_client_init_bb(c: &Client, error: u32) {
    let mut w = Writer::new();
    w.put_u32(error);
    w.put_u32(PLAYER_TAG);
    w.put_u32(c.serial_number());
    w.put_u32(rand::random::<u32>()); // team id
    c.export_security().write(&mut w, Version::Bb);
    w.put_u32(0x0000_0102); // caps
    send_command(c, 0x00E6, 0x0000_0000, w.as_slice());
}

pub fn send_team_and_key_config_bb(c: &Client) {
    let player = c.player.read().unwrap();
    send_command(c, 0x00E2, 0x0000_0000, &player.key_config);
}

pub fn send_player_preview_bb(c: &Client, player_index: u8, preview_of: Option<&crate::player::DispData>) {
    match preview_of {
        None => {
            let mut w = Writer::new();
            w.put_u32(u32::from(player_index));
            w.put_u32(0x0000_0002); // no player at this slot
            send_command(c, 0x00E4, 0x0000_0000, w.as_slice());
        }
        Some(disp) => {
            let mut w = Writer::new();
            w.put_u32(u32::from(player_index));
            disp.write_bb_preview(&mut w);
            send_command(c, 0x00E5, 0x0000_0000, w.as_slice());
        }
    }
}

pub fn send_accept_client_checksum_bb(c: &Client) {
    let mut w = Writer::new();
    w.put_u32(1);
    w.put_u32(0);
    send_command(c, 0x02E8, 0x0000_0000, w.as_slice());
}

pub fn send_approve_player_choice_bb(c: &Client) {
    let mut w = Writer::new();
    w.put_u32(u32::from(c.bb_player_index.load(std::sync::atomic::Ordering::Acquire)));
    w.put_u32(1);
    send_command(c, 0x00E4, 0x0000_0000, w.as_slice());
}

pub const GUILD_CARD_CHUNK_SIZE: usize = 0x6800;

pub fn send_guild_card_header_bb(c: &Client) {
    let player = c.player.read().unwrap();
    let checksum = crate::player::guild_card_checksum(&player.guild_cards);
    let mut w = Writer::new();
    w.put_u32(1);
    w.put_u32(player.guild_cards.len() as u32);
    w.put_u32(checksum);
    send_command(c, 0x01DC, 0x0000_0000, w.as_slice());
}

pub fn send_guild_card_chunk_bb(c: &Client, chunk_index: u32) {
    let player = c.player.read().unwrap();
    let offset = chunk_index as usize * GUILD_CARD_CHUNK_SIZE;
    if offset >= player.guild_cards.len() {
        return;
    }
    let end = (offset + GUILD_CARD_CHUNK_SIZE).min(player.guild_cards.len());

    let mut w = Writer::new();
    w.put_u32(0);
    w.put_u32(chunk_index);
    w.put_bytes(&player.guild_cards[offset..end]);
    send_command(c, 0x02DC, 0x0000_0000, w.as_slice());
}

pub fn send_complete_player_bb(c: &Client) {
    let serial = c.serial_number();
    let player = c.player.read().unwrap();
    let mut w = Writer::new();
    player.write_bb_player(&mut w, serial);
    send_command(c, 0x00E7, 0x0000_0000, w.as_slice());
}

/// 01EB: the index of fixed data files the client may stream-download.
pub fn send_stream_file_index_bb(c: &Client, entries: &[(String, Vec<u8>)]) {
    let mut w = Writer::new();
    let mut offset = 0u32;
    for (filename, contents) in entries {
        w.put_u32(contents.len() as u32);
        w.put_u32(crate::player::guild_card_checksum(contents));
        w.put_u32(offset);
        w.put_ascii(filename, 0x40);
        offset += contents.len() as u32;
    }
    send_command(c, 0x01EB, entries.len() as u32, w.as_slice());
}

pub const STREAM_FILE_CHUNK_SIZE: usize = 0x6800;

pub fn send_stream_file_chunk_bb(c: &Client, stream: &[u8], chunk_index: u32) {
    let offset = chunk_index as usize * STREAM_FILE_CHUNK_SIZE;
    if offset >= stream.len() {
        return;
    }
    let end = (offset + STREAM_FILE_CHUNK_SIZE).min(stream.len());
    let mut w = Writer::new();
    w.put_u32(chunk_index);
    w.put_bytes(&stream[offset..end]);
    w.pad_to(4);
    send_command(c, 0x02EB, 0x0000_0000, w.as_slice());
}

////////////////////////////////////////////////////////////////////////////////
// patch server

pub fn send_patch_enter_directory(c: &Client, directory: &str) {
    let mut w = Writer::new();
    w.put_ascii(directory, 0x40);
    send_command(c, 0x09, 0x00, w.as_slice());
}

/// 12: no files to patch; the session is complete.
pub fn send_patch_done(c: &Client) {
    send_command(c, 0x12, 0x00, &[]);
}

////////////////////////////////////////////////////////////////////////////////
// text and message commands

fn text_payload(c: &Client, text: &str, with_header: bool, guild_card_number: u32) -> Vec<u8> {
    let mut w = Writer::new();
    if with_header {
        w.put_u32(0);
        w.put_u32(guild_card_number);
    }
    let rendered = text::render_markup(text);
    if c.version.uses_utf16() {
        for unit in text::encode_utf16(&rendered) {
            w.put_u16(unit);
        }
        w.put_u16(0);
    } else {
        w.put_bytes(&text::encode_sjis(&rendered));
        w.put_u8(0);
    }
    w.pad_to(4);
    w.into_vec()
}

pub fn send_message_box(c: &Client, text: &str) {
    let command = if c.version == Version::Patch { 0x13 } else { 0x1A };
    let payload = text_payload(c, text, false, 0);
    send_command(c, command, 0x00, &payload);
}

pub fn send_lobby_name(c: &Client, text: &str) {
    let payload = text_payload(c, text, false, 0);
    send_command(c, 0x8A, 0x00, &payload);
}

pub fn send_quest_info(c: &Client, text: &str, is_download_quest: bool) {
    let command = if is_download_quest { 0xA5 } else { 0xA3 };
    let payload = text_payload(c, text, false, 0);
    send_command(c, command, 0x00, &payload);
}

pub fn send_lobby_message_box(c: &Client, text: &str) {
    let payload = text_payload(c, text, true, 0);
    send_command(c, 0x01, 0x00, &payload);
}

pub fn send_ship_info(c: &Client, text: &str) {
    let payload = text_payload(c, text, true, 0);
    send_command(c, 0x11, 0x00, &payload);
}

pub fn send_text_message(c: &Client, text: &str) {
    let payload = text_payload(c, text, true, 0);
    send_command(c, 0xB0, 0x00, &payload);
}

pub fn send_text_message_lobby(l: &Lobby, text: &str) {
    let state = l.read();
    for client in state.occupied_clients() {
        send_text_message(client, text);
    }
}

pub fn send_text_message_server(s: &ServerState, text: &str) {
    for lobby in s.all_lobbies() {
        send_text_message_lobby(&lobby, text);
    }
}

/// 06: chat relay. The name and body are joined with the tab-J separator
/// the clients expect.
pub fn send_chat_message(c: &Client, from_guild_card_number: u32, from_name: &str, text: &str) {
    let mut data = String::new();
    if c.version == Version::Bb {
        data.push_str("\tJ");
    }
    data.push_str(text::remove_language_marker(from_name));
    data.push_str("\t\tJ");
    data.push_str(text);

    // Chat text is already in wire form; no markup pass.
    let mut w = Writer::new();
    w.put_u32(0);
    w.put_u32(from_guild_card_number);
    if c.version.uses_utf16() {
        for unit in text::encode_utf16(&data) {
            w.put_u16(unit);
        }
        w.put_u16(0);
    } else {
        w.put_bytes(&text::encode_sjis(&data));
        w.put_u8(0);
    }
    w.pad_to(4);
    send_command(c, 0x06, 0x00, w.as_slice());
}

/// 81: simple mail (GC only in practice).
pub fn send_simple_mail(c: &Client, from_guild_card_number: u32, from_name: &str, text: &str) {
    let mut w = Writer::new();
    w.put_u32(PLAYER_TAG);
    w.put_u32(from_guild_card_number);
    w.put_text(text::remove_language_marker(from_name), NAME_WIDTH, c.version.uses_utf16());
    w.put_u32(c.serial_number());
    w.put_text(text, 0x200, c.version.uses_utf16());
    send_command(c, 0x81, 0x00, w.as_slice());
}

/// D8: the info board, one entry per lobby member.
pub fn send_info_board(c: &Client, l: &Lobby) {
    let utf16 = c.version.uses_utf16();
    let mut w = Writer::new();
    let state = l.read();
    let mut count = 0u32;
    for client in state.occupied_clients() {
        let player = client.player.read().unwrap();
        w.put_text(&player.disp.name, NAME_WIDTH, utf16);
        w.put_text(&text::render_markup(&player.info_board), 0xAC, utf16);
        count += 1;
    }
    send_command(c, 0xD8, count, w.as_slice());
}

////////////////////////////////////////////////////////////////////////////////
// guild cards

/// 41: result of a guild card search, carrying an embedded reconnect
/// command pointing at the found player's server.
pub fn send_card_search_result(
    s: &ServerState,
    c: &Client,
    result: &Client,
    result_lobby: &Lobby,
) {
    let utf16 = c.version.uses_utf16();
    let header_size = c.version.header_size();

    let mut w = Writer::new();
    w.put_u32(PLAYER_TAG);
    w.put_u32(c.serial_number());
    w.put_u32(result.serial_number());

    // Embedded reconnect header + body in this client's own framing.
    let reconnect_size = (header_size + 8) as u16;
    match c.version {
        Version::Dc | Version::Gc => {
            w.put_u8(0x19);
            w.put_u8(0x00);
            w.put_u16(reconnect_size);
        }
        _ => {
            w.put_u16(reconnect_size);
            w.put_u16(0x19);
            if c.version == Version::Bb {
                w.put_u32(0);
            }
        }
    }
    w.put_ipv4(s.connect_address_for_client(c));
    let port = s.lobby_port_for_version(result.version).unwrap_or(0);
    w.put_u16(port);
    w.put_u16(0);

    let location = if result_lobby.is_game() {
        format!("{},BLOCK00,{}", result_lobby.read().name, s.name)
    } else {
        format!(",BLOCK00,{}", s.name)
    };
    w.put_ascii(&location, 0x44);
    w.put_u32(crate::menu::MENU_ID_LOBBY);
    w.put_u32(result.lobby_id() as u32);
    w.put_ascii("", 0x04);
    let result_player = result.player.read().unwrap();
    w.put_text(&result_player.disp.name, 0x20, utf16);

    send_command(c, 0x41, 0x00, w.as_slice());
}

/// The guild-card-forward subcommand (6x06), sent as a 62 to one client.
pub fn send_guild_card(c: &Client, source: &Client) {
    let source_player = source.player.read().unwrap();
    let name = text::remove_language_marker(&source_player.disp.name).to_string();

    let mut w = Writer::new();
    w.put_u8(0x06);
    w.put_u8(0x00); // patched below once the size is known
    w.put_u16(0x0000);
    match c.version {
        Version::Bb => {
            w.put_u32(source.serial_number());
            w.put_utf16(&name, 0x18);
            w.put_utf16(&source_player.team_name, 0x10);
            w.put_utf16(&source_player.guild_card_desc, 0x58);
        }
        _ => {
            w.put_u32(PLAYER_TAG);
            w.put_u32(source.serial_number());
            w.put_text(&name, 0x18, c.version.uses_utf16());
            w.put_text(&source_player.guild_card_desc, 0x6C, c.version.uses_utf16());
        }
    }
    w.put_u8(1); // present
    w.put_u8(1);
    w.put_u8(source_player.disp.section_id);
    w.put_u8(source_player.disp.char_class);
    w.pad_to(4);

    let mut payload = w.into_vec();
    payload[1] = (payload.len() / 4) as u8;
    send_command(c, 0x62, u32::from(c.lobby_client_id()), &payload);
}

////////////////////////////////////////////////////////////////////////////////
// menus

/// 07 (or 1F for the information menu): a titled list of entries.
pub fn send_menu(c: &Client, menu_name: &str, menu_id: u32, items: &[MenuItem], is_info_menu: bool) {
    let utf16 = c.version.uses_utf16();
    let text_units = if utf16 { 0x11 } else { 0x12 };

    let mut w = Writer::new();
    w.put_u32(menu_id);
    w.put_u32(0xFFFF_FFFF);
    w.put_u16(0x0004);
    w.put_text(menu_name, text_units, utf16);

    let flags = c.flags();
    let mut count = 0u32;
    for item in items {
        let invisible = match c.version {
            Version::Dc => item.flags.contains(MenuItemFlags::INVISIBLE_ON_DC),
            Version::Pc | Version::Patch => item.flags.contains(MenuItemFlags::INVISIBLE_ON_PC),
            Version::Gc => item.flags.contains(MenuItemFlags::INVISIBLE_ON_GC),
            Version::Bb => item.flags.contains(MenuItemFlags::INVISIBLE_ON_BB),
        };
        if invisible
            || (item.flags.contains(MenuItemFlags::REQUIRES_MESSAGE_BOXES)
                && flags.contains(ClientFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION))
        {
            continue;
        }
        w.put_u32(menu_id);
        w.put_u32(item.item_id);
        w.put_u16(if c.version == Version::Bb { 0x0004 } else { 0x0F04 });
        w.put_text(&item.name, text_units, utf16);
        count += 1;
    }

    send_command(c, if is_info_menu { 0x1F } else { 0x07 }, count, w.as_slice());
}

/// 08: the game list.
pub fn send_game_menu(c: &Client, s: &ServerState) {
    let utf16 = c.version.uses_utf16();
    let client_is_ep3 = c.flags().contains(ClientFlags::EPISODE_3);

    let mut w = Writer::new();
    w.put_u32(crate::menu::MENU_ID_GAME);
    w.put_u32(0);
    w.put_u8(0x00);
    w.put_u8(0x00);
    w.put_text(&s.name, NAME_WIDTH, utf16);
    w.put_u8(0x00);
    w.put_u8(0x04);

    let mut count = 0u32;
    for lobby in s.all_lobbies() {
        if !lobby.is_game() || lobby.version != c.version {
            continue;
        }
        let state = lobby.read();
        let lobby_is_ep3 = state.flags.contains(LobbyFlags::EPISODE_3);
        if lobby_is_ep3 != client_is_ep3 {
            continue;
        }

        w.put_u32(crate::menu::MENU_ID_GAME);
        w.put_u32(lobby.lobby_id as u32);
        w.put_u8(if lobby_is_ep3 { 0x0A } else { state.difficulty + 0x22 });
        w.put_u8(state.count_clients() as u8);
        w.put_text(&state.name, NAME_WIDTH, utf16);
        let episode = if c.version == Version::Bb {
            (state.max_clients << 4) | state.episode
        } else {
            state.episode
        };
        w.put_u8(episode);
        let flags = if lobby_is_ep3 {
            if state.password.is_empty() {
                0
            } else {
                2
            }
        } else {
            (state.episode << 6)
                | ((state.mode % 3) << 4)
                | if state.password.is_empty() { 0 } else { 2 }
                | if state.mode == 3 { 4 } else { 0 }
        };
        w.put_u8(flags);
        count += 1;
    }

    send_command(c, 0x08, count, w.as_slice());
}

/// A2 (or A4 for download menus): a quest list.
pub fn send_quest_menu(c: &Client, menu_id: u32, quests: &[Arc<Quest>], is_download_menu: bool) {
    let utf16 = c.version.uses_utf16();
    let mut w = Writer::new();
    for quest in quests {
        w.put_u32(menu_id);
        w.put_u32(quest.quest_id);
        w.put_text(&quest.name, 0x20, utf16);
        w.put_text(&text::render_markup(&quest.short_description), 0x70, utf16);
    }
    send_command(c, if is_download_menu { 0xA4 } else { 0xA2 }, quests.len() as u32, w.as_slice());
}

/// A2/A4 over plain menu items (quest categories).
pub fn send_quest_category_menu(c: &Client, menu_id: u32, items: &[MenuItem], is_download_menu: bool) {
    let utf16 = c.version.uses_utf16();
    let mut w = Writer::new();
    for item in items {
        w.put_u32(menu_id);
        w.put_u32(item.item_id);
        w.put_text(&item.name, 0x20, utf16);
        w.put_text(&text::render_markup(&item.description), 0x70, utf16);
    }
    send_command(c, if is_download_menu { 0xA4 } else { 0xA2 }, items.len() as u32, w.as_slice());
}

/// 83: the fixed lobby list. The client only reads the ids.
pub fn send_lobby_list(c: &Client, s: &ServerState) {
    let client_is_ep3 = c.flags().contains(ClientFlags::EPISODE_3);
    let mut w = Writer::new();
    let mut count = 0u32;
    for lobby in s.all_lobbies() {
        let state = lobby.read();
        if !state.flags.contains(LobbyFlags::DEFAULT) {
            continue;
        }
        if state.flags.contains(LobbyFlags::EPISODE_3) && !client_is_ep3 {
            continue;
        }
        w.put_u32(crate::menu::MENU_ID_LOBBY);
        w.put_u32(lobby.lobby_id as u32);
        w.put_u32(0);
        count += 1;
    }
    send_command(c, 0x83, count, w.as_slice());
}

////////////////////////////////////////////////////////////////////////////////
// joining lobbies and games

fn write_lobby_data(w: &mut Writer, c: &Client, member: &Client) {
    let member_player = member.player.read().unwrap();
    match c.version {
        Version::Bb => {
            w.put_u32(PLAYER_TAG);
            w.put_u32(member.serial_number());
            w.put_zeroes(5 * 4);
            w.put_u32(u32::from(member.lobby_client_id()));
            w.put_utf16(&member_player.disp.name, NAME_WIDTH);
            w.put_u32(0);
        }
        _ => {
            w.put_u32(PLAYER_TAG);
            w.put_u32(member.serial_number());
            // A zero address makes the Episode 3 lobby start button dead, so
            // a loopback placeholder goes on the wire instead.
            w.put_ipv4(0x7F00_0001);
            w.put_u32(u32::from(member.lobby_client_id()));
            w.put_text(&member_player.disp.name, NAME_WIDTH, c.version.uses_utf16());
        }
    }
}

/// 64: the full game state for a joining client.
pub fn send_join_game(c: &Client, l: &Lobby) {
    let state = l.read();
    let mut w = Writer::new();

    for variation in state.variations.iter().take(VARIATION_COUNT) {
        w.put_u32(*variation);
    }

    let mut player_count = 0u32;
    for slot in 0..crate::lobby::GAME_MAX_CLIENTS {
        match state.clients.get(slot).and_then(|s| s.as_ref()) {
            Some(member) => {
                write_lobby_data(&mut w, c, member);
                player_count += 1;
            }
            None => {
                // Empty slots are zero-filled to keep the array shape.
                let entry_size = if c.version == Version::Bb {
                    8 + 20 + 4 + NAME_WIDTH * 2 + 4
                } else {
                    16 + NAME_WIDTH * if c.version.uses_utf16() { 2 } else { 1 }
                };
                w.put_zeroes(entry_size);
            }
        }
    }

    w.put_u8(c.lobby_client_id());
    w.put_u8(state.leader_id);
    w.put_u8(0x01); // disable udp
    w.put_u8(state.difficulty);
    w.put_u8(if state.mode == 1 { 1 } else { 0 });
    w.put_u8(state.event);
    w.put_u8(state.section_id);
    w.put_u8(if state.mode == 2 { 1 } else { 0 });
    w.put_u32(state.rare_seed);
    w.put_u8(state.episode);
    w.put_u8(0x01);
    w.put_u8(if state.mode == 3 { 1 } else { 0 });
    w.put_u8(0x00);

    send_command(c, 0x64, player_count, w.as_slice());
}

fn lobby_type_for_client(c: &Client, state: &crate::lobby::LobbyState) -> u8 {
    let mut lobby_type =
        if state.lobby_type > 14 { state.block.wrapping_sub(1) } else { state.lobby_type };
    if c.version == Version::Gc {
        if c.flags().contains(ClientFlags::EPISODE_3) {
            if state.lobby_type > 0x14 && state.lobby_type < 0xE9 {
                lobby_type = state.block.wrapping_sub(1);
            }
        } else if state.lobby_type > 0x11
            && state.lobby_type != 0x67
            && state.lobby_type != 0xD4
            && state.lobby_type < 0xFC
        {
            lobby_type = state.block.wrapping_sub(1);
        }
    } else if lobby_type > 0x0E {
        lobby_type = state.block.wrapping_sub(1);
    }
    lobby_type
}

fn write_join_lobby_command(c: &Client, l: &Lobby, only_member: Option<&Arc<Client>>) -> (Vec<u8>, u32) {
    let state = l.read();
    let mut w = Writer::new();
    w.put_u8(c.lobby_client_id());
    w.put_u8(state.leader_id);
    w.put_u8(0x01); // disable udp
    w.put_u8(lobby_type_for_client(c, &state));
    w.put_u16(u16::from(state.block));
    w.put_u16(u16::from(state.event));
    w.put_u32(0);

    let mut count = 0u32;
    let mut write_member = |member: &Arc<Client>| {
        write_lobby_data(&mut w, c, member);
        let member_player = member.player.read().unwrap();
        match c.version {
            Version::Bb => member_player.write_lobby_data_bb(&mut w),
            Version::Pc => member_player.write_lobby_data_pcgc(&mut w, true),
            _ => member_player.write_lobby_data_pcgc(&mut w, false),
        }
        count += 1;
    };

    match only_member {
        Some(member) => write_member(member),
        None => {
            for member in state.occupied_clients() {
                write_member(member);
            }
        }
    }

    (w.into_vec(), count)
}

/// 67: the full lobby state for a joining client.
pub fn send_join_lobby(c: &Client, l: &Lobby) {
    let (payload, count) = write_join_lobby_command(c, l, None);
    send_command(c, 0x67, count, &payload);

    if c.flags().contains(ClientFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION_AFTER_LOBBY_JOIN)
        && !c.flags().contains(ClientFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION)
    {
        c.add_flags(ClientFlags::NO_MESSAGE_BOX_CLOSE_CONFIRMATION);
        send_update_client_config(c);
    }
}

/// 68 (lobby) or 65 (game): tells an existing member about a joiner.
pub fn send_player_join_notification(c: &Client, l: &Lobby, joining_client: &Arc<Client>) {
    let command = if l.is_game() { 0x65 } else { 0x68 };
    let (payload, count) = write_join_lobby_command(c, l, Some(joining_client));
    send_command(c, command, count, &payload);
}

/// 66 (game) or 69 (lobby): a member left; the flag carries the slot and
/// the body carries the new leader.
pub fn send_player_leave_notification(l: &Lobby, leaving_client_id: u8) {
    let leader_id = l.read().leader_id;
    let mut w = Writer::new();
    w.put_u8(leaving_client_id);
    w.put_u8(leader_id);
    w.put_u16(0);
    let command = if l.is_game() { 0x66 } else { 0x69 };
    send_to_lobby(l, command, u32::from(leaving_client_id), w.as_slice(), None);
}

pub fn send_self_leave_notification(c: &Client) {
    let mut w = Writer::new();
    w.put_u8(c.lobby_client_id());
    w.put_u8(0);
    w.put_u16(0);
    send_command(c, 0x69, u32::from(c.lobby_client_id()), w.as_slice());
}

/// 95: asks the client to send its 61 player data.
pub fn send_get_player_info(c: &Client) {
    send_command(c, 0x95, 0x00, &[]);
}

////////////////////////////////////////////////////////////////////////////////
// lobby niceties

/// 88: everyone's arrow colors.
pub fn send_arrow_update(l: &Lobby) {
    let mut w = Writer::new();
    let state = l.read();
    let mut count = 0u32;
    for client in state.occupied_clients() {
        w.put_u32(PLAYER_TAG);
        w.put_u32(client.serial_number());
        w.put_u32(client.lobby_arrow_color.load(std::sync::atomic::Ordering::Acquire));
        count += 1;
    }
    drop(state);
    send_to_lobby(l, 0x88, count, w.as_slice(), None);
}

/// The resume-game subcommand broadcast once a joiner finishes loading.
pub fn send_resume_game(l: &Lobby, ready_client: &Client) {
    let data: [u8; 4] = [0x72, 0x03, 0x1C, 0x08];
    send_to_lobby(l, 0x60, 0x00, &data, Some(ready_client));
}

/// B1: the server clock.
pub fn send_server_time(c: &Client) {
    let now = chrono::Local::now();
    let formatted = now.format("%Y:%m:%d: %H:%M:%S").to_string();
    let mut w = Writer::new();
    w.put_ascii(&formatted, 0x1C);
    send_command(c, 0xB1, 0x00, w.as_slice());
}

////////////////////////////////////////////////////////////////////////////////
// in-game commands

#[derive(Debug, Copy, Clone)]
pub enum StatChange {
    SubtractHp = 0,
    SubtractTp = 1,
    SubtractMeseta = 2,
    AddHp = 3,
    AddTp = 4,
}

/// A run of 6x9A stat-change subcommands; each step moves at most 0xFF.
pub fn send_player_stats_change(l: &Lobby, c: &Client, stat: StatChange, amount: u32) {
    let mut amount = amount.min(2550);
    let mut w = Writer::new();
    while amount > 0 {
        let step = amount.min(0xFF) as u8;
        w.put_u8(0x9A);
        w.put_u8(0x02);
        w.put_u8(c.lobby_client_id());
        w.put_u8(0x00);
        w.put_u8(0x00);
        w.put_u8(0x00);
        w.put_u8(stat as u8);
        w.put_u8(step);
        amount -= u32::from(step);
    }
    send_to_lobby(l, 0x60, 0x00, w.as_slice(), None);
}

/// 6x94 warp, targeted at one client.
pub fn send_warp(c: &Client, area: u32) {
    let mut w = Writer::new();
    w.put_u8(0x94);
    w.put_u8(0x02);
    w.put_u8(c.lobby_client_id());
    w.put_u8(0x00);
    w.put_u32(area);
    send_command(c, 0x62, u32::from(c.lobby_client_id()), w.as_slice());
    c.area.store(area, std::sync::atomic::Ordering::Release);
}

/// 6x5F: an enemy (or box) drop everyone should see.
pub fn send_drop_item(l: &Lobby, item: &ItemData, from_enemy: bool, area: u8, x: f32, z: f32, request_id: u16) {
    let mut w = Writer::new();
    w.put_u8(0x5F);
    w.put_u8(0x0B);
    w.put_u16(0x0000);
    w.put_u8(area);
    w.put_u8(from_enemy as u8);
    w.put_u16(request_id);
    w.put_f32(x);
    w.put_f32(z);
    w.put_u32(0);
    item.write(&mut w);
    w.put_u32(0);
    send_to_lobby(l, 0x60, 0x00, w.as_slice(), None);
}

/// 6x5D: a stack split dropped on the floor.
pub fn send_drop_stacked_item(l: &Lobby, item: &ItemData, area: u8, x: f32, z: f32) {
    let mut w = Writer::new();
    w.put_u8(0x5D);
    w.put_u8(0x0A);
    w.put_u16(0x0000);
    w.put_u8(area);
    w.put_u8(0x00);
    w.put_u16(0x0000);
    w.put_f32(x);
    w.put_f32(z);
    item.write(&mut w);
    w.put_u32(0);
    send_to_lobby(l, 0x60, 0x00, w.as_slice(), None);
}

/// 6x59: a player picked an item up off the floor.
pub fn send_pick_up_item(l: &Lobby, c: &Client, item_id: u32, area: u8) {
    let mut w = Writer::new();
    w.put_u8(0x59);
    w.put_u8(0x03);
    w.put_u8(c.lobby_client_id());
    w.put_u8(0x00);
    w.put_u8(c.lobby_client_id());
    w.put_u8(area);
    w.put_u16(0x0000);
    w.put_u32(item_id);
    send_to_lobby(l, 0x60, 0x00, w.as_slice(), None);
}

/// 6xBE: an item materialized in a player's inventory (bank withdrawals).
pub fn send_create_inventory_item(l: &Lobby, c: &Client, item: &ItemData) {
    let mut w = Writer::new();
    w.put_u8(0xBE);
    w.put_u8(0x07);
    w.put_u8(c.lobby_client_id());
    w.put_u8(0x00);
    item.write(&mut w);
    w.put_u32(0);
    send_to_lobby(l, 0x60, 0x00, w.as_slice(), None);
}

/// 6x29: an inventory item (or part of a stack) was destroyed.
pub fn send_destroy_item(l: &Lobby, c: &Client, item_id: u32, amount: u32) {
    let mut w = Writer::new();
    w.put_u8(0x29);
    w.put_u8(0x03);
    w.put_u8(c.lobby_client_id());
    w.put_u8(0x00);
    w.put_u32(item_id);
    w.put_u32(amount);
    send_to_lobby(l, 0x60, 0x00, w.as_slice(), None);
}

/// 6xBC over 6C: the player's bank contents. Uses the wide broadcast
/// command because banks routinely exceed the small relay limit.
pub fn send_bank(c: &Client) {
    let player = c.player.read().unwrap();
    let mut w = Writer::new();
    w.put_u8(0xBC);
    w.put_u8(0x00);
    w.put_u16(0x0000);
    let size = 8 + 16 + player.bank.items.len() * 24;
    w.put_u32(size as u32);
    w.put_u32(rand::random::<u32>()); // checksum nonce
    w.put_u32(player.bank.items.len() as u32);
    w.put_u32(player.bank.meseta);
    for item in &player.bank.items {
        item.write(&mut w);
    }
    send_command(c, 0x6C, 0x00, w.as_slice());
}

/// 6xB6 over 6C: a shop's inventory.
pub fn send_shop(c: &Client, shop_type: u8) {
    let player = c.player.read().unwrap();
    let count = player.shop_contents.len().min(20);
    let mut w = Writer::new();
    w.put_u8(0xB6);
    w.put_u8(0x2C);
    w.put_u16(0x037F);
    w.put_u8(shop_type);
    w.put_u8(count as u8);
    w.put_u16(0x0000);
    for item in player.shop_contents.iter().take(count) {
        item.write(&mut w);
    }
    send_command(c, 0x6C, 0x00, w.as_slice());
}

/// 6x30: a level-up with the new stat block, equipment bonuses included.
pub fn send_level_up(l: &Lobby, c: &Client) {
    let player = c.player.read().unwrap();
    let mut stats = player.disp.stats;

    for item in &player.inventory.items {
        if item.equip_flags & 0x08 != 0 && item.data.data1[0] == 0x02 {
            let halves =
                |index: usize| u16::from_le_bytes([item.data.data1[index], item.data.data1[index + 1]]);
            stats.dfp += halves(4) / 100;
            stats.atp += halves(6) / 50;
            stats.ata += halves(8) / 200;
            stats.mst += halves(10) / 50;
        }
    }

    let mut w = Writer::new();
    w.put_u8(0x30);
    w.put_u8(0x05);
    w.put_u8(c.lobby_client_id());
    w.put_u8(0x00);
    w.put_u16(stats.atp);
    w.put_u16(stats.mst);
    w.put_u16(stats.evp);
    w.put_u16(stats.hp);
    w.put_u16(stats.dfp);
    w.put_u16(stats.ata);
    w.put_u32(player.disp.level);
    send_to_lobby(l, 0x60, 0x00, w.as_slice(), None);
}

/// 6xBF: grants experience (Blue Burst).
pub fn send_give_experience(l: &Lobby, c: &Client, amount: u32) {
    let mut w = Writer::new();
    w.put_u8(0xBF);
    w.put_u8(0x02);
    w.put_u8(c.lobby_client_id());
    w.put_u8(0x00);
    w.put_u32(amount);
    send_to_lobby(l, 0x60, 0x00, w.as_slice(), None);
}

////////////////////////////////////////////////////////////////////////////////
// Episode 3

/// B8: the compressed card definition archive.
pub fn send_ep3_card_list_update(s: &ServerState, c: &Client) {
    let cards = s.ep3_cards.read().unwrap().clone();
    let data = cards.compressed_definitions();
    let mut w = Writer::with_capacity(data.len() + 4);
    w.put_u32(data.len() as u32);
    w.put_bytes(data);
    send_command(c, 0xB8, 0x00, w.as_slice());
}

/// B7: a generic rank so the client renders a profile.
pub fn send_ep3_rank_update(c: &Client) {
    let mut w = Writer::new();
    w.put_u32(0);
    w.put_ascii("", 0x0C);
    w.put_u32(0x00FF_FFFF);
    w.put_u32(0x00FF_FFFF);
    w.put_u32(0xFFFF_FFFF);
    send_command(c, 0xB7, 0x00, w.as_slice());
}

////////////////////////////////////////////////////////////////////////////////
// quest delivery

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QuestFileType {
    Online,
    Download,
}

/// 44 (online) or A6 (download): announces a quest file by name and size.
pub fn send_quest_open_file(
    c: &Client,
    quest_name: &str,
    filename: &str,
    file_size: u32,
    file_type: QuestFileType,
) {
    let (command, flags) = match file_type {
        QuestFileType::Online => (0x44u16, 2u32),
        QuestFileType::Download => (0xA6u16, 0u32),
    };
    let mut w = Writer::new();
    w.put_ascii(&format!("PSO/{}", quest_name), 0x20);
    w.put_zeroes(2);
    w.put_u16(flags as u16);
    w.put_ascii(filename, 0x10);
    w.put_u32(file_size);
    send_command(c, command, 0x00, w.as_slice());
}

pub const QUEST_CHUNK_SIZE: usize = 0x400;

/// 13 (online) or A7 (download): one 1KB chunk of a quest file.
pub fn send_quest_file_chunk(
    c: &Client,
    filename: &str,
    chunk_index: u32,
    data: &[u8],
    file_type: QuestFileType,
) {
    debug_assert!(data.len() <= QUEST_CHUNK_SIZE);
    let mut w = Writer::new();
    w.put_ascii(filename, 0x10);
    w.put_bytes(data);
    w.put_zeroes(QUEST_CHUNK_SIZE - data.len());
    w.put_u32(data.len() as u32);
    let command = if file_type == QuestFileType::Online { 0x13 } else { 0xA7 };
    send_command(c, command, chunk_index, w.as_slice());
}

/// Streams a whole quest file in 1KB chunks.
pub fn send_quest_file(
    c: &Client,
    quest_name: &str,
    basename: &str,
    contents: &[u8],
    file_type: QuestFileType,
) {
    send_quest_open_file(c, quest_name, basename, contents.len() as u32, file_type);
    for (index, chunk) in contents.chunks(QUEST_CHUNK_SIZE).enumerate() {
        send_quest_file_chunk(c, basename, index as u32, chunk, file_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Behavior;
    use rigging::channel::Conduit;
    use rigging::frame::Header;

    fn test_client(version: Version) -> Client {
        Client::new(
            version,
            Behavior::LobbyServer,
            0,
            Arc::new(Conduit::detached(version)),
            "192.168.1.10:9421".parse().unwrap(),
            "10.0.0.2:50000".parse().unwrap(),
        )
    }

    fn drain_one(c: &Client) -> (Header, Vec<u8>) {
        let data = c.conduit.take_pending();
        let header = Header::parse(c.version, &data);
        (header, data[c.version.header_size()..header.size as usize].to_vec())
    }

    #[test]
    fn reconnect_carries_address_and_port() {
        let c = test_client(Version::Gc);
        send_reconnect(&c, 0xC0A8_010A, 9421);
        let (header, payload) = drain_one(&c);
        assert_eq!(header.command, 0x19);
        assert_eq!(&payload[..4], &[192, 168, 1, 10]);
        assert_eq!(u16::from_le_bytes([payload[4], payload[5]]), 9421);
    }

    #[test]
    fn split_reconnect_embeds_a_second_header() {
        let c = test_client(Version::Pc);
        send_pc_gc_split_reconnect(&c, 0x0A00_0001, 9300, 9100);
        let (header, payload) = drain_one(&c);
        assert_eq!(header.command, 0x19);
        // The GC client, parsing the same bytes with its own header shape,
        // sees command 0x19 at the embedded offset.
        assert_eq!(payload[6], 0x19);
        assert_eq!(payload[7], 0x00);
        assert_eq!(&payload[10..14], &[10, 0, 0, 1]);
        assert_eq!(u16::from_le_bytes([payload[14], payload[15]]), 9100);
    }

    #[test]
    fn text_message_is_red_tinted_and_padded() {
        let c = test_client(Version::Gc);
        send_text_message(&c, "$C6You do not have\npermission to\nrun this command.");
        let (header, payload) = drain_one(&c);
        assert_eq!(header.command, 0xB0);
        // Markup renders the $ as a TAB control.
        assert_eq!(payload[8], b'\t');
        assert_eq!(&payload[9..11], b"C6");
        assert_eq!(payload.len() % 4, 0);
    }

    #[test]
    fn patch_clients_get_the_patch_message_box() {
        let c = test_client(Version::Patch);
        send_message_box(&c, "hello");
        let (header, _) = drain_one(&c);
        assert_eq!(header.command, 0x13);
    }

    #[test]
    fn leaving_leader_notifies_survivors_with_slot_and_new_leader() {
        let lobby = crate::lobby::Lobby::new_lobby(9, Version::Gc, 1);
        let clients: Vec<Arc<Client>> = (0..3).map(|_| Arc::new(test_client(Version::Gc))).collect();
        {
            let mut state = lobby.write();
            for (client, &slot) in clients.iter().zip(&[0usize, 3, 7]) {
                state.clients[slot] = Some(client.clone());
                client.lobby_client_id.store(slot as u8, std::sync::atomic::Ordering::Release);
                client.lobby_id.store(9, std::sync::atomic::Ordering::Release);
            }
            state.leader_id = 3;
        }

        let (left_slot, _) = lobby.remove_client(&clients[1]).unwrap();
        assert_eq!(left_slot, 3);
        send_player_leave_notification(&lobby, left_slot);

        for survivor in &[&clients[0], &clients[2]] {
            let (header, payload) = drain_one(survivor);
            assert_eq!(header.command, 0x69);
            assert_eq!(header.flag, 3);
            assert_eq!(payload[0], 3); // the vacated slot
            assert_eq!(payload[1], 0); // the new leader: lowest occupied
        }
        // The departed client got nothing.
        assert!(clients[1].conduit.take_pending().is_empty());
    }

    #[test]
    fn server_init_installs_symmetric_gc_ciphers() {
        let log = keel::logging::discard();
        let state = ServerState::new(
            "Pioneer".into(),
            Arc::new(crate::license::LicenseStore::ephemeral()),
            &log,
        );
        let c = test_client(Version::Gc);
        let mut crypt_in: Option<Box<dyn Cipher>> = None;
        send_server_init(&state, &c, &mut crypt_in, false);
        assert!(crypt_in.is_some());

        // The init command itself is plaintext and parseable.
        let data = c.conduit.take_pending();
        let header = Header::parse(Version::Gc, &data);
        assert_eq!(header.command, 0x02);

        // Later commands come out encrypted: a fresh GC cipher seeded with
        // the server key from the init body must decrypt them.
        let server_key =
            u32::from_le_bytes([data[4 + 0x40], data[5 + 0x40], data[6 + 0x40], data[7 + 0x40]]);
        send_command(&c, 0x1D, 0x00, &[]);
        let mut encrypted = c.conduit.take_pending();
        let mut rx = GcCipher::new(server_key);
        rx.decrypt(&mut encrypted).unwrap();
        let ping = Header::parse(Version::Gc, &encrypted);
        assert_eq!(ping.command, 0x1D);
    }
}
