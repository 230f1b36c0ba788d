//! Blue Burst login and the data-server sequence: options, character
//! previews, guild card file download and the stream-file download.

use super::{HandlerError, HandlerResult};
use crate::client::{Behavior, Client, ClientFlags};
use crate::license::LoginError;
use crate::player::{DispData, Player};
use crate::sends;
use crate::state::ServerState;
use crate::wire::Reader;
use keel::logging;
use rigging::endpoint::CommandCtx;
use std::sync::Arc;

/// E6 reject codes; zero means success.
fn client_init_error(err: LoginError) -> u32 {
    match err {
        LoginError::NoUsername => 0x08,
        LoginError::MissingLicense => 0x01,
        LoginError::IncorrectAccessKey => 0x02,
        LoginError::IncorrectPassword => 0x02,
        LoginError::Banned => 0x06,
    }
}

/// 93: the Blue Burst login. Carries the username/password pair plus the
/// echoed security blob from a previous connection stage.
pub fn on_login_bb(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let _player_tag = reader.get_u32()?;
    let _guild_card_number = reader.get_u32()?;
    reader.skip(0x08)?;
    let username = reader.get_ascii(0x10)?;
    let password = reader.get_ascii(0x10)?;
    reader.skip(0x28.min(reader.remaining()))?;
    let security = if reader.remaining() > 0 {
        reader.get_bytes(reader.remaining().min(0x28))?.to_vec()
    } else {
        Vec::new()
    };

    match s.license_store.verify_bb(&username, &password) {
        Ok(license) => {
            logging::info!(s.log, "bb client logged in"; "username" => %username);
            c.set_license(license.clone());
            if security.is_empty() {
                c.set_flags(ClientFlags::defaults_for(c.version, 0));
            } else {
                c.import_security(&security);
            }

            // Restore the account-wide data for this license if it exists.
            {
                let mut player = c.player.write().unwrap();
                let account_path = crate::player::account_filename(&license.bb_username);
                if player.load_account(&account_path).is_err() {
                    *player = Player::default();
                }
            }

            sends::send_client_init_bb(c, 0);
            if c.behavior == Behavior::LobbyServer {
                sends::send_lobby_list(c, s);
                sends::send_get_player_info(c);
            }
            Ok(())
        }
        Err(err) => {
            logging::info!(s.log, "bb login refused"; "username" => %username, "error" => %err);
            sends::send_client_init_bb(c, client_init_error(err));
            Ok(())
        }
    }
}

/// E0: the client wants its saved options.
pub fn on_request_settings(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    sends::send_team_and_key_config_bb(c);
    Ok(())
}

fn player_path_for(c: &Client, player_index: u8) -> Option<String> {
    let license = c.license()?;
    if license.bb_username.is_empty() {
        return None;
    }
    Some(crate::player::player_filename(&license.bb_username, player_index))
}

/// E3: character-slot interaction. `selecting` zero asks for a preview;
/// nonzero commits to the slot and moves the session on to the lobby
/// server.
pub fn on_character_select(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let player_index = reader.get_u32()? as u8;
    let selecting = reader.get_u32()? != 0;

    let path = player_path_for(c, player_index)
        .ok_or(HandlerError::Auth(LoginError::MissingLicense))?;

    if !selecting {
        let mut probe = Player::default();
        match probe.load_player(&path) {
            Ok(()) => sends::send_player_preview_bb(c, player_index, Some(&probe.disp)),
            Err(_) => sends::send_player_preview_bb(c, player_index, None),
        }
        return Ok(());
    }

    {
        let mut player = c.player.write().unwrap();
        if let Err(err) = player.load_player(&path) {
            logging::warn!(s.log, "character slot unreadable";
                           "path" => %path, "error" => %err);
            sends::send_player_preview_bb(c, player_index, None);
            return Ok(());
        }
    }
    c.bb_player_index.store(player_index, std::sync::atomic::Ordering::Release);
    sends::send_approve_player_choice_bb(c);

    if c.behavior == Behavior::DataServerBB {
        let address = s.connect_address_for_client(c);
        if let Some(port) = s.lobby_port_for_version(c.version) {
            sends::send_reconnect(c, address, port);
        }
    }
    Ok(())
}

/// E5: create a character in a slot from the preview the client built.
pub fn on_create_character(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let player_index = reader.get_u32()? as u8;

    // The preview: experience and level lead, the appearance block follows.
    let _experience = reader.get_u32()?;
    let level = reader.get_u32()?;
    let guild_card = reader.get_ascii(0x10)?;
    reader.skip(8)?;
    let name_color = reader.get_u32()?;
    let extra_model = reader.get_u8()?;
    reader.skip(15)?;
    let name_color_checksum = reader.get_u32()?;
    let section_id = reader.get_u8()?;
    let char_class = reader.get_u8()?;
    let v2_flags = reader.get_u8()?;
    let version = reader.get_u8()?;
    let v1_flags = reader.get_u32()?;
    let costume = reader.get_u16()?;
    let skin = reader.get_u16()?;
    let face = reader.get_u16()?;
    let head = reader.get_u16()?;
    let hair = reader.get_u16()?;
    let hair_r = reader.get_u16()?;
    let hair_g = reader.get_u16()?;
    let hair_b = reader.get_u16()?;
    let proportion_x = reader.get_f32()?;
    let proportion_y = reader.get_f32()?;
    let name = reader.get_utf16(0x10)?;

    let path = player_path_for(c, player_index)
        .ok_or(HandlerError::Auth(LoginError::MissingLicense))?;

    {
        let mut player = c.player.write().unwrap();
        let mut disp = DispData::default();
        disp.level = level;
        disp.guild_card = guild_card;
        disp.name_color = name_color;
        disp.extra_model = extra_model;
        disp.name_color_checksum = name_color_checksum;
        disp.section_id = section_id;
        disp.char_class = char_class;
        disp.v2_flags = v2_flags;
        disp.version = version;
        disp.v1_flags = v1_flags;
        disp.costume = costume;
        disp.skin = skin;
        disp.face = face;
        disp.head = head;
        disp.hair = hair;
        disp.hair_r = hair_r;
        disp.hair_g = hair_g;
        disp.hair_b = hair_b;
        disp.proportion_x = proportion_x;
        disp.proportion_y = proportion_y;
        disp.name = name;
        disp.normalize_name();

        // Starting stats come from the level table.
        let level_table = s.level_table.read().unwrap().clone();
        if let Some(stats) = level_table.stats_at_level(char_class, level as u8) {
            disp.stats = stats;
        }

        player.disp = disp;
        if let Err(err) = player.save_player(&path) {
            logging::warn!(s.log, "failed to save new character";
                           "path" => %path, "error" => %err);
        }
    }

    c.bb_player_index.store(player_index, std::sync::atomic::Ordering::Release);
    sends::send_approve_player_choice_bb(c);
    Ok(())
}

/// 01E8: the client reports its save checksum; always accepted.
pub fn on_client_checksum(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    sends::send_accept_client_checksum_bb(c);
    Ok(())
}

/// 03E8: the client wants the guild card file; the header starts the
/// chunked download.
pub fn on_guild_card_header_request(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    sends::send_guild_card_header_bb(c);
    Ok(())
}

/// 03DC: acknowledge of a guild card chunk; the body names the next chunk.
pub fn on_guild_card_chunk_request(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let _unknown = reader.get_u32()?;
    let chunk_index = reader.get_u32()?;
    let cont = reader.get_u32().unwrap_or(1);
    if cont != 0 {
        sends::send_guild_card_chunk_bb(c, chunk_index);
    }
    Ok(())
}

/// 04EB (or a bare 01EB): the stream-file index request.
pub fn on_stream_file_index_request(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    sends::send_stream_file_index_bb(c, &s.bb_stream_files);
    Ok(())
}

/// 03EB: one stream-file chunk, addressed by the flag.
pub fn on_stream_file_chunk_request(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    let contents = s.bb_stream_contents();
    sends::send_stream_file_chunk_bb(c, &contents, flag);
    Ok(())
}

/// 00E7: the client uploads its full player blob on certain transitions.
/// The server-side copy is authoritative, so it is acknowledged and
/// dropped.
pub fn on_full_player_upload(
    _s: &Arc<ServerState>,
    _c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    Ok(())
}

/// xxED: incremental option updates (key config, shortcuts, symbol chats).
/// Stored raw; the client re-reads them through E2.
pub fn on_options_update(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut player = c.player.write().unwrap();
    if payload.len() <= player.key_config.len() {
        player.key_config[..payload.len()].copy_from_slice(payload);
    }
    Ok(())
}
