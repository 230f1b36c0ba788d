//! Command handlers. Dispatch is a map from (version, command) to a handler
//! function; every handler gets the server state, the client, the command
//! context (for cipher installs) and the decoded flag/body.

pub mod bb;
pub mod game;
pub mod login;
pub mod lobby;
pub mod patch;

use crate::client::{Behavior, Client};
use crate::items::ItemError;
use crate::license::LoginError;
use crate::lobby::LobbyError;
use crate::state::ServerState;
use crate::wire::WireError;
use keel::crypto::CryptoError;
use rigging::endpoint::CommandCtx;
use rigging::version::Version;
use std::fmt;
use std::sync::Arc;

pub type HandlerResult = Result<(), HandlerError>;

pub type HandlerFn =
    fn(&Arc<ServerState>, &Arc<Client>, &mut CommandCtx, u32, &[u8]) -> HandlerResult;

#[derive(Debug)]
pub enum HandlerError {
    /// A guard refused a user-visible action; the message has already been
    /// delivered (or the caller will deliver it). Never disconnects.
    Precondition(String),
    /// A malformed or out-of-place command; the client gets dropped.
    Protocol(&'static str),
    Auth(LoginError),
    Item(ItemError),
    Lobby(LobbyError),
    Wire(WireError),
    Crypto(CryptoError),
    /// No handler registered for this (version, command) pair.
    Unhandled { command: u16 },
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerError::Precondition(message) => write!(f, "precondition failed: {}", message),
            HandlerError::Protocol(what) => write!(f, "protocol violation: {}", what),
            HandlerError::Auth(err) => write!(f, "authentication: {}", err),
            HandlerError::Item(err) => write!(f, "item: {}", err),
            HandlerError::Lobby(err) => write!(f, "lobby: {}", err),
            HandlerError::Wire(err) => write!(f, "{}", err),
            HandlerError::Crypto(err) => write!(f, "crypto: {}", err),
            HandlerError::Unhandled { command } => {
                write!(f, "unhandled command {:04X}", command)
            }
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<WireError> for HandlerError {
    fn from(err: WireError) -> Self {
        HandlerError::Wire(err)
    }
}

impl From<LoginError> for HandlerError {
    fn from(err: LoginError) -> Self {
        HandlerError::Auth(err)
    }
}

impl From<ItemError> for HandlerError {
    fn from(err: ItemError) -> Self {
        HandlerError::Item(err)
    }
}

impl From<LobbyError> for HandlerError {
    fn from(err: LobbyError) -> Self {
        HandlerError::Lobby(err)
    }
}

impl From<CryptoError> for HandlerError {
    fn from(err: CryptoError) -> Self {
        HandlerError::Crypto(err)
    }
}

/// Resolves the handler for one (version, command) pair, or `None` when the
/// command has no server-side meaning and is silently ignored.
pub fn lookup(version: Version, command: u16) -> Option<HandlerFn> {
    if version == Version::Patch {
        return patch::lookup(command);
    }

    // Commands shared by every game dialect.
    let shared: Option<HandlerFn> = match command {
        0x05 => Some(lobby::on_client_exit),
        0x06 => Some(lobby::on_chat),
        0x08 => Some(lobby::on_game_list_request),
        0x09 => Some(lobby::on_menu_item_info_request),
        0x10 => Some(lobby::on_menu_selection),
        0x1D => Some(lobby::on_ping_reply),
        0x40 => Some(lobby::on_guild_card_search),
        0x60 => Some(game::on_broadcast_command),
        0x61 => Some(lobby::on_player_data),
        0x62 => Some(game::on_target_command),
        0x6C => Some(game::on_wide_broadcast_command),
        0x6D => Some(game::on_wide_target_command),
        0x6F => Some(lobby::on_done_loading),
        0x81 => Some(lobby::on_simple_mail),
        0x84 => Some(lobby::on_lobby_change),
        0x89 => Some(lobby::on_arrow_color),
        0x8A => Some(lobby::on_lobby_name_request),
        0x98 => Some(lobby::on_leave_game),
        0xA0 => Some(lobby::on_change_ship),
        0xA1 => Some(lobby::on_change_block),
        0xA2 => Some(lobby::on_quest_menu_request),
        0xAC => Some(lobby::on_quest_barrier),
        0xB1 => Some(lobby::on_time_request),
        0xC6 => Some(lobby::on_blocked_list_update),
        0xC7 => Some(lobby::on_auto_reply_enable),
        0xC8 => Some(lobby::on_auto_reply_disable),
        0xC9 => Some(game::on_target_command),
        0xCB => Some(game::on_wide_broadcast_command),
        0xD6 => Some(lobby::on_message_box_closed),
        0xD8 => Some(lobby::on_info_board_request),
        0xD9 => Some(lobby::on_info_board_write),
        _ => None,
    };
    if shared.is_some() {
        return shared;
    }

    match version {
        Version::Dc | Version::Pc | Version::Gc => match command {
            0x93 => Some(login::on_login_dc),
            0x9A => Some(login::on_license_check_gc),
            0x9C => Some(login::on_register_gc),
            0x9D => Some(login::on_login_dc_pc),
            0x9E => Some(login::on_login_gc),
            0xDB => Some(login::on_verify_license_gc),
            0xC1 | 0x0C | 0xEC => Some(lobby::on_create_game),
            _ => None,
        },
        Version::Bb => match command {
            0x93 => Some(bb::on_login_bb),
            0x00E0 => Some(bb::on_request_settings),
            0x00E3 => Some(bb::on_character_select),
            0x00E5 => Some(bb::on_create_character),
            0x01E8 => Some(bb::on_client_checksum),
            0x03E8 => Some(bb::on_guild_card_header_request),
            0x03DC => Some(bb::on_guild_card_chunk_request),
            0x04EB | 0x01EB => Some(bb::on_stream_file_index_request),
            0x03EB => Some(bb::on_stream_file_chunk_request),
            0x00E7 => Some(bb::on_full_player_upload),
            0x01ED | 0x02ED | 0x03ED | 0x04ED | 0x05ED | 0x06ED | 0x07ED => {
                Some(bb::on_options_update)
            }
            0xC1 => Some(lobby::on_create_game),
            _ => None,
        },
        Version::Patch => None,
    }
}

/// Entry point called by the transport for each decoded command.
pub fn process_command(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    ctx: &mut CommandCtx,
    command: u16,
    flag: u32,
    payload: &[u8],
) -> HandlerResult {
    match lookup(c.version, command) {
        Some(handler) => handler(s, c, ctx, flag, payload),
        None => {
            keel::logging::debug!(s.log, "ignoring command with no handler";
                                  "command" => command,
                                  "version" => c.version.name());
            Ok(())
        }
    }
}

/// Greets a fresh connection according to its port's behavior.
pub fn process_connect(s: &Arc<ServerState>, c: &Arc<Client>, ctx: &mut CommandCtx) {
    match c.behavior {
        Behavior::SplitReconnect => {
            crate::sends::send_server_init(s, c, ctx.crypt_in, true);
            let address = s.connect_address_for_client(c);
            let pc_port = port_for(s, "pc-login").unwrap_or(9300);
            let gc_port = port_for(s, "gc-us3").unwrap_or(9103);
            crate::sends::send_pc_gc_split_reconnect(c, address, pc_port, gc_port);
            c.request_disconnect();
        }
        Behavior::LoginServer | Behavior::DataServerBB | Behavior::PatchServer => {
            crate::sends::send_server_init(s, c, ctx.crypt_in, true);
        }
        Behavior::LobbyServer => {
            crate::sends::send_server_init(s, c, ctx.crypt_in, false);
        }
    }
}

/// Tears a departing client out of its lobby and notifies the remaining
/// members.
pub fn process_disconnect(s: &Arc<ServerState>, c: &Arc<Client>) {
    lobby::leave_current_lobby(s, c);

    // Blue Burst characters are server-authoritative; persist on the way
    // out.
    if c.version == Version::Bb {
        if let Some(license) = c.license() {
            if !license.bb_username.is_empty() {
                let index = c.bb_player_index.load(std::sync::atomic::Ordering::Acquire);
                let path = crate::player::player_filename(&license.bb_username, index);
                let player = c.player.read().unwrap();
                if let Err(err) = player.save_player(&path) {
                    keel::logging::warn!(s.log, "failed to save player";
                                         "path" => path,
                                         "error" => %err);
                }
            }
        }
    }
}

fn port_for(s: &ServerState, name: &str) -> Option<u16> {
    s.port_configuration.iter().find(|spec| spec.name == name).map(|spec| spec.port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_commands_resolve_for_every_game_version() {
        for &version in &[Version::Dc, Version::Pc, Version::Gc, Version::Bb] {
            assert!(lookup(version, 0x06).is_some());
            assert!(lookup(version, 0x60).is_some());
            assert!(lookup(version, 0x10).is_some());
        }
    }

    #[test]
    fn login_commands_are_version_gated() {
        assert!(lookup(Version::Gc, 0x9E).is_some());
        assert!(lookup(Version::Bb, 0x9E).is_none());
        assert!(lookup(Version::Bb, 0x00E0).is_some());
        assert!(lookup(Version::Gc, 0x00E0).is_none());
        assert!(lookup(Version::Patch, 0x06).is_none());
    }
}
