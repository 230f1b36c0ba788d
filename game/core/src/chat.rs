//! Chat commands: any chat line beginning with `$` is parsed here instead
//! of being relayed. Every command runs its precondition guards first; a
//! failed guard produces exactly one red-tinted message to the caller and
//! touches nothing else.

use crate::client::Client;
use crate::handlers::{HandlerError, HandlerResult};
use crate::items::InventoryItem;
use crate::license::Privilege;
use crate::lobby::{Lobby, LobbyFlags};
use crate::sends;
use crate::state::ServerState;
use hashbrown::HashMap;
use keel::logging;
use keel::text;
use keel::time::timestamp_usecs;
use lazy_static::lazy_static;
use rigging::version::Version;
use std::sync::Arc;

type ChatHandler = fn(&Arc<ServerState>, Option<&Arc<Lobby>>, &Arc<Client>, &str) -> HandlerResult;

struct ChatCommandDefinition {
    handler: ChatHandler,
    usage: &'static str,
}

lazy_static! {
    static ref SECTION_ID_NAMES: Vec<&'static str> = vec![
        "Viridia", "Greennill", "Skyly", "Bluefull", "Purplenum", "Pinkal", "Redria",
        "Oran", "Yellowboze", "Whitill",
    ];

    static ref NAME_TO_SECTION_ID: HashMap<&'static str, u8> = {
        let mut map = HashMap::new();
        for &(name, id) in &[
            ("viridia", 0u8), ("greennill", 1), ("skyly", 2), ("bluefull", 3),
            ("purplenum", 4), ("pinkal", 5), ("redria", 6), ("oran", 7),
            ("yellowboze", 8), ("whitill", 9),
        ] {
            map.insert(name, id);
        }
        map
    };

    static ref NAME_TO_EVENT: HashMap<&'static str, u8> = {
        let mut map = HashMap::new();
        for &(name, value) in &[
            ("none", 0u8), ("xmas", 1), ("val", 3), ("easter", 4), ("hallo", 5),
            ("sonic", 6), ("newyear", 7), ("summer", 8), ("white", 9), ("wedding", 10),
            ("fall", 11), ("s-spring", 12), ("s-summer", 13), ("spring", 14),
        ] {
            map.insert(name, value);
        }
        map
    };

    static ref NAME_TO_LOBBY_TYPE: HashMap<&'static str, u8> = {
        let mut map = HashMap::new();
        for &(name, value) in &[
            ("normal", 0x00u8), ("inormal", 0x0F), ("ipc", 0x10), ("iball", 0x11),
            ("cave1", 0xD4), ("cave2u", 0x67), ("dragon", 0xFC), ("derolle", 0xFD),
            ("volopt", 0xFE), ("darkfalz", 0xFF), ("planet", 0xE9), ("clouds", 0xEA),
            ("cave", 0xED), ("jungle", 0xEE), ("forest2-2", 0xEF), ("forest2-1", 0xF0),
            ("windpower", 0xF1), ("overview", 0xF2), ("seaside", 0xF3), ("dmorgue", 0xF5),
            ("caelum", 0xF6), ("digital", 0xF8), ("boss1", 0xF9), ("boss2", 0xFA),
            ("boss3", 0xFB),
        ] {
            map.insert(name, value);
        }
        map
    };

    static ref NAME_TO_TECH_ID: HashMap<&'static str, u8> = {
        let mut map = HashMap::new();
        for (id, name) in [
            "foie", "gifoie", "rafoie", "barta", "gibarta", "rabarta", "zonde",
            "gizonde", "razonde", "grants", "deband", "jellen", "zalure", "shifta",
            "ryuker", "resta", "anti", "reverser", "megid",
        ]
        .iter()
        .enumerate()
        {
            map.insert(*name, id as u8);
        }
        map
    };

    static ref NAME_TO_NPC_ID: HashMap<&'static str, u8> = {
        let mut map = HashMap::new();
        for (id, name) in
            ["ninja", "rico", "sonic", "knuckles", "tails", "flowen", "elly"].iter().enumerate()
        {
            map.insert(*name, id as u8);
        }
        map
    };

    static ref CHAT_COMMANDS: HashMap<&'static str, ChatCommandDefinition> = {
        let mut map: HashMap<&'static str, ChatCommandDefinition> = HashMap::new();
        let mut add = |name: &'static str, handler: ChatHandler, usage: &'static str| {
            map.insert(name, ChatCommandDefinition { handler, usage });
        };
        add("allevent", command_lobby_event_all, "usage:\nallevent <name/ID>");
        add("ann", command_announce, "usage:\nann <message>");
        add("arrow", command_arrow, "usage:\narrow <color>");
        add("ax", command_ax, "usage:\nax <message>");
        add("ban", command_ban, "usage:\nban <duration> <name>");
        add("bbchar", command_convert_char_to_bb, "usage:\nbbchar <user> <pass> <1-4>");
        add("changebank", command_change_bank, "usage:\nchangebank <bank name>");
        add("cheat", command_cheat, "usage:\nduh");
        add("edit", command_edit, "usage:\nedit <stat> <value>");
        add("event", command_lobby_event, "usage:\nevent <name>");
        add("infhp", command_infinite_hp, "usage:\nduh");
        add("inftp", command_infinite_tp, "usage:\nduh");
        add("item", command_item, "usage:\nitem <item-code>");
        add("kick", command_kick, "usage:\nkick <name-or-number>");
        add("li", command_lobby_info, "usage:\nli");
        add("password", command_password, "usage:\nlock [password]\nomit password to\nunlock game");
        add("maxlevel", command_max_level, "usage:\nmax_level <level>");
        add("minlevel", command_min_level, "usage:\nmin_level <level>");
        add("silence", command_silence, "usage:\nsilence <name-or-number>");
        add("type", command_lobby_type, "usage:\ntype <name>");
        add("warp", command_warp, "usage:\nwarp <area-number>");
        map
    };
}

////////////////////////////////////////////////////////////////////////////////
// guards

fn precondition(message: &str) -> HandlerError {
    HandlerError::Precondition(message.to_string())
}

fn check_privileges(c: &Client, mask: Privilege) -> HandlerResult {
    let license = c.license().ok_or_else(|| precondition("$C6You are not\nlogged in."))?;
    if !license.has_privileges(mask) {
        return Err(precondition(
            "$C6You do not have\npermission to\nrun this command.",
        ));
    }
    Ok(())
}

fn check_version(c: &Client, version: Version) -> HandlerResult {
    if c.version != version {
        return Err(precondition(
            "$C6This command cannot\nbe used for your\nversion of PSO.",
        ));
    }
    Ok(())
}

fn check_not_version(c: &Client, version: Version) -> HandlerResult {
    if c.version == version {
        return Err(precondition(
            "$C6This command cannot\nbe used for your\nversion of PSO.",
        ));
    }
    Ok(())
}

fn check_is_game<'a>(l: Option<&'a Arc<Lobby>>, want_game: bool) -> Result<&'a Arc<Lobby>, HandlerError> {
    let lobby = l.ok_or_else(|| {
        precondition(if want_game {
            "$C6This command cannot\nbe used in lobbies."
        } else {
            "$C6This command cannot\nbe used in games."
        })
    })?;
    if lobby.is_game() != want_game {
        return Err(precondition(if want_game {
            "$C6This command cannot\nbe used in lobbies."
        } else {
            "$C6This command cannot\nbe used in games."
        }));
    }
    Ok(lobby)
}

fn check_cheats_enabled(l: &Lobby) -> HandlerResult {
    if !l.flags().contains(LobbyFlags::CHEATS_ENABLED) {
        return Err(precondition(
            "$C6This command can\nonly be used in\ncheat mode.",
        ));
    }
    Ok(())
}

fn check_is_leader(l: &Lobby, c: &Client) -> HandlerResult {
    if l.read().leader_id != c.lobby_client_id() {
        return Err(precondition(
            "$C6This command can\nonly be used by\nthe game leader.",
        ));
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// message commands

fn command_lobby_info(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    _args: &str,
) -> HandlerResult {
    match l {
        None => sends::send_text_message(c, "$C6No lobby information"),
        Some(lobby) if lobby.is_game() => {
            let state = lobby.read();
            let level_text = if state.max_level == 0xFFFF_FFFF {
                format!("Levels: {}+", state.min_level + 1)
            } else {
                format!("Levels: {}-{}", state.min_level + 1, state.max_level + 1)
            };
            let info = format!(
                "$C6Game ID: {:08X}\n{}\nSection ID: {}\nCheat mode: {}",
                lobby.lobby_id,
                level_text,
                SECTION_ID_NAMES
                    .get(state.section_id as usize)
                    .copied()
                    .unwrap_or("unknown"),
                if state.flags.contains(LobbyFlags::CHEATS_ENABLED) { "on" } else { "off" }
            );
            drop(state);
            sends::send_text_message(c, &info);
        }
        Some(lobby) => {
            let info = format!(
                "$C6Lobby ID: {:08X}\nPlayers: {}/{}",
                lobby.lobby_id,
                lobby.count_clients(),
                lobby.read().max_clients
            );
            sends::send_text_message(c, &info);
        }
    }
    Ok(())
}

fn command_ax(
    s: &Arc<ServerState>,
    _l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    check_privileges(c, Privilege::ANNOUNCE)?;
    logging::info!(s.log, "operator message"; "serial" => c.serial_number(), "text" => args);
    Ok(())
}

fn command_announce(
    s: &Arc<ServerState>,
    _l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    check_privileges(c, Privilege::ANNOUNCE)?;
    sends::send_text_message_server(s, args);
    Ok(())
}

fn command_arrow(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    let color = args.trim().parse::<u32>().unwrap_or(0);
    c.lobby_arrow_color.store(color, std::sync::atomic::Ordering::Release);
    if let Some(lobby) = l {
        if !lobby.is_game() {
            sends::send_arrow_update(lobby);
        }
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// lobby commands

fn command_cheat(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    _args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, true)?;
    check_is_leader(lobby, c)?;

    let cheats_now_enabled;
    {
        let mut state = lobby.write();
        state.flags.toggle(LobbyFlags::CHEATS_ENABLED);
        cheats_now_enabled = state.flags.contains(LobbyFlags::CHEATS_ENABLED);

        if !cheats_now_enabled {
            for member in state.occupied_clients() {
                member.infinite_hp.store(false, std::sync::atomic::Ordering::Release);
                member.infinite_tp.store(false, std::sync::atomic::Ordering::Release);
            }
            state.next_drop_item = None;
        }
    }
    sends::send_text_message_lobby(
        lobby,
        &format!("Cheat mode {}", if cheats_now_enabled { "enabled" } else { "disabled" }),
    );
    Ok(())
}

fn command_lobby_event(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, false)?;
    check_privileges(c, Privilege::CHANGE_EVENT)?;

    let event = match NAME_TO_EVENT.get(args.trim()) {
        Some(event) => *event,
        None => {
            sends::send_text_message(c, "$C6No such lobby event.");
            return Ok(());
        }
    };

    lobby.write().event = event;
    sends::send_to_lobby(lobby, 0xDA, u32::from(event), &[], None);
    Ok(())
}

fn command_lobby_event_all(
    s: &Arc<ServerState>,
    _l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    check_privileges(c, Privilege::CHANGE_EVENT)?;

    let event = match NAME_TO_EVENT.get(args.trim()) {
        Some(event) => *event,
        None => {
            sends::send_text_message(c, "$C6No such lobby event.");
            return Ok(());
        }
    };

    for lobby in s.all_lobbies() {
        let is_default_lobby = {
            let state = lobby.read();
            !state.flags.contains(LobbyFlags::IS_GAME) && state.flags.contains(LobbyFlags::DEFAULT)
        };
        if !is_default_lobby {
            continue;
        }
        lobby.write().event = event;
        sends::send_to_lobby(&lobby, 0xDA, u32::from(event), &[], None);
    }
    Ok(())
}

fn command_lobby_type(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, false)?;
    check_privileges(c, Privilege::CHANGE_EVENT)?;

    let new_type = match NAME_TO_LOBBY_TYPE.get(args.trim()) {
        Some(value) => *value,
        None => {
            sends::send_text_message(c, "$C6No such lobby type.");
            return Ok(());
        }
    };

    {
        let mut state = lobby.write();
        state.lobby_type = new_type;
        let floor = if state.flags.contains(LobbyFlags::EPISODE_3) { 20 } else { 15 };
        if state.lobby_type < floor {
            state.lobby_type = state.block.wrapping_sub(1);
        }
    }

    let members: Vec<Arc<Client>> = lobby.read().occupied_clients().cloned().collect();
    for member in members {
        sends::send_join_lobby(&member, lobby);
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// game commands

fn command_password(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, true)?;
    check_is_leader(lobby, c)?;

    if args.trim().is_empty() {
        lobby.write().password.clear();
        sends::send_text_message_lobby(lobby, "$C6Game unlocked");
    } else {
        let password: String = args.trim().chars().take(0x0F).collect();
        lobby.write().password = password.clone();
        sends::send_text_message_lobby(lobby, &format!("$C6Game password:\n{}", password));
    }
    Ok(())
}

fn command_min_level(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, true)?;
    check_is_leader(lobby, c)?;

    let level: u32 = match args.trim().parse() {
        Ok(level) if level >= 1 => level,
        _ => {
            sends::send_text_message(c, "$C6Invalid level.");
            return Ok(());
        }
    };
    lobby.write().min_level = level - 1;
    sends::send_text_message_lobby(lobby, &format!("$C6Minimum level set to {}", level));
    Ok(())
}

fn command_max_level(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, true)?;
    check_is_leader(lobby, c)?;

    let level: u32 = match args.trim().parse() {
        Ok(level) if level >= 1 => level,
        _ => {
            sends::send_text_message(c, "$C6Invalid level.");
            return Ok(());
        }
    };
    let mut state = lobby.write();
    state.max_level = if level >= 200 { 0xFFFF_FFFF } else { level - 1 };
    let unlimited = state.max_level == 0xFFFF_FFFF;
    drop(state);

    if unlimited {
        sends::send_text_message_lobby(lobby, "$C6Maximum level set to unlimited");
    } else {
        sends::send_text_message_lobby(lobby, &format!("$C6Maximum level set to {}", level));
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// character commands

fn command_edit(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, false)?;
    check_version(c, Version::Bb)?;

    let tokens: Vec<&str> = args.split_whitespace().collect();
    if tokens.len() < 2 {
        sends::send_text_message(c, "$C6Not enough arguments");
        return Ok(());
    }

    {
        let mut player = c.player.write().unwrap();
        let stat = tokens[0];
        let value = tokens[1];
        let parse_u16 = || value.parse::<u16>().unwrap_or(0);
        let parse_u32 = || value.parse::<u32>().unwrap_or(0);
        match stat {
            "atp" => player.disp.stats.atp = parse_u16(),
            "mst" => player.disp.stats.mst = parse_u16(),
            "evp" => player.disp.stats.evp = parse_u16(),
            "hp" => player.disp.stats.hp = parse_u16(),
            "dfp" => player.disp.stats.dfp = parse_u16(),
            "ata" => player.disp.stats.ata = parse_u16(),
            "lck" => player.disp.stats.lck = parse_u16(),
            "meseta" => player.disp.meseta = parse_u32(),
            "exp" => player.disp.experience = parse_u32(),
            "level" => player.disp.level = parse_u32().saturating_sub(1),
            "namecolor" => {
                player.disp.name_color = u32::from_str_radix(value, 16).unwrap_or(0xFFFF_FFFF)
            }
            "secid" => match NAME_TO_SECTION_ID.get(value.to_lowercase().as_str()) {
                Some(id) => player.disp.section_id = *id,
                None => {
                    drop(player);
                    sends::send_text_message(c, "$C6No such section ID.");
                    return Ok(());
                }
            },
            "name" => {
                player.disp.name = value.to_string();
                player.disp.normalize_name();
            }
            "npc" => {
                if value == "none" {
                    player.disp.extra_model = 0;
                    player.disp.v2_flags &= 0xFD;
                } else {
                    match NAME_TO_NPC_ID.get(value) {
                        Some(id) => {
                            player.disp.extra_model = *id;
                            player.disp.v2_flags |= 0x02;
                        }
                        None => {
                            drop(player);
                            sends::send_text_message(c, "$C6No such NPC.");
                            return Ok(());
                        }
                    }
                }
            }
            "tech" if tokens.len() > 2 => {
                let level = tokens[2].parse::<u8>().unwrap_or(1).saturating_sub(1);
                if value == "all" {
                    for slot in player.disp.technique_levels.iter_mut() {
                        *slot = level;
                    }
                } else {
                    match NAME_TO_TECH_ID.get(value) {
                        Some(id) => player.disp.technique_levels[*id as usize] = level,
                        None => {
                            drop(player);
                            sends::send_text_message(c, "$C6No such technique.");
                            return Ok(());
                        }
                    }
                }
            }
            _ => {
                drop(player);
                sends::send_text_message(c, "$C6Unknown field.");
                return Ok(());
            }
        }
    }

    // Re-emit the edited character into the lobby so everyone re-renders it.
    sends::send_player_leave_notification(lobby, c.lobby_client_id());
    sends::send_complete_player_bb(c);
    let members: Vec<Arc<Client>> = lobby.read().occupied_clients().cloned().collect();
    for member in members {
        sends::send_player_join_notification(&member, lobby, c);
    }
    Ok(())
}

fn command_change_bank(
    _s: &Arc<ServerState>,
    _l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    _args: &str,
) -> HandlerResult {
    check_version(c, Version::Bb)?;
    // The named-bank path never shipped; recognize the command and say so.
    sends::send_text_message(c, "$C6Named banks are\nnot available.");
    Ok(())
}

fn command_convert_char_to_bb(
    s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    check_is_game(l, false)?;
    check_not_version(c, Version::Bb)?;

    let tokens: Vec<&str> = args.split_whitespace().collect();
    if tokens.len() != 3 {
        sends::send_text_message(c, "$C6Incorrect argument count");
        return Ok(());
    }

    let player_index = match tokens[2].parse::<u8>() {
        Ok(index) if (1..=4).contains(&index) => index - 1,
        _ => {
            sends::send_text_message(c, "$C6Player index must be 1-4");
            return Ok(());
        }
    };

    if let Err(err) = s.license_store.verify_bb(tokens[0], tokens[1]) {
        sends::send_text_message(c, &format!("$C6Login failed: {}", err));
        return Ok(());
    }

    *c.pending_bb_conversion.lock().unwrap() = Some((tokens[0].to_string(), player_index));
    // The 61 handler finishes the conversion when the data arrives.
    sends::send_get_player_info(c);
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// administration commands

fn find_target(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    name: &str,
) -> Result<Option<Arc<Client>>, HandlerError> {
    match s.find_client(Some(name), 0) {
        Ok(target) => Ok(Some(target)),
        Err(_) => {
            sends::send_text_message(c, "$C6Client not found");
            Ok(None)
        }
    }
}

fn command_silence(
    s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    check_privileges(c, Privilege::SILENCE_USER)?;

    let target = match find_target(s, c, args.trim())? {
        Some(target) => target,
        None => return Ok(()),
    };
    let target_license = match target.license() {
        Some(license) => license,
        None => {
            sends::send_text_message(c, "$C6Client not logged in");
            return Ok(());
        }
    };
    if target_license.has_privileges(Privilege::MODERATOR) {
        sends::send_text_message(c, "$C6You do not have\nsufficient privileges.");
        return Ok(());
    }

    let could_chat_before = target.can_chat.fetch_xor(true, std::sync::atomic::Ordering::AcqRel);
    let name = target.player.read().unwrap().disp.name.clone();
    if let Some(lobby) = l {
        sends::send_text_message_lobby(
            lobby,
            &format!(
                "$C6{} {}silenced",
                text::remove_language_marker(&name),
                if could_chat_before { "" } else { "un" }
            ),
        );
    }
    Ok(())
}

fn command_kick(
    s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    check_privileges(c, Privilege::KICK_USER)?;

    let target = match find_target(s, c, args.trim())? {
        Some(target) => target,
        None => return Ok(()),
    };
    let target_license = match target.license() {
        Some(license) => license,
        None => {
            sends::send_text_message(c, "$C6Client not logged in");
            return Ok(());
        }
    };
    if target_license.has_privileges(Privilege::MODERATOR) {
        sends::send_text_message(c, "$C6You do not have\nsufficient privileges.");
        return Ok(());
    }

    sends::send_message_box(&target, "$C6You were kicked off by a moderator.");
    target.request_disconnect();
    let name = target.player.read().unwrap().disp.name.clone();
    if let Some(lobby) = l {
        sends::send_text_message_lobby(
            lobby,
            &format!("$C6{} kicked off", text::remove_language_marker(&name)),
        );
    }
    Ok(())
}

fn parse_ban_duration(args: &str) -> Option<u64> {
    let digits: String = args.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    let quantity: u64 = digits.parse().ok()?;
    let mut usecs = quantity * 1_000_000;
    usecs *= match args[digits.len()..].chars().next() {
        Some('m') => 60,
        Some('h') => 60 * 60,
        Some('d') => 60 * 60 * 24,
        Some('w') => 60 * 60 * 24 * 7,
        Some('M') => 60 * 60 * 24 * 30,
        Some('y') => 60 * 60 * 24 * 365,
        _ => 1,
    };
    Some(usecs)
}

fn command_ban(
    s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    check_privileges(c, Privilege::BAN_USER)?;

    let args = args.trim();
    let space = match args.find(' ') {
        Some(space) => space,
        None => {
            sends::send_text_message(c, "$C6Incorrect argument count");
            return Ok(());
        }
    };
    let (duration_text, name) = args.split_at(space);
    let name = name.trim();

    let target = match find_target(s, c, name)? {
        Some(target) => target,
        None => return Ok(()),
    };
    let target_license = match target.license() {
        Some(license) => license,
        None => {
            sends::send_text_message(c, "$C6Client not logged in");
            return Ok(());
        }
    };
    if target_license.has_privileges(Privilege::BAN_USER) {
        sends::send_text_message(c, "$C6You do not have\nsufficient privileges.");
        return Ok(());
    }

    let duration = match parse_ban_duration(duration_text) {
        Some(duration) => duration,
        None => {
            sends::send_text_message(c, "$C6Invalid duration");
            return Ok(());
        }
    };

    let _ = s.license_store.ban_until(target_license.serial_number, timestamp_usecs() + duration);
    sends::send_message_box(&target, "$C6You were banned by a moderator.");
    target.request_disconnect();
    let target_name = target.player.read().unwrap().disp.name.clone();
    if let Some(lobby) = l {
        sends::send_text_message_lobby(
            lobby,
            &format!("$C6{} banned", text::remove_language_marker(&target_name)),
        );
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// cheat commands

fn command_warp(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, true)?;
    check_cheats_enabled(lobby)?;

    let area: u32 = match args.trim().parse() {
        Ok(area) => area,
        Err(_) => {
            sends::send_text_message(c, "$C6Invalid area number.");
            return Ok(());
        }
    };

    let episode = lobby.read().episode;
    if episode == 0 || episode > 3 {
        return Ok(());
    }
    if c.area.load(std::sync::atomic::Ordering::Acquire) == area {
        return Ok(());
    }
    let limit = if episode == 3 { 10 } else { 17 };
    if area > limit {
        sends::send_text_message(c, &format!("$C6Area numbers must be\n{} or less.", limit));
        return Ok(());
    }

    sends::send_warp(c, area);
    Ok(())
}

fn command_infinite_hp(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    _args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, true)?;
    check_cheats_enabled(lobby)?;

    let previously = c.infinite_hp.fetch_xor(true, std::sync::atomic::Ordering::AcqRel);
    sends::send_text_message(
        c,
        &format!("$C6Infinite HP {}", if previously { "disabled" } else { "enabled" }),
    );
    Ok(())
}

fn command_infinite_tp(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    _args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, true)?;
    check_cheats_enabled(lobby)?;

    let previously = c.infinite_tp.fetch_xor(true, std::sync::atomic::Ordering::AcqRel);
    sends::send_text_message(
        c,
        &format!("$C6Infinite TP {}", if previously { "disabled" } else { "enabled" }),
    );
    Ok(())
}

/// Parses a hex byte string (whitespace allowed) into item bytes.
fn parse_data_string(args: &str) -> Option<Vec<u8>> {
    let cleaned: String = args.chars().filter(|ch| !ch.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return None;
    }
    let mut data = Vec::with_capacity(cleaned.len() / 2);
    for pair in cleaned.as_bytes().chunks_exact(2) {
        let text = std::str::from_utf8(pair).ok()?;
        data.push(u8::from_str_radix(text, 16).ok()?);
    }
    Some(data)
}

fn command_item(
    _s: &Arc<ServerState>,
    l: Option<&Arc<Lobby>>,
    c: &Arc<Client>,
    args: &str,
) -> HandlerResult {
    let lobby = check_is_game(l, true)?;
    check_cheats_enabled(lobby)?;

    let data = match parse_data_string(args) {
        Some(data) => data,
        None => {
            sends::send_text_message(c, "$C6Invalid item code.");
            return Ok(());
        }
    };
    if data.len() < 2 {
        sends::send_text_message(c, "$C6Item codes must be\n2 bytes or more.");
        return Ok(());
    }
    if data.len() > 16 {
        sends::send_text_message(c, "$C6Item codes must be\n16 bytes or fewer.");
        return Ok(());
    }

    let mut item = InventoryItem::default();
    let data1_len = data.len().min(12);
    item.data.data1[..data1_len].copy_from_slice(&data[..data1_len]);
    if data.len() > 12 {
        let rest = data.len() - 12;
        item.data.data2[..rest].copy_from_slice(&data[12..]);
    }
    lobby.write().next_drop_item = Some(item);

    sends::send_text_message(c, "$C6Next drop chosen.");
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// entry point

/// Runs one chat command. The `$` has already been sighted by the chat
/// handler; everything after it is the command name and arguments.
pub fn process_chat_command(s: &Arc<ServerState>, c: &Arc<Client>, chat_text: &str) {
    let body = chat_text.strip_prefix('$').unwrap_or(chat_text);
    let (name, args) = match body.find(' ') {
        Some(space) => (&body[..space], body[space + 1..].trim_start()),
        None => (body, ""),
    };

    let definition = match CHAT_COMMANDS.get(name) {
        Some(definition) => definition,
        None => {
            sends::send_text_message(c, "$C6Unknown command.");
            return;
        }
    };

    let lobby = s.client_lobby(c);
    match (definition.handler)(s, lobby.as_ref(), c, args) {
        Ok(()) => {}
        Err(HandlerError::Precondition(message)) => {
            sends::send_text_message(c, &message);
        }
        Err(err) => {
            sends::send_text_message(c, &format!("$C6Failed:\n{}", err));
        }
    }
}

/// The usage string for a command, shown by operator tooling.
pub fn usage_for(command: &str) -> Option<&'static str> {
    CHAT_COMMANDS.get(command).map(|definition| definition.usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Behavior;
    use crate::license::{License, LicenseStore};
    use rigging::channel::Conduit;
    use rigging::frame::Header;

    fn test_setup() -> (Arc<ServerState>, Arc<Client>) {
        let store = Arc::new(LicenseStore::ephemeral());
        let state = Arc::new(ServerState::new(
            "Pioneer".into(),
            store,
            &logging::discard(),
        ));
        state.create_default_lobbies();

        let client = Arc::new(Client::new(
            Version::Gc,
            Behavior::LobbyServer,
            0,
            Arc::new(Conduit::detached(Version::Gc)),
            "127.0.0.1:9421".parse().unwrap(),
            "127.0.0.1:50001".parse().unwrap(),
        ));
        (state, client)
    }

    fn logged_in(c: &Arc<Client>, s: &ServerState, privileges: Privilege) {
        let license = License {
            serial_number: 777,
            access_key: "abcdefghijkl".into(),
            privileges: privileges.bits(),
            ..License::default()
        };
        s.license_store.add(license.clone());
        c.set_license(Arc::new(license));
    }

    fn drained_text_messages(c: &Client) -> Vec<(u16, Vec<u8>)> {
        let mut data = c.conduit.take_pending();
        let mut out = Vec::new();
        while !data.is_empty() {
            let header = Header::parse(c.version, &data);
            let aligned = rigging::frame::aligned_size(c.version, header.size as usize);
            out.push((header.command, data[4..header.size as usize].to_vec()));
            data.drain(..aligned);
        }
        out
    }

    fn put_in_game(s: &ServerState, c: &Arc<Client>, cheats: bool) -> Arc<Lobby> {
        let game = Arc::new(Lobby::new_game(
            s.allocate_game_id(),
            Version::Gc,
            "test game".into(),
            String::new(),
        ));
        if cheats {
            game.write().flags |= LobbyFlags::CHEATS_ENABLED;
        }
        game.write().episode = 1;
        s.add_lobby(game.clone());
        game.add_client(c).unwrap();
        game
    }

    #[test]
    fn unauthorized_kick_sends_exactly_one_red_message() {
        let (s, c) = test_setup();
        logged_in(&c, &s, Privilege::empty());
        s.find_lobby(1).unwrap().add_client(&c).unwrap();
        c.conduit.take_pending();

        process_chat_command(&s, &c, "$kick other");

        let messages = drained_text_messages(&c);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 0xB0);
        // The body is the 8-byte text header then "\tC6You do not have...".
        let text_bytes = &messages[0].1[8..];
        assert!(text_bytes.starts_with(b"\tC6You do not have"));
    }

    #[test]
    fn failed_preconditions_do_not_mutate_state() {
        let (s, c) = test_setup();
        logged_in(&c, &s, Privilege::empty());
        let game = put_in_game(&s, &c, false);

        // Not the leader, cheats off, no privileges: every one of these must
        // bounce without changing anything.
        let flags_before = game.flags();
        process_chat_command(&s, &c, "$item 00030000");
        process_chat_command(&s, &c, "$ann hello everyone");
        process_chat_command(&s, &c, "$warp 5");

        assert_eq!(game.flags(), flags_before);
        assert!(game.read().next_drop_item.is_none());
        assert!(!c.infinite_hp.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn item_command_seeds_the_next_drop() {
        let (s, c) = test_setup();
        logged_in(&c, &s, Privilege::empty());
        let game = put_in_game(&s, &c, true);
        c.conduit.take_pending();

        process_chat_command(&s, &c, "$item 00030000");

        let state = game.read();
        let chosen = state.next_drop_item.expect("next drop must be set");
        assert_eq!(&chosen.data.data1[..4], &[0x00, 0x03, 0x00, 0x00]);
        drop(state);

        let messages = drained_text_messages(&c);
        assert_eq!(messages.len(), 1);
        let text_bytes = &messages[0].1[8..];
        assert!(text_bytes.starts_with(b"\tC6Next drop chosen."));
    }

    #[test]
    fn cheat_toggle_is_leader_only_and_clears_cheat_state() {
        let (s, c) = test_setup();
        logged_in(&c, &s, Privilege::empty());
        let game = put_in_game(&s, &c, true);

        // The only member is the leader, so the toggle works.
        c.infinite_hp.store(true, std::sync::atomic::Ordering::Release);
        game.write().next_drop_item = Some(InventoryItem::default());

        process_chat_command(&s, &c, "$cheat");
        assert!(!game.flags().contains(LobbyFlags::CHEATS_ENABLED));
        assert!(!c.infinite_hp.load(std::sync::atomic::Ordering::Acquire));
        assert!(game.read().next_drop_item.is_none());
    }

    #[test]
    fn unknown_commands_answer_with_a_message() {
        let (s, c) = test_setup();
        logged_in(&c, &s, Privilege::empty());
        s.find_lobby(1).unwrap().add_client(&c).unwrap();
        c.conduit.take_pending();

        process_chat_command(&s, &c, "$frobnicate");
        let messages = drained_text_messages(&c);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1[8..].starts_with(b"\tC6Unknown command."));
    }
}
