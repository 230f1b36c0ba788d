//! Non-Blue-Burst login flows. The 9x command family carries credentials in
//! fixed-width text fields; verification runs against the license store and
//! failures answer with a 9A reject code, leaving the disconnect decision to
//! the client's own state machine.

use super::{HandlerError, HandlerResult};
use crate::client::{Behavior, Client, ClientFlags};
use crate::license::LoginError;
use crate::sends;
use crate::state::ServerState;
use crate::wire::Reader;
use keel::logging;
use rigging::endpoint::CommandCtx;
use rigging::version::Version;
use std::sync::Arc;

/// Reject codes for the 9A reply. The values are fixed by the clients.
fn reject_code(err: LoginError) -> u32 {
    match err {
        LoginError::MissingLicense => 0x03,
        LoginError::IncorrectAccessKey => 0x04,
        LoginError::IncorrectPassword => 0x05,
        LoginError::Banned => 0x06,
        LoginError::NoUsername => 0x07,
    }
}

struct LoginBody {
    serial_text: String,
    access_key: String,
    password: String,
    name: String,
    sub_version: u8,
    security: Vec<u8>,
}

/// The common shape of the 93/9D/9E bodies: tag, guild card number, a
/// sub-version byte, then the credential text fields and (for 9E) the
/// echoed security blob.
fn parse_login_body(c: &Client, payload: &[u8], with_security: bool) -> Result<LoginBody, HandlerError> {
    let mut reader = Reader::new(payload);
    let _player_tag = reader.get_u32()?;
    let _guild_card_number = reader.get_u32()?;
    reader.skip(0x08)?;
    let sub_version = reader.get_u8()?;
    reader.skip(3)?;
    let serial_text = reader.get_ascii(0x10)?;
    let access_key = reader.get_ascii(0x10)?;
    let password = reader.get_ascii(0x10)?;
    let name = reader.get_text(0x10, c.version.uses_utf16())?;
    let security = if with_security && reader.remaining() > 0 {
        reader.get_bytes(reader.remaining().min(0x28))?.to_vec()
    } else {
        Vec::new()
    };
    Ok(LoginBody { serial_text, access_key, password, name, sub_version, security })
}

fn parse_serial(text: &str) -> Result<u32, HandlerError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(HandlerError::Auth(LoginError::MissingLicense));
    }
    u32::from_str_radix(trimmed, 16)
        .or_else(|_| trimmed.parse::<u32>())
        .map_err(|_| HandlerError::Protocol("unparseable serial number"))
}

fn verify(
    s: &ServerState,
    c: &Client,
    body: &LoginBody,
) -> Result<Arc<crate::license::License>, LoginError> {
    let serial = match parse_serial(&body.serial_text) {
        Ok(serial) => serial,
        Err(_) => return Err(LoginError::MissingLicense),
    };
    match c.version {
        Version::Dc => {
            if c.flags().contains(ClientFlags::IS_DC_V1) {
                s.license_store.verify_v1(serial, &body.access_key)
            } else {
                s.license_store.verify_v2(serial, &body.access_key)
            }
        }
        Version::Pc => s.license_store.verify_v2(serial, &body.access_key),
        Version::Gc => {
            let password =
                if body.password.is_empty() { None } else { Some(body.password.as_str()) };
            s.license_store.verify_gc(serial, &body.access_key, password)
        }
        _ => Err(LoginError::MissingLicense),
    }
}

/// Finishes a successful login: bind the license, restore or initialize the
/// client flags, refresh the security blob and route by port behavior.
fn complete_login(s: &Arc<ServerState>, c: &Arc<Client>, body: &LoginBody) {
    if body.security.is_empty() {
        c.set_flags(ClientFlags::defaults_for(c.version, body.sub_version));
    } else {
        c.import_security(&body.security);
    }

    if !body.name.is_empty() {
        let mut player = c.player.write().unwrap();
        player.disp.name = body.name.clone();
        player.disp.normalize_name();
    }

    sends::send_update_client_config(c);

    match c.behavior {
        Behavior::LoginServer => {
            sends::send_menu(c, &s.name, crate::menu::MENU_ID_MAIN, &s.main_menu, false);
        }
        Behavior::LobbyServer => {
            sends::send_lobby_list(c, s);
            sends::send_get_player_info(c);
        }
        _ => {}
    }
}

fn handle_login(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    payload: &[u8],
    with_security: bool,
) -> HandlerResult {
    let body = parse_login_body(c, payload, with_security)?;
    match verify(s, c, &body) {
        Ok(license) => {
            logging::info!(s.log, "client logged in";
                           "serial" => license.serial_number,
                           "version" => c.version.name());
            c.set_license(license);
            complete_login(s, c, &body);
            Ok(())
        }
        Err(err) => {
            logging::info!(s.log, "login refused";
                           "error" => %err,
                           "version" => c.version.name());
            sends::send_command(c, 0x9A, reject_code(err), &[]);
            Ok(())
        }
    }
}

/// 93: the Dreamcast login.
pub fn on_login_dc(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    handle_login(s, c, payload, false)
}

/// 9D: the DC v2 / PC login.
pub fn on_login_dc_pc(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    handle_login(s, c, payload, true)
}

/// 9E: the GC session login, carrying the echoed security blob.
pub fn on_login_gc(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    handle_login(s, c, payload, true)
}

/// 9A: a bare license check before the real login. Replies with 9A carrying
/// either the ok code or a reject code.
pub fn on_license_check_gc(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    let serial_text = reader.get_ascii(0x10)?;
    let access_key = reader.get_ascii(0x10)?;

    let result = parse_serial(&serial_text)
        .and_then(|serial| s.license_store.verify_gc(serial, &access_key, None).map_err(Into::into));
    match result {
        Ok(_) => sends::send_command(c, 0x9A, 0x02, &[]),
        Err(HandlerError::Auth(err)) => sends::send_command(c, 0x9A, reject_code(err), &[]),
        Err(err) => return Err(err),
    }
    Ok(())
}

/// 9C: the registration step. The reply flag is 1 when the credentials are
/// usable, 0 when the client should go register.
pub fn on_register_gc(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    reader.skip(0x08)?;
    let serial_text = reader.get_ascii(0x10)?;
    let access_key = reader.get_ascii(0x10)?;
    let password = reader.get_ascii(0x10)?;

    let password = if password.is_empty() { None } else { Some(password) };
    let verified = parse_serial(&serial_text).ok().and_then(|serial| {
        s.license_store.verify_gc(serial, &access_key, password.as_deref()).ok()
    });
    sends::send_command(c, 0x9C, if verified.is_some() { 0x01 } else { 0x00 }, &[]);
    Ok(())
}

/// DB: the GC pre-login license verification.
pub fn on_verify_license_gc(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    payload: &[u8],
) -> HandlerResult {
    let mut reader = Reader::new(payload);
    reader.skip(0x20)?;
    let serial_text = reader.get_ascii(0x10)?;
    let access_key = reader.get_ascii(0x10)?;
    reader.skip(0x08)?;
    let password = reader.get_ascii(0x10).unwrap_or_default();

    let password = if password.is_empty() { None } else { Some(password) };
    let result = parse_serial(&serial_text).and_then(|serial| {
        s.license_store
            .verify_gc(serial, &access_key, password.as_deref())
            .map_err(Into::into)
    });
    match result {
        Ok(_) => sends::send_command(c, 0x9C, 0x01, &[]),
        Err(HandlerError::Auth(err)) => {
            sends::send_command(c, 0x9A, reject_code(err), &[]);
        }
        Err(err) => return Err(err),
    }
    Ok(())
}
