//! The patch server speaks its own tiny dialect. This build serves an
//! intentionally empty patch session: greet, accept the login, wave the
//! client through.

use super::{HandlerFn, HandlerResult};
use crate::client::Client;
use crate::sends;
use crate::state::ServerState;
use rigging::endpoint::CommandCtx;
use std::sync::Arc;

pub fn lookup(command: u16) -> Option<HandlerFn> {
    match command {
        0x02 => Some(on_welcome_ack),
        0x04 => Some(on_login),
        _ => None,
    }
}

/// 02: the client acknowledged the encryption handshake; ask it to log in.
fn on_welcome_ack(
    _s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    sends::send_command(c, 0x04, 0x00, &[]);
    Ok(())
}

/// 04: credentials arrive. There is nothing to patch, so the session ends
/// immediately after the welcome text.
fn on_login(
    s: &Arc<ServerState>,
    c: &Arc<Client>,
    _ctx: &mut CommandCtx,
    _flag: u32,
    _payload: &[u8],
) -> HandlerResult {
    if !s.name.is_empty() {
        sends::send_message_box(c, &format!("Welcome to {}", s.name));
    }
    sends::send_patch_enter_directory(c, ".");
    sends::send_patch_done(c);
    Ok(())
}
