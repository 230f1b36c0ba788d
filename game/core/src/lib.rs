#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod addresses;
pub mod chat;
pub mod client;
pub mod data;
pub mod dispatch;
pub mod handlers;
pub mod items;
pub mod license;
pub mod lobby;
pub mod menu;
pub mod player;
pub mod proxy;
pub mod quest;
pub mod sends;
pub mod state;
pub mod wire;
