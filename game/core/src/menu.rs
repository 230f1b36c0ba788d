//! Menu identifiers and entries. Menu ids are echoed back by the client in
//! its 10 (selection) commands, so they must be stable.

use bitflags::bitflags;

pub const MENU_ID_MAIN: u32 = 0x0000_0040;
pub const MENU_ID_INFORMATION: u32 = 0x0000_0041;
pub const MENU_ID_LOBBY: u32 = 0x0000_0042;
pub const MENU_ID_GAME: u32 = 0x0000_0043;
pub const MENU_ID_QUEST_CATEGORY: u32 = 0x0000_0044;
pub const MENU_ID_QUEST: u32 = 0x0000_0045;

pub const MAIN_MENU_GO_TO_LOBBY: u32 = 0x0000_0001;
pub const MAIN_MENU_INFORMATION: u32 = 0x0000_0002;
pub const MAIN_MENU_DISCONNECT: u32 = 0x0000_0003;

pub const INFORMATION_MENU_GO_BACK: u32 = 0xFFFF_FFFF;

bitflags! {
    pub struct MenuItemFlags: u32 {
        const INVISIBLE_ON_DC        = 0x01;
        const INVISIBLE_ON_PC        = 0x02;
        const INVISIBLE_ON_GC        = 0x04;
        const INVISIBLE_ON_GC_EP3    = 0x08;
        const INVISIBLE_ON_BB        = 0x10;
        /// Hidden for clients that no longer confirm message boxes; the
        /// entry's content could never be dismissed there.
        const REQUIRES_MESSAGE_BOXES = 0x20;
    }
}

#[derive(Debug, Clone)]
pub struct MenuItem {
    pub item_id: u32,
    pub name: String,
    pub description: String,
    pub flags: MenuItemFlags,
}

impl MenuItem {
    pub fn new(item_id: u32, name: &str, description: &str, flags: MenuItemFlags) -> MenuItem {
        MenuItem {
            item_id,
            name: name.to_string(),
            description: description.to_string(),
            flags,
        }
    }
}

/// The fixed main menu shown after login.
pub fn main_menu() -> Vec<MenuItem> {
    vec![
        MenuItem::new(MAIN_MENU_GO_TO_LOBBY, "Go to lobby", "Join the game lobby", MenuItemFlags::empty()),
        MenuItem::new(
            MAIN_MENU_INFORMATION,
            "Information",
            "View server\ninformation",
            MenuItemFlags::REQUIRES_MESSAGE_BOXES,
        ),
        MenuItem::new(MAIN_MENU_DISCONNECT, "Disconnect", "Disconnect from\nthe server", MenuItemFlags::empty()),
    ]
}
