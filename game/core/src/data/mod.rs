//! Static game-data indices. Everything here is loaded at startup (or on an
//! operator reload) and immutable afterwards, so readers share them without
//! synchronization.

pub mod battle;
pub mod drops;
pub mod ep3;
pub mod level;
pub mod rares;

pub use battle::{BattleParamTable, BattleParams};
pub use drops::CommonItemCreator;
pub use ep3::{Ep3CardIndex, Ep3MapIndex};
pub use level::{LevelStats, LevelTable};
pub use rares::{RareItemDrop, RareItemTable, RareItemSet};
