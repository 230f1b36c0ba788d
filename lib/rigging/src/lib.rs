#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod channel;
pub mod endpoint;
pub mod frame;
pub mod support;
pub mod version;
