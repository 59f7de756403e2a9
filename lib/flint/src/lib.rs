#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Identifier assigned to a connected clicker. Unique for the daemon's lifetime.
pub type ClickerId = u32;

pub mod crypto;
pub mod encoder;
pub mod logging;
pub mod time;
