//! Shared protocol definitions for the `haggle` socket and REST wire formats.

pub mod codec;
pub mod event;
pub mod message;
pub mod presence;
