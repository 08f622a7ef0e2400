#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Wire-level FIX support shared by the session engine and application
//! handlers: the field dictionary, the tag=value message model, the framing
//! codec and the timestamp/logging plumbing.

/// The FIX field delimiter.
pub const SOH: u8 = 0x01;

pub type Tag = u32;
pub type SeqNum = u64;

pub mod codec;
pub mod dict;
pub mod logging;
pub mod message;
pub mod tags;
pub mod time;
