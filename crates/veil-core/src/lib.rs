//! veil-core — wire framing, attribute codec, schema, keys and configuration.
//! All other veil crates depend on this one.

pub mod attr;
pub mod config;
pub mod crypto;
pub mod schema;
pub mod wire;

pub use attr::{AttrSet, AttrWriter, CodecError, MessageFull};
pub use wire::{Command, FamilyHeader, MsgHeader, WireError};
