//! Binary and text framing spoken with cluster nodes.
//!
//! Every frame starts with an 8 byte proto header (version, type, 48 bit big
//! endian size). Record commands follow it with a 22 byte message header,
//! fields and bin operations; info commands follow it with newline separated
//! text.

pub mod info;
pub mod key;
pub mod msgpack;
pub mod proto;

pub use key::{Digest, Key, UserKey};
pub use proto::{Message, MessageBuilder, ProtoHeader};
