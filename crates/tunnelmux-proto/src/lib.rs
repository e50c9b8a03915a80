//! Tunnel Protocol Definitions
//!
//! This crate defines the message model and the wire codec for the
//! multiplexed tunnel protocol: a 4-byte preamble (message kind plus a
//! 24-bit channel id) carried inside a WebSocket-style binary frame.

pub mod message;
pub mod wire;

pub use message::{ChannelId, Message, MessageKind, ProtoError};

/// Reserved channel id for tunnel-level control messages
pub const CONTROL_CHANNEL: ChannelId = 0;

/// Highest addressable multiplex channel (24-bit id space)
pub const MAX_CHANNEL: ChannelId = (1 << 24) - 1;

/// Size of the tunnel preamble prepended to every frame payload
pub const PREAMBLE_SIZE: usize = 4;

/// Upper bound accepted for a single frame, preamble included (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
