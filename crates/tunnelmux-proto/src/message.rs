//! Protocol message types

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::{CONTROL_CHANNEL, MAX_CHANNEL, MAX_FRAME_SIZE};

/// Multiplex channel identifier (24 bits on the wire)
pub type ChannelId = u32;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("channel too high: {0:#x}, max: {max:#x}", max = MAX_CHANNEL)]
    ChannelTooHigh(ChannelId),

    #[error("unknown message kind: {0:#x}")]
    UnknownKind(u8),

    #[error("refusing to write a message of kind None")]
    UnwritableKind,

    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("frame too short for the tunnel preamble")]
    TruncatedFrame,

    #[error("unexpected opcode {0:#x} in tunnel frame")]
    UnexpectedOpcode(u8),

    #[error("fragmented frames are not supported")]
    FragmentedFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message kinds of the tunnel protocol (one byte on the wire).
///
/// `Login` carries base64 of `user:secret`, much like basic auth. `Connect`
/// carries the target endpoint as `host:port` or `[ipv6]:port`. `Data`
/// carries raw payload bytes. `Ping`/`Pong` optionally carry a round-trip
/// timing token. `Pause`/`Resume` implement per-channel flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MessageKind {
    #[default]
    None = 0,
    Login,
    Helo,
    Ping,
    Pong,
    Idle,
    Control,
    Connect,
    Data,
    Pause,
    Resume,
    Disconnect,
}

impl MessageKind {
    /// the message kind in ASCII, for logging purposes
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::None => "None",
            MessageKind::Login => "Login",
            MessageKind::Helo => "Helo",
            MessageKind::Ping => "Ping",
            MessageKind::Pong => "Pong",
            MessageKind::Idle => "Idle",
            MessageKind::Control => "Control",
            MessageKind::Connect => "Connect",
            MessageKind::Data => "Data",
            MessageKind::Pause => "Pause",
            MessageKind::Resume => "Resume",
            MessageKind::Disconnect => "Disconnect",
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::None),
            1 => Ok(MessageKind::Login),
            2 => Ok(MessageKind::Helo),
            3 => Ok(MessageKind::Ping),
            4 => Ok(MessageKind::Pong),
            5 => Ok(MessageKind::Idle),
            6 => Ok(MessageKind::Control),
            7 => Ok(MessageKind::Connect),
            8 => Ok(MessageKind::Data),
            9 => Ok(MessageKind::Pause),
            10 => Ok(MessageKind::Resume),
            11 => Ok(MessageKind::Disconnect),
            _ => Err(ProtoError::UnknownKind(value)),
        }
    }
}

/// One protocol message: kind, channel, opaque payload.
///
/// Channel 0 is the control channel; channels from 1 upward address one
/// multiplexed end-to-end stream each.
#[derive(Debug, Clone, Default)]
pub struct Message {
    kind: MessageKind,
    channel: ChannelId,
    payload: Bytes,
}

impl Message {
    /// Construct from discrete parameters. Fails if `channel` does not fit
    /// the 24-bit channel space.
    pub fn new(
        kind: MessageKind,
        channel: ChannelId,
        payload: impl Into<Bytes>,
    ) -> Result<Self, ProtoError> {
        if channel > MAX_CHANNEL {
            return Err(ProtoError::ChannelTooHigh(channel));
        }
        Ok(Self {
            kind,
            channel,
            payload: payload.into(),
        })
    }

    /// A payload-less message on the control channel
    pub fn control(kind: MessageKind) -> Self {
        Self {
            kind,
            channel: CONTROL_CHANNEL,
            payload: Bytes::new(),
        }
    }

    /// A message on the control channel carrying a payload
    pub fn control_with(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            channel: CONTROL_CHANNEL,
            payload: payload.into(),
        }
    }

    /// A `Data` message for one multiplexed channel
    pub fn data(channel: ChannelId, payload: impl Into<Bytes>) -> Result<Self, ProtoError> {
        Self::new(MessageKind::Data, channel, payload)
    }

    /// A payload-less `Disconnect` for one multiplexed channel
    pub fn disconnect(channel: ChannelId) -> Result<Self, ProtoError> {
        Self::new(MessageKind::Disconnect, channel, Bytes::new())
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: MessageKind) {
        self.kind = kind;
    }

    /// the channel id this message is addressed to
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Set the channel id. Fails, without changing the message, if the
    /// value does not fit the 24-bit channel space.
    pub fn set_channel(&mut self, channel: ChannelId) -> Result<(), ProtoError> {
        if channel > MAX_CHANNEL {
            return Err(ProtoError::ChannelTooHigh(channel));
        }
        self.channel = channel;
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
    }

    /// Move the payload out, leaving an empty one behind
    pub fn take_payload(&mut self) -> Bytes {
        std::mem::take(&mut self.payload)
    }

    /// payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// reset to the default (`None`, channel 0, empty payload)
    pub fn clear(&mut self) {
        *self = Message::default();
    }

    /// Payload preview for log lines. Binary payloads are never dumped;
    /// `Data` previews at most the first 20 bytes, and only as text.
    fn preview(&self) -> &str {
        match self.kind {
            MessageKind::None => "",
            MessageKind::Data => {
                let head = &self.payload[..self.payload.len().min(20)];
                printable(head).unwrap_or("")
            }
            _ => printable(&self.payload).unwrap_or(""),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]: {} {} chars: {}",
            self.channel,
            self.kind.as_str(),
            self.payload.len(),
            self.preview()
        )
    }
}

/// Returns the bytes as text if they are clean printable UTF-8
fn printable(bytes: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(bytes).ok()?;
    if text
        .chars()
        .any(|c| c.is_control() && c != '\t' && c != '\n' && c != '\r')
    {
        return None;
    }
    Some(text)
}
