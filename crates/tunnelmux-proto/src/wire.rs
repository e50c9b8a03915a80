//! Wire codec for tunnel messages
//!
//! Every message travels as exactly one WebSocket-style binary frame:
//!
//! ```text
//! +--------+--------+-----------------+----------------+
//! | FIN/op | M/len7 | ext len (0/2/8) | mask key (0/4) |
//! +--------+--------+-----------------+----------------+
//! |  kind  |        channel (3B, network order)        |
//! +--------+--------+--------+--------+----------------+
//! |                  payload                           |
//! +----------------------------------------------------+
//! ```
//!
//! The frame length counts the 4-byte tunnel preamble plus the payload.
//! Initiator-role frames are XOR-masked over preamble and payload with a
//! fresh 4-byte key, exactly like a WebSocket client.

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};

use crate::message::{Message, MessageKind, ProtoError};
use crate::{MAX_FRAME_SIZE, PREAMBLE_SIZE};

const FIN: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0f;
const OPCODE_BINARY: u8 = 0x02;
const MASK_BIT: u8 = 0x80;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

impl Message {
    /// Read one message from the stream. Blocks until a full frame is
    /// available, subject to the stream's configured timeout. Fails on
    /// stream errors and on frames this protocol cannot carry.
    pub fn read_from<R: Read>(stream: &mut R) -> Result<Message, ProtoError> {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head)?;

        if head[0] & FIN == 0 {
            return Err(ProtoError::FragmentedFrame);
        }
        let opcode = head[0] & OPCODE_MASK;
        if opcode != OPCODE_BINARY {
            return Err(ProtoError::UnexpectedOpcode(opcode));
        }

        let masked = head[1] & MASK_BIT != 0;
        let length = match head[1] & !MASK_BIT {
            LEN_16 => {
                let mut ext = [0u8; 2];
                stream.read_exact(&mut ext)?;
                u16::from_be_bytes(ext) as usize
            }
            LEN_64 => {
                let mut ext = [0u8; 8];
                stream.read_exact(&mut ext)?;
                let length = u64::from_be_bytes(ext);
                if length > MAX_FRAME_SIZE as u64 {
                    return Err(ProtoError::FrameTooLarge(length as usize));
                }
                length as usize
            }
            short => short as usize,
        };

        if length > MAX_FRAME_SIZE {
            return Err(ProtoError::FrameTooLarge(length));
        }
        if length < PREAMBLE_SIZE {
            return Err(ProtoError::TruncatedFrame);
        }

        let key = if masked {
            let mut key = [0u8; 4];
            stream.read_exact(&mut key)?;
            Some(key)
        } else {
            None
        };

        let mut frame = vec![0u8; length];
        stream.read_exact(&mut frame)?;
        if let Some(key) = key {
            apply_mask(&mut frame, key);
        }

        let kind = MessageKind::try_from(frame[0])?;
        let channel = u32::from_be_bytes([0, frame[1], frame[2], frame[3]]);
        let payload = BytesMut::from(&frame[PREAMBLE_SIZE..]).freeze();

        Message::new(kind, channel, payload)
    }

    /// Write this message as one frame. `mask` must be true when this side
    /// is in the client role. Masking consumes the frame content, so a
    /// masked write clears the message; do not rely on its payload
    /// afterwards.
    pub fn write_to<W: Write>(&mut self, stream: &mut W, mask: bool) -> Result<(), ProtoError> {
        if self.kind() == MessageKind::None {
            return Err(ProtoError::UnwritableKind);
        }

        let length = PREAMBLE_SIZE + self.len();
        if length > MAX_FRAME_SIZE {
            return Err(ProtoError::FrameTooLarge(length));
        }

        let mut frame = BytesMut::with_capacity(length + 14);
        frame.put_u8(FIN | OPCODE_BINARY);

        let mask_bit = if mask { MASK_BIT } else { 0 };
        if length < LEN_16 as usize {
            frame.put_u8(mask_bit | length as u8);
        } else if length <= u16::MAX as usize {
            frame.put_u8(mask_bit | LEN_16);
            frame.put_u16(length as u16);
        } else {
            frame.put_u8(mask_bit | LEN_64);
            frame.put_u64(length as u64);
        }

        let key = if mask {
            let key: [u8; 4] = rand::random();
            frame.put_slice(&key);
            Some(key)
        } else {
            None
        };

        let body_start = frame.len();
        let channel = self.channel();
        frame.put_u8(self.kind() as u8);
        frame.put_u8((channel >> 16) as u8);
        frame.put_u8((channel >> 8) as u8);
        frame.put_u8(channel as u8);
        frame.put_slice(self.payload());

        if let Some(key) = key {
            apply_mask(&mut frame[body_start..], key);
        }

        stream.write_all(&frame)?;
        stream.flush()?;

        if mask {
            self.clear();
        }

        Ok(())
    }
}

fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
