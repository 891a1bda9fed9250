//! Frame codec
//!
//! Frames are `[u32 big-endian length][packet]`. Decoding is delegated to
//! `LengthDelimitedCodec`; encoding writes the packet straight into the
//! output buffer and back-patches the length so PUBLISH data is copied once.

use crate::{Error, Packet, Result};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted in either direction
pub const MAX_FRAME_SIZE: usize = 128 << 20;

const FRAME_HEADER_SIZE: usize = 4;

/// `tokio_util` codec turning a byte stream into [`Packet`]s
#[derive(Debug)]
pub struct PacketCodec {
    frames: LengthDelimitedCodec,
}

impl PacketCodec {
    /// Create a codec with the default frame limit
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(FRAME_HEADER_SIZE)
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match self.frames.decode(src)? {
            Some(frame) => Packet::decode(frame.freeze()).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        let length = packet.encoded_len();
        if length > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(length));
        }

        dst.reserve(FRAME_HEADER_SIZE + length);
        dst.put_u32(length as u32);
        packet.encode(dst)
    }
}
