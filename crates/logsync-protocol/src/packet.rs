//! PUBLISH / ACK packet layout
//!
//! Every packet starts with one packed header byte; bits 7..5 carry the
//! message kind.
//!
//! ```text
//! PUBLISH    000 OOO TT | offset (O+1 bytes) | topic-len (T+1 bytes) | topic | data
//! ACK        001 00- TT | topic-len (T+1 bytes) | topic
//! NAK/RESET  001 01- TT | topic-len (T+1 bytes) | topic | varint reset-offset
//! NAK/FAIL   001 10- TT | topic-len (T+1 bytes) | topic
//! ```
//!
//! All fixed-width fields are big-endian. The data of a PUBLISH is whatever
//! follows the topic up to the end of the frame.

use crate::int::{fixed_width, get_fixed, put_fixed};
use crate::varint::{get_varint, put_varint, varint_len};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes};

/// Message kind for PUBLISH
pub const KIND_PUBLISH: u8 = 0;
/// Message kind for the ACK/NAK family
pub const KIND_ACK: u8 = 1;

const ACK_SUBTYPE_ACK: u8 = 0;
const ACK_SUBTYPE_RESET: u8 = 1;
const ACK_SUBTYPE_FAILURE: u8 = 2;

/// Longest topic a packet can carry (topic length field is at most 4 bytes)
pub const MAX_TOPIC_LEN: usize = u32::MAX as usize;

/// A decoded replication packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Client -> service: bytes of the topic log starting at `offset`
    Publish {
        /// Absolute log offset of the first data byte
        offset: u64,
        /// Topic identifier (UTF-8)
        topic: Bytes,
        /// Segment bytes, already block-encoded by the producer
        data: Bytes,
    },
    /// Service -> client: the last PUBLISH for `topic` was stored
    Ack {
        /// Topic identifier
        topic: Bytes,
    },
    /// Service -> client: restart publishing `topic` from `offset`
    Reset {
        /// Topic identifier
        topic: Bytes,
        /// Offset the service holds for this topic
        offset: u64,
    },
    /// Service -> client: the last PUBLISH failed for a non-offset reason
    Failure {
        /// Topic identifier
        topic: Bytes,
    },
}

impl Packet {
    /// Topic the packet refers to
    pub fn topic(&self) -> &Bytes {
        match self {
            Self::Publish { topic, .. }
            | Self::Ack { topic }
            | Self::Reset { topic, .. }
            | Self::Failure { topic } => topic,
        }
    }

    /// Topic as text, replacing invalid UTF-8
    pub fn topic_str(&self) -> String {
        String::from_utf8_lossy(self.topic()).into_owned()
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Publish { .. } => "PUBLISH",
            Self::Ack { .. } => "PUBACK",
            Self::Reset { .. } => "PUBNAK/RESET",
            Self::Failure { .. } => "PUBNAK/FAILURE",
        }
    }

    /// Exact number of bytes `encode` produces
    pub fn encoded_len(&self) -> usize {
        let topic_len = self.topic().len();
        let topic_part = fixed_width(topic_len as u64) + topic_len;
        match self {
            Self::Publish { offset, data, .. } => 1 + fixed_width(*offset) + topic_part + data.len(),
            Self::Ack { .. } | Self::Failure { .. } => 1 + topic_part,
            Self::Reset { offset, .. } => 1 + topic_part + varint_len(*offset),
        }
    }

    /// Append the packet (without any frame prefix) to `dst`
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let topic = self.topic();
        if topic.len() > MAX_TOPIC_LEN {
            return Err(Error::malformed(format!(
                "topic length {} exceeds {}",
                topic.len(),
                MAX_TOPIC_LEN
            )));
        }
        let topic_len = topic.len() as u64;
        let topic_width = fixed_width(topic_len);

        match self {
            Self::Publish { offset, data, .. } => {
                let offset_width = fixed_width(*offset);
                dst.put_u8(
                    (KIND_PUBLISH << 5) | (((offset_width - 1) as u8) << 2) | (topic_width - 1) as u8,
                );
                put_fixed(dst, *offset, offset_width);
                put_fixed(dst, topic_len, topic_width);
                dst.put_slice(topic);
                dst.put_slice(data);
            }
            Self::Ack { .. } => {
                put_ack_head(dst, ACK_SUBTYPE_ACK, topic, topic_width);
            }
            Self::Reset { offset, .. } => {
                put_ack_head(dst, ACK_SUBTYPE_RESET, topic, topic_width);
                put_varint(dst, *offset);
            }
            Self::Failure { .. } => {
                put_ack_head(dst, ACK_SUBTYPE_FAILURE, topic, topic_width);
            }
        }
        Ok(())
    }

    /// Decode one packet occupying the whole of `buf`
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(Error::truncated("empty packet"));
        }
        let head = buf.get_u8();

        match (head >> 5) & 7 {
            KIND_PUBLISH => {
                let offset = get_fixed(&mut buf, 1 + ((head >> 2) & 7) as usize, "offset")?;
                let topic = get_topic(&mut buf, head)?;
                Ok(Self::Publish {
                    offset,
                    topic,
                    data: buf,
                })
            }
            KIND_ACK => {
                let subtype = (head >> 3) & 3;
                let topic = get_topic(&mut buf, head)?;
                let packet = match subtype {
                    ACK_SUBTYPE_ACK => Self::Ack { topic },
                    ACK_SUBTYPE_RESET => {
                        let offset = get_varint(&mut buf)?;
                        Self::Reset { topic, offset }
                    }
                    ACK_SUBTYPE_FAILURE => Self::Failure { topic },
                    other => {
                        return Err(Error::malformed(format!("unknown ack subtype {}", other)));
                    }
                };
                if buf.has_remaining() {
                    tracing::trace!(
                        "{} packet carries {} trailing bytes",
                        packet.name(),
                        buf.remaining()
                    );
                }
                Ok(packet)
            }
            other => Err(Error::malformed(format!("unknown message kind {}", other))),
        }
    }
}

fn put_ack_head(dst: &mut impl BufMut, subtype: u8, topic: &Bytes, topic_width: usize) {
    dst.put_u8((KIND_ACK << 5) | (subtype << 3) | (topic_width - 1) as u8);
    put_fixed(dst, topic.len() as u64, topic_width);
    dst.put_slice(topic);
}

fn get_topic(buf: &mut Bytes, head: u8) -> Result<Bytes> {
    let topic_len = get_fixed(buf, 1 + (head & 3) as usize, "topic-len")? as usize;
    if buf.remaining() < topic_len {
        return Err(Error::truncated(format!(
            "topic: need {} bytes, have {}",
            topic_len,
            buf.remaining()
        )));
    }
    Ok(buf.split_to(topic_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: &Packet) -> Bytes {
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), packet.encoded_len());
        Bytes::from(buf)
    }

    #[test]
    fn test_publish_header_bits() {
        let packet = Packet::Publish {
            offset: 0x01_0000,
            topic: Bytes::from_static(b"t"),
            data: Bytes::from_static(b"abc"),
        };
        let buf = encode(&packet);

        // kind 0, offset width 3 -> 0b010, topic-len width 1 -> 0b00
        assert_eq!(buf[0], 0b000_010_00);
        assert_eq!(&buf[1..4], &[0x01, 0x00, 0x00]);
        assert_eq!(buf[4], 1);
        assert_eq!(&buf[5..6], b"t");
        assert_eq!(&buf[6..], b"abc");

        assert_eq!(Packet::decode(buf).unwrap(), packet);
    }

    #[test]
    fn test_publish_zero_offset_uses_one_byte() {
        let packet = Packet::Publish {
            offset: 0,
            topic: Bytes::from_static(b"topic-0"),
            data: Bytes::new(),
        };
        let buf = encode(&packet);
        assert_eq!(buf.len(), 1 + 1 + 1 + 7);
        assert_eq!(Packet::decode(buf).unwrap(), packet);
    }

    #[test]
    fn test_ack_family_subtypes() {
        let topic = Bytes::from_static(b"orders");

        let ack = encode(&Packet::Ack {
            topic: topic.clone(),
        });
        assert_eq!(ack[0], 0b001_00_0_00);

        let reset = encode(&Packet::Reset {
            topic: topic.clone(),
            offset: 100,
        });
        assert_eq!(reset[0], 0b001_01_0_00);
        assert_eq!(*reset.last().unwrap(), 100);

        let failure = encode(&Packet::Failure {
            topic: topic.clone(),
        });
        assert_eq!(failure[0], 0b001_10_0_00);

        assert_eq!(
            Packet::decode(reset).unwrap(),
            Packet::Reset { topic, offset: 100 }
        );
    }

    #[test]
    fn test_long_topic_widens_length_field() {
        let topic = Bytes::from(vec![b'x'; 300]);
        let packet = Packet::Failure {
            topic: topic.clone(),
        };
        let buf = encode(&packet);
        assert_eq!(buf[0] & 3, 1);
        assert_eq!(Packet::decode(buf).unwrap().topic(), &topic);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let err = Packet::decode(Bytes::from_static(&[0b111_00000])).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_ack_subtype() {
        let err = Packet::decode(Bytes::from_static(&[0b001_11_0_00, 1, b'a'])).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_decode_truncated_topic() {
        let err = Packet::decode(Bytes::from_static(&[0b001_00_0_00, 5, b'a'])).unwrap_err();
        assert!(matches!(err, Error::Truncated(_)));
    }

    #[test]
    fn test_reset_without_offset_is_truncated() {
        let err = Packet::decode(Bytes::from_static(&[0b001_01_0_00, 1, b'a'])).unwrap_err();
        assert!(matches!(err, Error::Truncated(_)));
    }
}
