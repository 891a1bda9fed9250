//! Unsigned LEB128 varints
//!
//! Seven data bits per byte, least significant group first, high bit set on
//! every byte except the last. Used for entry lengths inside a block and for
//! the reset offset of a PUBNAK/RESET packet.

use crate::{Error, Result};
use bytes::{Buf, BufMut};

/// Longest encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Append `value` as a varint
pub fn put_varint(dst: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Read one varint, advancing `src` past it
pub fn get_varint(src: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    for _ in 0..MAX_VARINT_LEN {
        if !src.has_remaining() {
            return Err(Error::truncated("varint"));
        }
        let byte = src.get_u8();
        let bits = (byte & 0x7F) as u64;
        if shift == 63 && bits > 1 {
            return Err(Error::VarintOverflow);
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }

    Err(Error::VarintOverflow)
}

/// Number of bytes `put_varint` writes for `value`
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_values_single_byte() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 0);
        put_varint(&mut buf, 127);
        assert_eq!(buf, vec![0x00, 0x7F]);
    }

    #[test]
    fn test_multi_byte_layout() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xAC, 0x02]);

        let mut slice = &buf[..];
        assert_eq!(get_varint(&mut slice).unwrap(), 300);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_max_value() {
        let mut buf = Vec::new();
        put_varint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
        assert_eq!(varint_len(u64::MAX), MAX_VARINT_LEN);
        assert_eq!(get_varint(&mut &buf[..]).unwrap(), u64::MAX);
    }

    #[test]
    fn test_truncated() {
        let buf = [0x80u8, 0x80];
        assert!(matches!(
            get_varint(&mut &buf[..]),
            Err(Error::Truncated(_))
        ));
    }

    #[test]
    fn test_overflow() {
        let buf = [0xFFu8; 11];
        assert!(matches!(
            get_varint(&mut &buf[..]),
            Err(Error::VarintOverflow)
        ));
    }

    #[test]
    fn test_varint_len_matches_encoding() {
        for value in [0u64, 1, 127, 128, 16_383, 16_384, 1 << 35, u64::MAX >> 1] {
            let mut buf = Vec::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value), "value {}", value);
        }
    }
}
