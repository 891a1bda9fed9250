//! Minimal-width big-endian integers
//!
//! Packet headers and block headers store small "width selector" fields
//! saying how many bytes a length or offset occupies, so a 5-byte block
//! costs one length byte instead of eight.

use crate::{Error, Result};
use bytes::{Buf, BufMut};

/// Smallest number of bytes (at least 1) that can hold `value`
pub fn fixed_width(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(8).max(1)
}

/// Write the low `width` bytes of `value`, big-endian
pub fn put_fixed(dst: &mut impl BufMut, value: u64, width: usize) {
    debug_assert!((1..=8).contains(&width));
    debug_assert!(fixed_width(value) <= width);
    dst.put_uint(value, width);
}

/// Read a `width`-byte big-endian integer
pub fn get_fixed(src: &mut impl Buf, width: usize, field: &str) -> Result<u64> {
    if !(1..=8).contains(&width) {
        return Err(Error::malformed(format!("{} width {}", field, width)));
    }
    if src.remaining() < width {
        return Err(Error::truncated(format!(
            "{}: need {} bytes, have {}",
            field,
            width,
            src.remaining()
        )));
    }
    Ok(src.get_uint(width))
}
