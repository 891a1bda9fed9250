//! Block codec
//!
//! Buffered entries are flushed as one block:
//!
//! ```text
//! byte0            bits[3:2] = raw-len width - 1, bits[1:0] = compressed-len width - 1
//! raw-len          1..4 bytes, big-endian
//! compressed-len   1..4 bytes, big-endian
//! payload          zstd(varint len | entry | varint len | entry ...)
//! ```
//!
//! The decompressed length is checked against the header; a mismatch is
//! corruption and never retried.

use crate::{Error, Result};
use logsync_protocol::int::{fixed_width, get_fixed, put_fixed};
use logsync_protocol::varint::{get_varint, put_varint, varint_len};
use std::io::{self, Read};

/// Largest width of either length field
pub const MAX_LENGTH_WIDTH: usize = 4;

/// Largest block header (selector byte plus two 4-byte lengths)
pub const MAX_HEADER_LEN: usize = 1 + 2 * MAX_LENGTH_WIDTH;

/// Default zstd level for blocks
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Lengths stored in front of a block payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Length of the decompressed entry data
    pub raw_len: u64,
    /// Length of the compressed payload that follows the header
    pub compressed_len: u64,
}

impl BlockHeader {
    /// Build a header, rejecting lengths that need more than 4 bytes
    pub fn new(raw_len: u64, compressed_len: u64) -> Result<Self> {
        let header = Self {
            raw_len,
            compressed_len,
        };
        if header.raw_width() > MAX_LENGTH_WIDTH || header.compressed_width() > MAX_LENGTH_WIDTH {
            return Err(Error::corruption(format!(
                "block lengths {}/{} exceed {} bytes",
                raw_len, compressed_len, MAX_LENGTH_WIDTH
            )));
        }
        Ok(header)
    }

    /// Bytes used for the raw length
    pub fn raw_width(&self) -> usize {
        fixed_width(self.raw_len)
    }

    /// Bytes used for the compressed length
    pub fn compressed_width(&self) -> usize {
        fixed_width(self.compressed_len)
    }

    /// Size of the encoded header
    pub fn encoded_len(&self) -> usize {
        1 + self.raw_width() + self.compressed_width()
    }

    /// Size of header plus payload
    pub fn frame_len(&self) -> u64 {
        self.encoded_len() as u64 + self.compressed_len
    }

    /// Append the header to `dst`
    pub fn encode(&self, dst: &mut Vec<u8>) {
        let raw_width = self.raw_width();
        let compressed_width = self.compressed_width();
        dst.push((((raw_width - 1) << 2) | (compressed_width - 1)) as u8);
        put_fixed(dst, self.raw_len, raw_width);
        put_fixed(dst, self.compressed_len, compressed_width);
    }

    /// Decode a header from the front of `src`; `None` if `src` is too short
    pub fn decode(src: &[u8]) -> Result<Option<Self>> {
        let Some(&selector) = src.first() else {
            return Ok(None);
        };
        if selector & 0xF0 != 0 {
            return Err(Error::corruption(format!(
                "block selector {:#04x} has reserved bits set",
                selector
            )));
        }
        let raw_width = 1 + ((selector >> 2) & 3) as usize;
        let compressed_width = 1 + (selector & 3) as usize;
        if src.len() < 1 + raw_width + compressed_width {
            return Ok(None);
        }

        let mut fields = &src[1..];
        let raw_len = get_fixed(&mut fields, raw_width, "raw-len")?;
        let compressed_len = get_fixed(&mut fields, compressed_width, "compressed-len")?;
        Ok(Some(Self {
            raw_len,
            compressed_len,
        }))
    }
}

/// Concatenate entries as `[varint length][bytes]`
pub fn encode_entries<I, E>(entries: I) -> Vec<u8>
where
    I: IntoIterator<Item = E>,
    E: AsRef<[u8]>,
{
    let mut raw = Vec::new();
    for entry in entries {
        append_entry(&mut raw, entry.as_ref());
    }
    raw
}

/// Append one length-prefixed entry to a raw block buffer
pub fn append_entry(raw: &mut Vec<u8>, entry: &[u8]) {
    raw.reserve(varint_len(entry.len() as u64) + entry.len());
    put_varint(raw, entry.len() as u64);
    raw.extend_from_slice(entry);
}

/// Compress a raw block and prefix it with its header
pub fn frame_block(raw: &[u8], level: i32) -> Result<Vec<u8>> {
    let payload = zstd::bulk::compress(raw, level)?;
    let header = BlockHeader::new(raw.len() as u64, payload.len() as u64)?;

    let mut block = Vec::with_capacity(header.encoded_len() + payload.len());
    header.encode(&mut block);
    block.extend_from_slice(&payload);
    Ok(block)
}

/// Encode, compress and frame `entries` into one on-disk block
pub fn write_block<I, E>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = E>,
    E: AsRef<[u8]>,
{
    frame_block(&encode_entries(entries), DEFAULT_COMPRESSION_LEVEL)
}

/// A decoded block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Header as stored on disk
    pub header: BlockHeader,
    /// Decompressed entry data
    pub data: Vec<u8>,
}

impl Block {
    /// Bytes the block occupies on disk
    pub fn frame_len(&self) -> u64 {
        self.header.frame_len()
    }

    /// Iterate the entries of the block
    pub fn entries(&self) -> Entries<'_> {
        entries(&self.data)
    }
}

fn decompress(header: BlockHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let data = zstd::stream::decode_all(payload)
        .map_err(|e| Error::corruption(format!("block payload does not decompress: {}", e)))?;
    if data.len() as u64 != header.raw_len {
        return Err(Error::corruption(format!(
            "decompressed {} bytes, header declares {}",
            data.len(),
            header.raw_len
        )));
    }
    Ok(data)
}

/// Decode the block at the front of `src`; `None` if it is incomplete
pub fn decode_block(src: &[u8]) -> Result<Option<Block>> {
    let Some(header) = BlockHeader::decode(src)? else {
        return Ok(None);
    };
    let start = header.encoded_len();
    let end = start as u64 + header.compressed_len;
    if (src.len() as u64) < end {
        return Ok(None);
    }
    let data = decompress(header, &src[start..end as usize])?;
    Ok(Some(Block { header, data }))
}

/// Read the next block from `reader`
///
/// Returns `None` at end of input, including when the input ends part way
/// through a block (a segment still being written, or a chunk boundary on the
/// storing side).
pub fn read_block(reader: &mut impl Read) -> Result<Option<Block>> {
    let mut selector = [0u8; 1];
    if !fill(reader, &mut selector)? {
        return Ok(None);
    }
    let widths = 1 + ((selector[0] >> 2) & 3) as usize + 1 + (selector[0] & 3) as usize;
    let mut head = [0u8; MAX_HEADER_LEN];
    head[0] = selector[0];
    if !fill(reader, &mut head[1..1 + widths])? {
        return Ok(None);
    }
    let header = match BlockHeader::decode(&head[..1 + widths])? {
        Some(header) => header,
        None => return Ok(None),
    };

    let mut payload = vec![0u8; header.compressed_len as usize];
    if !fill(reader, &mut payload)? {
        return Ok(None);
    }
    let data = decompress(header, &payload)?;
    Ok(Some(Block { header, data }))
}

fn fill(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Lazy iterator over the entries of a decoded block
pub fn entries(data: &[u8]) -> Entries<'_> {
    Entries { rest: data }
}

/// Iterator returned by [`entries`]
#[derive(Debug, Clone)]
pub struct Entries<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let length = match get_varint(&mut self.rest) {
            Ok(length) => length as usize,
            Err(e) => {
                self.rest = &[];
                return Some(Err(Error::corruption(format!("entry length: {}", e))));
            }
        };
        if length > self.rest.len() {
            let remaining = self.rest.len();
            self.rest = &[];
            return Some(Err(Error::corruption(format!(
                "entry of {} bytes, {} left in block",
                length, remaining
            ))));
        }
        let (entry, rest) = self.rest.split_at(length);
        self.rest = rest;
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn collect(block: &Block) -> Vec<Vec<u8>> {
        block.entries().map(|e| e.unwrap().to_vec()).collect()
    }

    #[test]
    fn test_header_widths() {
        let header = BlockHeader::new(5, 300_000).unwrap();
        assert_eq!(header.raw_width(), 1);
        assert_eq!(header.compressed_width(), 3);

        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf[0], 0b0000_00_10);
        assert_eq!(buf.len(), 5);
        assert_eq!(BlockHeader::decode(&buf).unwrap(), Some(header));
    }

    #[test]
    fn test_header_rejects_wide_lengths() {
        assert!(BlockHeader::new(1 << 32, 1).is_err());
        assert!(BlockHeader::decode(&[0x10]).is_err());
    }

    #[test]
    fn test_round_trip_with_empty_entries() {
        let entries: Vec<&[u8]> = vec![b"first", b"", b"third entry"];
        let bytes = write_block(&entries).unwrap();
        let block = read_block(&mut &bytes[..]).unwrap().unwrap();
        assert_eq!(block.frame_len(), bytes.len() as u64);
        assert_eq!(collect(&block), vec![b"first".to_vec(), vec![], b"third entry".to_vec()]);
    }

    #[test]
    fn test_empty_block() {
        let bytes = write_block(Vec::<Vec<u8>>::new()).unwrap();
        let block = decode_block(&bytes).unwrap().unwrap();
        assert_eq!(block.header.raw_len, 0);
        assert_eq!(block.entries().count(), 0);
    }

    #[test]
    fn test_length_mismatch_is_corruption() {
        let raw = encode_entries([b"payload".as_slice()]);
        let payload = zstd::bulk::compress(&raw, DEFAULT_COMPRESSION_LEVEL).unwrap();
        let mut bytes = Vec::new();
        BlockHeader::new(raw.len() as u64 + 1, payload.len() as u64)
            .unwrap()
            .encode(&mut bytes);
        bytes.extend_from_slice(&payload);

        let err = read_block(&mut &bytes[..]).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_incomplete_block_reads_as_end() {
        let bytes = write_block([b"abc".as_slice(), b"def".as_slice()]).unwrap();
        for cut in [0, 1, 2, bytes.len() - 1] {
            assert!(read_block(&mut &bytes[..cut]).unwrap().is_none());
            assert!(decode_block(&bytes[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn test_consecutive_blocks() {
        let mut stream = write_block([b"one".as_slice()]).unwrap();
        stream.extend(write_block([b"two".as_slice(), b"three".as_slice()]).unwrap());

        let mut reader = &stream[..];
        let first = read_block(&mut reader).unwrap().unwrap();
        let second = read_block(&mut reader).unwrap().unwrap();
        assert!(read_block(&mut reader).unwrap().is_none());
        assert_eq!(collect(&first), vec![b"one".to_vec()]);
        assert_eq!(collect(&second), vec![b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_entry_overrun_is_corruption() {
        let mut iter = entries(&[5, b'a', b'b']);
        assert!(matches!(iter.next(), Some(Err(Error::Corruption(_)))));
        assert!(iter.next().is_none());
    }

    proptest! {
        #[test]
        fn prop_block_round_trip(entries in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 0..40)) {
            let bytes = write_block(&entries).unwrap();
            let block = read_block(&mut &bytes[..]).unwrap().unwrap();
            prop_assert_eq!(block.frame_len(), bytes.len() as u64);
            prop_assert_eq!(collect(&block), entries);
        }

        #[test]
        fn prop_header_round_trip(raw_len in 0u64..=u32::MAX as u64, compressed_len in 0u64..=u32::MAX as u64) {
            let header = BlockHeader::new(raw_len, compressed_len).unwrap();
            let mut buf = Vec::new();
            header.encode(&mut buf);
            prop_assert_eq!(buf.len(), header.encoded_len());
            prop_assert_eq!(BlockHeader::decode(&buf).unwrap(), Some(header));
        }
    }
}
