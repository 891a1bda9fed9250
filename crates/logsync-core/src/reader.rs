//! Entry reader and topic checksums

use crate::block::read_block;
use crate::consumer::ConsumerCursor;
use crate::segment::SegmentFile;
use crate::tracker::TopicLogTracker;
use crate::{Error, Result};
use sha2::{Digest, Sha512};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::time::{Duration, Instant};

/// Reads the segment files of a cursor back to back, up to its max offset
struct SegmentChain {
    files: VecDeque<SegmentFile>,
    current: Option<File>,
    position: u64,
    remaining: u64,
}

impl Read for SegmentChain {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.remaining == 0 || buf.is_empty() {
                return Ok(0);
            }
            if self.current.is_none() {
                let Some(segment) = self.files.pop_front() else {
                    return Ok(0);
                };
                let mut file = File::open(segment.path())?;
                if self.position > 0 {
                    file.seek(SeekFrom::Start(self.position))?;
                    self.position = 0;
                }
                self.current = Some(file);
            }
            let Some(file) = self.current.as_mut() else {
                continue;
            };

            let limit = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
            let n = file.read(&mut buf[..limit])?;
            if n == 0 {
                self.current = None;
                continue;
            }
            self.remaining -= n as u64;
            return Ok(n);
        }
    }
}

/// Decode whole blocks from the cursor position and pass every entry to `f`
///
/// Reading spans segment files and stops at the end of the data or at the
/// first incomplete block. With a `time_limit` it also stops after the first
/// block that finishes past the limit. The cursor is not advanced; the
/// return value is the number of bytes the caller may `consume`.
pub fn read_entries<F>(cursor: &ConsumerCursor, time_limit: Option<Duration>, mut f: F) -> Result<u64>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let started = Instant::now();
    let files: VecDeque<SegmentFile> = cursor.files().into();
    let chain = SegmentChain {
        files,
        current: None,
        position: cursor.block_offset(),
        remaining: cursor.max_offset().saturating_sub(cursor.offset()),
    };
    let mut reader = BufReader::new(chain);

    let mut consumed = 0u64;
    while let Some(block) = read_block(&mut reader)? {
        for entry in block.entries() {
            f(entry?)?;
        }
        consumed += block.frame_len();

        if time_limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
    }
    Ok(consumed)
}

/// SHA-512 summary of a topic's entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicChecksum {
    /// Hex-encoded SHA-512 over all entries in order
    pub digest: String,
    /// Number of entries
    pub entries: u64,
    /// Bytes of segment data covered
    pub bytes: u64,
}

/// Checksum every entry of `tracker` from its oldest remaining segment
///
/// Fails when the log cannot be read to its max offset (incomplete trailing
/// block or segment discontinuity).
pub fn topic_checksum(tracker: &std::sync::Arc<TopicLogTracker>) -> Result<TopicChecksum> {
    let start = tracker
        .files()
        .first()
        .map(|f| f.offset())
        .unwrap_or_else(|| tracker.max_offset());
    let cursor = tracker.new_consumer("checksum", start)?;
    let result = checksum_cursor(&cursor);
    tracker.remove_consumer(&cursor);
    result
}

fn checksum_cursor(cursor: &ConsumerCursor) -> Result<TopicChecksum> {
    let mut hasher = Sha512::new();
    let mut entries = 0u64;
    let consumed = read_entries(cursor, None, |entry| {
        hasher.update(entry);
        entries += 1;
        Ok(())
    })?;
    cursor.consume(consumed)?;

    if cursor.offset() != cursor.max_offset() {
        return Err(Error::corruption(format!(
            "{}: only {} of {} bytes decode as whole blocks",
            cursor.topic(),
            cursor.offset(),
            cursor.max_offset()
        )));
    }

    Ok(TopicChecksum {
        digest: hex::encode(hasher.finalize()),
        entries,
        bytes: consumed,
    })
}
