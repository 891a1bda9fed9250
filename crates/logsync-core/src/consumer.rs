//! Consumer cursor
//!
//! A cursor walks the segment sequence of one tracker. It keeps its own
//! snapshot of the segment list (current segment first), refreshed by the
//! tracker when segments are added and when data is appended.

use crate::segment::SegmentFile;
use crate::tracker::TopicLogTracker;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
struct CursorState {
    /// Remaining segments, current one first
    files: VecDeque<SegmentFile>,
    offset: u64,
    /// Position inside the current segment
    block_offset: u64,
    /// Start of the next segment, or max offset on the last one
    next_offset: u64,
    max_offset: u64,
}

impl CursorState {
    fn available(&self) -> u64 {
        if self.files.is_empty() {
            0
        } else {
            self.next_offset.saturating_sub(self.offset)
        }
    }

    fn boundary(&self) -> u64 {
        self.files
            .get(1)
            .map(|f| f.offset())
            .unwrap_or(self.max_offset)
    }

    /// Move to the next segment once the current one is exhausted; the
    /// last segment is never popped
    fn next_log(&mut self, topic: &str) -> Result<()> {
        if self.files.len() < 2 {
            return Ok(());
        }
        let Some(current) = self.files.pop_front() else {
            return Ok(());
        };
        let Some(next) = self.files.front() else {
            return Ok(());
        };

        if next.offset() != self.offset {
            return Err(Error::discontinuity(format!(
                "{}: segment {} follows {} but cursor is at offset {}",
                topic,
                next.name(),
                current.name(),
                self.offset
            )));
        }
        let expected = next.offset() - current.offset();
        match std::fs::metadata(current.path()) {
            Ok(meta) if meta.len() != expected => {
                return Err(Error::discontinuity(format!(
                    "{}: segment {} holds {} bytes, next segment {} expects {}",
                    topic,
                    current.name(),
                    meta.len(),
                    next.name(),
                    expected
                )));
            }
            Ok(_) => {}
            // already cleaned up behind us
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.block_offset = 0;
        self.next_offset = self.boundary();
        Ok(())
    }
}

/// Read position of one consumer over a topic's segments
pub struct ConsumerCursor {
    name: String,
    topic: String,
    tracker: Weak<TopicLogTracker>,
    state: Mutex<CursorState>,
}

impl std::fmt::Debug for ConsumerCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConsumerCursor")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .field("offset", &state.offset)
            .field("max_offset", &state.max_offset)
            .field("files", &state.files.len())
            .finish()
    }
}

/// A byte range of one segment, never crossing a segment boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRegion {
    /// Segment holding the bytes
    pub file: SegmentFile,
    /// Position inside the segment file
    pub position: u64,
    /// Number of bytes
    pub length: u64,
    /// Absolute log offset of the first byte
    pub offset: u64,
}

impl ConsumerCursor {
    pub(crate) fn new(name: String, topic: String, tracker: Weak<TopicLogTracker>) -> Self {
        Self {
            name,
            topic,
            tracker,
            state: Mutex::new(CursorState::default()),
        }
    }

    /// Consumer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topic the cursor reads
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Owning tracker, if still alive
    pub fn tracker(&self) -> Option<Arc<TopicLogTracker>> {
        self.tracker.upgrade()
    }

    /// Absolute offset of the next unconsumed byte
    pub fn offset(&self) -> u64 {
        self.state.lock().offset
    }

    /// Max offset as last seen by this cursor
    pub fn max_offset(&self) -> u64 {
        self.state.lock().max_offset
    }

    /// Segment the cursor currently reads from
    pub fn block_file(&self) -> Option<SegmentFile> {
        self.state.lock().files.front().cloned()
    }

    /// Position inside [`block_file`](Self::block_file)
    pub fn block_offset(&self) -> u64 {
        self.state.lock().block_offset
    }

    /// Bytes left in the current segment
    pub fn block_available(&self) -> u64 {
        self.state.lock().available()
    }

    /// Remaining segments, current one first
    pub fn files(&self) -> Vec<SegmentFile> {
        self.state.lock().files.iter().cloned().collect()
    }

    /// Reposition the cursor against a fresh snapshot of the tracker
    ///
    /// Fails with [`Error::InvalidOffset`] past the max offset and with
    /// [`Error::OffsetDeleted`] before the oldest remaining segment.
    pub fn set_offset(&self, offset: u64) -> Result<()> {
        let tracker = self.tracker.upgrade().ok_or_else(|| {
            Error::replication(format!("{}: tracker of cursor {} is gone", self.topic, self.name))
        })?;
        tracker.reposition(self, offset)
    }

    pub(crate) fn reset(&self, files: &[SegmentFile], max_offset: u64, offset: u64) -> Result<()> {
        if offset > max_offset {
            return Err(Error::InvalidOffset { offset, max_offset });
        }

        let mut files: VecDeque<SegmentFile> = files.iter().cloned().collect();
        while files.len() > 1 && files[1].offset() <= offset {
            files.pop_front();
        }

        let first_offset = files.front().map(|f| f.offset()).unwrap_or(max_offset);
        if offset < first_offset {
            return Err(Error::OffsetDeleted {
                offset,
                first_offset,
            });
        }

        let mut state = self.state.lock();
        state.files = files;
        state.offset = offset;
        state.max_offset = max_offset;
        state.block_offset = offset - first_offset;
        state.next_offset = state.boundary();

        tracing::debug!(
            topic = %self.topic,
            consumer = %self.name,
            offset,
            max_offset,
            "cursor positioned"
        );
        Ok(())
    }

    /// True while unconsumed bytes exist, moving to the next segment when the
    /// current one is exhausted
    pub fn has_more(&self) -> Result<bool> {
        let mut state = self.state.lock();
        loop {
            if state.available() > 0 {
                return Ok(true);
            }
            if state.files.len() <= 1 {
                return Ok(false);
            }
            state.next_log(&self.topic)?;
        }
    }

    /// Advance by `length` bytes
    ///
    /// Crossing into the next segment verifies that it starts exactly where
    /// the cursor lands; a mismatch is [`Error::Discontinuity`].
    pub fn consume(&self, length: u64) -> Result<()> {
        let mut state = self.state.lock();
        let max_offset = state.max_offset;
        let past_end = |offset| Error::InvalidOffset { offset, max_offset };
        match state.offset.checked_add(length) {
            Some(end) if end <= max_offset => {}
            Some(end) => return Err(past_end(end)),
            None => return Err(past_end(u64::MAX)),
        }

        let mut remaining = length;
        while remaining > 0 {
            let available = state.available();
            if available == 0 {
                if state.files.len() <= 1 {
                    return Err(past_end(state.offset + remaining));
                }
                state.next_log(&self.topic)?;
                continue;
            }
            let step = available.min(remaining);
            state.offset += step;
            state.block_offset += step;
            remaining -= step;
        }

        if state.available() == 0 && state.files.len() > 1 {
            state.next_log(&self.topic)?;
        }
        Ok(())
    }

    /// Region of at most `max_len` bytes at the cursor, if any data is left
    pub fn next_region(&self, max_len: u64) -> Result<Option<SegmentRegion>> {
        if !self.has_more()? {
            return Ok(None);
        }
        let state = self.state.lock();
        let Some(file) = state.files.front().cloned() else {
            return Ok(None);
        };
        Ok(Some(SegmentRegion {
            file,
            position: state.block_offset,
            length: state.available().min(max_len),
            offset: state.offset,
        }))
    }

    pub(crate) fn add_file(&self, segment: SegmentFile) {
        let mut state = self.state.lock();
        if state.files.is_empty() {
            state.block_offset = state.offset.saturating_sub(segment.offset());
        }
        state.files.push_back(segment);
        state.next_offset = state.boundary();
    }

    pub(crate) fn add_data(&self, length: u64) {
        let mut state = self.state.lock();
        state.max_offset += length;
        if state.files.len() <= 1 {
            state.next_offset = state.max_offset;
        }
    }
}
