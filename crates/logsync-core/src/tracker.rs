//! Topic log tracker
//!
//! The tracker is the producer-side authority for one topic: the ordered list
//! of segment files, the cumulative max offset, the registered consumer
//! cursors and the roll/retention decisions.
//!
//! Lock order is the append lock, then tracker state, then cursor state.
//! Cursors reach back to their tracker through a `Weak` so the registration
//! does not form a reference cycle.

use crate::consumer::ConsumerCursor;
use crate::segment::{SegmentFile, encode_name};
use crate::{Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Callback invoked after bytes are appended: `(topic, max_offset)`
pub type DataListener = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Result of [`TopicLogTracker::append_at`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendAt {
    /// Data written; carries the new max offset
    Appended(u64),
    /// The offset did not match; nothing was written
    Mismatch {
        /// Current max offset of the topic
        max_offset: u64,
    },
}

/// Handle returned by [`TopicLogTracker::add_data_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct TrackerState {
    files: Vec<SegmentFile>,
    max_offset: u64,
    consumers: Vec<Arc<ConsumerCursor>>,
    listeners: Vec<(ListenerId, DataListener)>,
}

impl TrackerState {
    fn gating_sequence(&self) -> u64 {
        self.consumers
            .iter()
            .map(|c| c.offset())
            .min()
            .unwrap_or(self.max_offset)
    }
}

struct ActiveSegment {
    path: PathBuf,
    file: File,
}

/// Segment bookkeeping for one topic
pub struct TopicLogTracker {
    topic: String,
    dir: PathBuf,
    state: Mutex<TrackerState>,
    /// Serializes appends and holds the open active segment
    active: Mutex<Option<ActiveSegment>>,
    next_listener_id: AtomicU64,
}

impl std::fmt::Debug for TopicLogTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TopicLogTracker")
            .field("topic", &self.topic)
            .field("dir", &self.dir)
            .field("files", &state.files.len())
            .field("max_offset", &state.max_offset)
            .field("consumers", &state.consumers.len())
            .finish()
    }
}

impl TopicLogTracker {
    /// Create a tracker for `topic` stored in `dir` and load its segments
    pub fn open(topic: impl Into<String>, dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let tracker = Arc::new(Self {
            topic: topic.into(),
            dir: dir.into(),
            state: Mutex::new(TrackerState {
                files: Vec::new(),
                max_offset: 0,
                consumers: Vec::new(),
                listeners: Vec::new(),
            }),
            active: Mutex::new(None),
            next_listener_id: AtomicU64::new(1),
        });
        tracker.load_files()?;
        Ok(tracker)
    }

    /// Topic name
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Topic directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Total bytes ever appended
    pub fn max_offset(&self) -> u64 {
        self.state.lock().max_offset
    }

    /// Snapshot of the segment list
    pub fn files(&self) -> Vec<SegmentFile> {
        self.state.lock().files.clone()
    }

    /// Active (last) segment, if any
    pub fn last_file(&self) -> Option<SegmentFile> {
        self.state.lock().files.last().cloned()
    }

    /// Reload the segment list from disk and recompute the max offset
    pub fn load_files(&self) -> Result<()> {
        let mut files = Vec::new();
        match fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        files.push(SegmentFile::from_path(entry.path())?);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        files.sort_by(|a, b| a.name().cmp(b.name()));

        let max_offset = match files.last() {
            Some(last) => last.offset() + last.size()?,
            None => 0,
        };

        tracing::debug!(
            topic = %self.topic,
            files = files.len(),
            max_offset,
            "loaded segments"
        );

        let mut state = self.state.lock();
        state.files = files;
        state.max_offset = max_offset;
        Ok(())
    }

    /// Start a new segment at the current max offset
    ///
    /// The new (empty) file becomes visible to every registered cursor. An
    /// empty last segment is returned as is instead of creating a second file
    /// with the same start offset.
    pub fn add_new_file(&self) -> Result<SegmentFile> {
        fs::create_dir_all(&self.dir)?;

        let mut state = self.state.lock();
        if let Some(last) = state.files.last() {
            if last.offset() == state.max_offset && last.size()? == 0 {
                return Ok(last.clone());
            }
        }

        let path = self.dir.join(encode_name(state.max_offset, Utc::now()));
        OpenOptions::new().create(true).append(true).open(&path)?;
        let segment = SegmentFile::from_path(path)?;

        tracing::debug!(topic = %self.topic, file = segment.name(), "rolled new segment");

        state.files.push(segment.clone());
        for consumer in &state.consumers {
            consumer.add_file(segment.clone());
        }
        Ok(segment)
    }

    /// Restart a topic without segments at `offset`
    ///
    /// Cleaning up every segment of a topic loses its max offset across a
    /// restart. An empty segment named with the last replicated offset
    /// restores it, so appends continue the offset sequence. Registered
    /// cursors are moved to `offset`. Does nothing when segments exist or
    /// the max offset is already at or past `offset`.
    pub fn resume_at(&self, offset: u64) -> Result<()> {
        let _active = self.active.lock();
        let mut state = self.state.lock();
        if !state.files.is_empty() || state.max_offset >= offset {
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(encode_name(offset, Utc::now()));
        OpenOptions::new().create(true).append(true).open(&path)?;
        let segment = SegmentFile::from_path(path)?;

        state.files.push(segment.clone());
        state.max_offset = offset;
        for consumer in &state.consumers {
            consumer.reset(&state.files, offset, offset)?;
        }
        drop(state);

        tracing::info!(topic = %self.topic, file = segment.name(), "resumed empty topic");
        Ok(())
    }

    /// Record `length` bytes written to the active segment and wake listeners
    pub fn appended_bytes(&self, length: u64) {
        let (max_offset, listeners) = self.record_append(length);
        self.notify(max_offset, listeners);
    }

    fn record_append(&self, length: u64) -> (u64, Vec<DataListener>) {
        let mut state = self.state.lock();
        state.max_offset += length;
        for consumer in &state.consumers {
            consumer.add_data(length);
        }
        let listeners = state.listeners.iter().map(|(_, l)| l.clone()).collect();
        (state.max_offset, listeners)
    }

    fn notify(&self, max_offset: u64, listeners: Vec<DataListener>) {
        for listener in listeners {
            listener(&self.topic, max_offset);
        }
    }

    /// Append `data` to the active segment, rolling first when the active
    /// segment is missing or longer than `roll_size`. Returns the new max
    /// offset.
    pub fn append(&self, data: &[u8], roll_size: u64) -> Result<u64> {
        let mut active = self.active.lock();
        let (max_offset, listeners) = self.write_active(&mut active, data, roll_size)?;
        drop(active);
        self.notify(max_offset, listeners);
        Ok(max_offset)
    }

    /// Append `data` only if it starts exactly at the current max offset
    ///
    /// The check and the write happen under the append lock, so concurrent
    /// appends cannot slip in between.
    pub fn append_at(&self, offset: u64, data: &[u8], roll_size: u64) -> Result<AppendAt> {
        let mut active = self.active.lock();
        let max_offset = self.max_offset();
        if offset != max_offset {
            return Ok(AppendAt::Mismatch { max_offset });
        }
        if data.is_empty() {
            return Ok(AppendAt::Appended(max_offset));
        }
        let (max_offset, listeners) = self.write_active(&mut active, data, roll_size)?;
        drop(active);
        self.notify(max_offset, listeners);
        Ok(AppendAt::Appended(max_offset))
    }

    fn write_active(
        &self,
        active: &mut Option<ActiveSegment>,
        data: &[u8],
        roll_size: u64,
    ) -> Result<(u64, Vec<DataListener>)> {
        let segment = match self.last_file() {
            Some(last) if last.size()? <= roll_size => last,
            _ => self.add_new_file()?,
        };

        let reopen = active
            .as_ref()
            .is_none_or(|a| a.path.as_path() != segment.path());
        if reopen {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(segment.path())?;
            *active = Some(ActiveSegment {
                path: segment.path().to_path_buf(),
                file,
            });
        }
        let Some(current) = active.as_mut() else {
            return Err(Error::replication("active segment not open"));
        };

        let before = current.file.metadata()?.len();
        if let Err(e) = current.file.write_all(data) {
            tracing::error!(
                topic = %self.topic,
                file = segment.name(),
                error = %e,
                "segment write failed, truncating back to {}",
                before
            );
            if let Err(truncate) = current.file.set_len(before) {
                tracing::error!(topic = %self.topic, error = %truncate, "segment truncate failed");
            }
            *active = None;
            return Err(e.into());
        }

        Ok(self.record_append(data.len() as u64))
    }

    /// Force the active segment to stable storage
    pub fn sync(&self) -> Result<()> {
        if let Some(active) = self.active.lock().as_ref() {
            active.file.sync_data()?;
        }
        Ok(())
    }

    /// Minimum offset over registered cursors, or the max offset with none
    pub fn gating_sequence(&self) -> u64 {
        self.state.lock().gating_sequence()
    }

    /// Create and register a cursor positioned at `start_offset`
    pub fn new_consumer(
        self: &Arc<Self>,
        name: impl Into<String>,
        start_offset: u64,
    ) -> Result<Arc<ConsumerCursor>> {
        let cursor = Arc::new(ConsumerCursor::new(
            name.into(),
            self.topic.clone(),
            Arc::downgrade(self),
        ));

        let mut state = self.state.lock();
        cursor.reset(&state.files, state.max_offset, start_offset)?;
        state.consumers.push(cursor.clone());

        tracing::debug!(
            topic = %self.topic,
            consumer = cursor.name(),
            offset = start_offset,
            "registered consumer"
        );
        Ok(cursor)
    }

    /// Unregister a cursor; returns false if it was not registered here
    pub fn remove_consumer(&self, cursor: &Arc<ConsumerCursor>) -> bool {
        let mut state = self.state.lock();
        let before = state.consumers.len();
        state.consumers.retain(|c| !Arc::ptr_eq(c, cursor));
        state.consumers.len() != before
    }

    /// Number of registered cursors
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Register a callback for newly appended data
    pub fn add_data_listener(&self, listener: DataListener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.state.lock().listeners.push((id, listener));
        id
    }

    /// Remove a callback registered with [`add_data_listener`](Self::add_data_listener)
    pub fn remove_data_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    /// Drop every cursor and listener (topic removal)
    pub fn close(&self) {
        let mut active = self.active.lock();
        let mut state = self.state.lock();
        state.consumers.clear();
        state.listeners.clear();
        *active = None;
    }

    /// Reposition `cursor` against the current segment list
    pub(crate) fn reposition(&self, cursor: &ConsumerCursor, offset: u64) -> Result<()> {
        let state = self.state.lock();
        cursor.reset(&state.files, state.max_offset, offset)
    }

    /// Delete the oldest segments that every cursor has moved past and that
    /// are older than `retain`. The active segment is never deleted.
    ///
    /// Returns true when the topic had no segments and its directory was
    /// removed.
    pub fn cleanup_files(&self, retain: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if state.files.is_empty() {
            self.remove_dir()?;
            return Ok(true);
        }
        let gating = state.gating_sequence();
        self.cleanup_sealed(&mut state, retain, gating)?;
        Ok(false)
    }

    /// Like [`cleanup_files`](Self::cleanup_files), but may also delete the
    /// last segment when `external_gating` proves it fully replicated.
    ///
    /// The effective gating sequence is the smaller of `external_gating` and
    /// the tracker's own. The last segment's age is taken from its
    /// modification time, since it may have been written to long after it
    /// was created. Returns true when the topic directory was removed.
    pub fn cleanup_all_files(&self, retain: Duration, external_gating: u64) -> Result<bool> {
        // hold the append lock so no write lands in a file being removed
        let mut active = self.active.lock();
        let mut state = self.state.lock();
        if state.files.is_empty() {
            self.remove_dir()?;
            return Ok(true);
        }
        let gating = state.gating_sequence().min(external_gating);
        self.cleanup_sealed(&mut state, retain, gating)?;

        if state.files.len() > 1 || gating < state.max_offset {
            return Ok(false);
        }
        let Some(last) = state.files.last().cloned() else {
            return Ok(false);
        };
        let modified = fs::metadata(last.path())?.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age < retain {
            return Ok(false);
        }

        remove_file(last.path())?;
        *active = None;
        state.files.clear();
        tracing::info!(
            topic = %self.topic,
            file = last.name(),
            max_offset = state.max_offset,
            "deleted last segment of fully replicated topic"
        );

        self.remove_dir()?;
        Ok(true)
    }

    fn cleanup_sealed(&self, state: &mut TrackerState, retain: Duration, gating: u64) -> Result<()> {
        let now = Utc::now();
        while state.files.len() > 1 {
            if gating < state.files[1].offset() {
                break;
            }
            let oldest = &state.files[0];
            let age = now
                .signed_duration_since(oldest.created()?)
                .to_std()
                .unwrap_or_default();
            if age < retain {
                break;
            }

            remove_file(oldest.path())?;
            tracing::info!(
                topic = %self.topic,
                file = oldest.name(),
                gating,
                "deleted segment"
            );
            state.files.remove(0);
        }
        Ok(())
    }

    fn remove_dir(&self) -> Result<()> {
        match fs::remove_dir(&self.dir) {
            Ok(()) => {
                tracing::info!(topic = %self.topic, dir = ?self.dir, "removed empty topic directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
