//! Block writer
//!
//! Entries are buffered per topic and flushed as one compressed block into
//! the topic's active segment. [`LogWriter`] does the work synchronously;
//! [`AsyncLogWriter`] runs it on a background thread fed by a bounded
//! channel, flushing on size, on a timer, on demand and at shutdown.

use crate::block::{DEFAULT_COMPRESSION_LEVEL, append_entry, frame_block};
use crate::registry::TrackerRegistry;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default segment roll size for locally written topics
pub const DEFAULT_ROLL_SIZE: u64 = 32 << 10;

/// Configuration for the block writer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Active segment size after which the next block starts a new segment
    pub roll_size: u64,
    /// zstd compression level
    pub compression_level: i32,
    /// Buffered bytes per topic that trigger a flush
    pub max_buffer_bytes: usize,
    /// Maximum time entries stay buffered
    pub flush_interval: Duration,
    /// Command channel capacity of the async writer
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            roll_size: DEFAULT_ROLL_SIZE,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_buffer_bytes: 64 << 10,
            flush_interval: Duration::from_millis(500),
            channel_capacity: 1024,
        }
    }
}

impl WriterConfig {
    /// Set the roll size
    pub fn with_roll_size(mut self, roll_size: u64) -> Self {
        self.roll_size = roll_size;
        self
    }

    /// Set the flush interval
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the per-topic buffer threshold
    pub fn with_max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.roll_size == 0 {
            return Err("roll_size must be > 0".to_string());
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err("compression_level must be between 1 and 22".to_string());
        }
        // a block must fit the 4-byte raw length field
        if self.max_buffer_bytes == 0 || self.max_buffer_bytes as u64 > u32::MAX as u64 / 2 {
            return Err("max_buffer_bytes must be > 0 and below 2 GiB".to_string());
        }
        if self.flush_interval.is_zero() {
            return Err("flush_interval must be > 0".to_string());
        }
        if self.channel_capacity == 0 {
            return Err("channel_capacity must be > 0".to_string());
        }
        Ok(())
    }
}

/// Writer statistics
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    /// Entries accepted
    pub entries_added: u64,
    /// Blocks appended to segments
    pub blocks_written: u64,
    /// Raw (uncompressed) bytes written
    pub raw_bytes: u64,
    /// Bytes appended to segments
    pub stored_bytes: u64,
    /// Blocks dropped after a failed append
    pub failed_blocks: u64,
}

/// Synchronous per-topic block writer
pub struct LogWriter {
    registry: Arc<TrackerRegistry>,
    config: WriterConfig,
    buffers: HashMap<String, Vec<u8>>,
    stats: Arc<Mutex<WriterStats>>,
}

impl LogWriter {
    /// Create a writer appending to trackers of `registry`
    pub fn new(registry: Arc<TrackerRegistry>, config: WriterConfig) -> Self {
        Self {
            registry,
            config,
            buffers: HashMap::new(),
            stats: Arc::new(Mutex::new(WriterStats::default())),
        }
    }

    /// Configuration
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Buffer one entry, flushing the topic once its buffer is full
    pub fn add(&mut self, topic: &str, entry: &[u8]) -> Result<()> {
        let buffer = self.buffers.entry(topic.to_string()).or_default();
        append_entry(buffer, entry);
        let full = buffer.len() >= self.config.max_buffer_bytes;
        self.stats.lock().entries_added += 1;

        if full {
            self.flush_topic(topic)?;
        }
        Ok(())
    }

    /// Bytes buffered across all topics
    pub fn buffered_bytes(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }

    /// Write the buffered entries of `topic` as one block
    ///
    /// On failure the block is dropped; the segment has already been
    /// truncated back by the tracker.
    pub fn flush_topic(&mut self, topic: &str) -> Result<()> {
        let raw = match self.buffers.get_mut(topic) {
            Some(buffer) if !buffer.is_empty() => std::mem::take(buffer),
            _ => return Ok(()),
        };

        let result = frame_block(&raw, self.config.compression_level).and_then(|block| {
            let tracker = self.registry.get(topic)?;
            tracker.append(&block, self.config.roll_size)?;
            Ok(block.len())
        });

        let mut stats = self.stats.lock();
        match result {
            Ok(stored) => {
                stats.blocks_written += 1;
                stats.raw_bytes += raw.len() as u64;
                stats.stored_bytes += stored as u64;
                tracing::trace!(topic, raw = raw.len(), stored, "flushed block");
                Ok(())
            }
            Err(e) => {
                stats.failed_blocks += 1;
                tracing::error!(topic, raw = raw.len(), error = %e, "dropping block after failed append");
                Err(e)
            }
        }
    }

    /// Flush every topic; returns the first error after trying all of them
    pub fn flush(&mut self) -> Result<()> {
        let topics: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect();

        let mut first_error = None;
        for topic in topics {
            if let Err(e) = self.flush_topic(&topic) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Current statistics
    pub fn stats(&self) -> WriterStats {
        self.stats.lock().clone()
    }
}

/// Commands sent to the writer thread
enum WriterCommand {
    /// Buffer an entry
    Append { topic: String, entry: Vec<u8> },
    /// Flush everything and report back
    Flush(Sender<Result<()>>),
    /// Flush and stop
    Shutdown,
}

/// [`LogWriter`] running on a background thread
pub struct AsyncLogWriter {
    sender: Sender<WriterCommand>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WriterStats>>,
}

impl AsyncLogWriter {
    /// Start the writer thread
    pub fn new(registry: Arc<TrackerRegistry>, config: WriterConfig) -> Result<Self> {
        config.validate().map_err(Error::config)?;

        let (sender, receiver) = bounded(config.channel_capacity);
        let writer = LogWriter::new(registry, config);
        let stats = writer.stats.clone();

        let handle = thread::Builder::new()
            .name("logsync-writer".to_string())
            .spawn(move || Self::writer_thread(writer, receiver))?;

        Ok(Self {
            sender,
            handle: Some(handle),
            stats,
        })
    }

    /// Queue an entry for `topic`; blocks while the channel is full
    pub fn append(&self, topic: impl Into<String>, entry: impl Into<Vec<u8>>) -> Result<()> {
        self.sender
            .send(WriterCommand::Append {
                topic: topic.into(),
                entry: entry.into(),
            })
            .map_err(|_| Error::writer("writer thread stopped"))
    }

    /// Flush all buffered entries and wait for the result
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.sender
            .send(WriterCommand::Flush(tx))
            .map_err(|_| Error::writer("writer thread stopped"))?;
        rx.recv()
            .map_err(|_| Error::writer("writer thread stopped before flushing"))?
    }

    /// Current statistics
    pub fn stats(&self) -> WriterStats {
        self.stats.lock().clone()
    }

    /// Flush and stop the writer thread
    pub fn shutdown(&mut self) -> Result<()> {
        let _ = self.sender.send(WriterCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| Error::writer("writer thread panicked"))?;
        }
        Ok(())
    }

    fn writer_thread(mut writer: LogWriter, receiver: Receiver<WriterCommand>) {
        let interval = writer.config().flush_interval;
        let mut last_flush = Instant::now();

        loop {
            let timeout = interval.saturating_sub(last_flush.elapsed());
            match receiver.recv_timeout(timeout) {
                Ok(WriterCommand::Append { topic, entry }) => {
                    // errors are logged and counted by the writer
                    let _ = writer.add(&topic, &entry);
                    if last_flush.elapsed() >= interval {
                        let _ = writer.flush();
                        last_flush = Instant::now();
                    }
                }
                Ok(WriterCommand::Flush(reply)) => {
                    let _ = reply.send(writer.flush());
                    last_flush = Instant::now();
                }
                Ok(WriterCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let _ = writer.flush();
                    last_flush = Instant::now();
                }
            }
        }

        if let Err(e) = writer.flush() {
            tracing::error!(error = %e, "final writer flush failed");
        }
        tracing::debug!("writer thread stopped");
    }
}

impl Drop for AsyncLogWriter {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_entries;
    use crate::storage::LogStorage;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Arc<TrackerRegistry> {
        Arc::new(TrackerRegistry::new(LogStorage::new(dir.path())))
    }

    fn entries(registry: &TrackerRegistry, topic: &str) -> Vec<Vec<u8>> {
        let tracker = registry.get(topic).unwrap();
        let cursor = tracker.new_consumer("test", 0).unwrap();
        let mut out = Vec::new();
        read_entries(&cursor, None, |entry| {
            out.push(entry.to_vec());
            Ok(())
        })
        .unwrap();
        tracker.remove_consumer(&cursor);
        out
    }

    #[test]
    fn test_config_validation() {
        assert!(WriterConfig::default().validate().is_ok());
        assert!(WriterConfig::default().with_roll_size(0).validate().is_err());
        assert!(
            WriterConfig::default()
                .with_flush_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_flush_writes_one_block_per_topic() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let mut writer = LogWriter::new(registry.clone(), WriterConfig::default());

        writer.add("a", b"one").unwrap();
        writer.add("a", b"two").unwrap();
        writer.add("b", b"three").unwrap();
        assert!(writer.buffered_bytes() > 0);
        writer.flush().unwrap();
        assert_eq!(writer.buffered_bytes(), 0);

        let stats = writer.stats();
        assert_eq!(stats.entries_added, 3);
        assert_eq!(stats.blocks_written, 2);
        assert_eq!(
            stats.stored_bytes,
            registry.get("a").unwrap().max_offset() + registry.get("b").unwrap().max_offset()
        );
        assert_eq!(entries(&registry, "a"), vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(entries(&registry, "b"), vec![b"three".to_vec()]);
    }

    #[test]
    fn test_full_buffer_flushes_and_rolls() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let config = WriterConfig::default()
            .with_roll_size(256)
            .with_max_buffer_bytes(200);
        let mut writer = LogWriter::new(registry.clone(), config);

        let mut expected = Vec::new();
        for i in 0..200u32 {
            let entry: Vec<u8> = (0..40u32).map(|j| (i * 31 + j * 7) as u8).collect();
            writer.add("t", &entry).unwrap();
            expected.push(entry);
        }
        writer.flush().unwrap();

        assert!(registry.get("t").unwrap().files().len() > 1);
        assert_eq!(entries(&registry, "t"), expected);
    }

    #[test]
    fn test_async_writer_flushes_on_demand_and_drop() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let config = WriterConfig::default().with_flush_interval(Duration::from_secs(60));

        let writer = AsyncLogWriter::new(registry.clone(), config.clone()).unwrap();
        writer.append("t", b"first".to_vec()).unwrap();
        writer.flush().unwrap();
        assert_eq!(entries(&registry, "t"), vec![b"first".to_vec()]);

        writer.append("t", b"second".to_vec()).unwrap();
        drop(writer);
        assert_eq!(
            entries(&registry, "t"),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        assert_eq!(registry.get("t").unwrap().consumer_count(), 0);
    }

    #[test]
    fn test_async_writer_flushes_on_interval() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let config = WriterConfig::default().with_flush_interval(Duration::from_millis(20));

        let writer = AsyncLogWriter::new(registry.clone(), config).unwrap();
        writer.append("t", b"tick".to_vec()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while writer.stats().blocks_written == 0 {
            assert!(Instant::now() < deadline, "interval flush never happened");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(registry.get("t").unwrap().max_offset() > 0);
    }
}
