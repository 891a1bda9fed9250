//! logsync core - segment logs, consumer cursors and replication
//!
//! Each topic is an append-only byte log split into segment files named by
//! their starting offset. Producers write compressed blocks of entries,
//! consumers walk the segments with cursors, and the sync client mirrors
//! every topic byte for byte to a remote sync service.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        LogWriter / AsyncLogWriter            │
//! │     (per-topic buffers, zstd blocks)         │
//! └──────────────┬──────────────────────────────┘
//!                │ append
//! ┌──────────────┴──────────────────────────────┐
//! │   TrackerRegistry -> TopicLogTracker         │
//! │  (segment list, max offset, roll, cleanup)   │
//! └──────┬───────────────────────┬──────────────┘
//!        │ cursors               │ data listeners
//! ┌──────┴────────────┐   ┌──────┴──────────────┐
//! │  ConsumerCursor   │◄──│     SyncClient       │── PUBLISH ──► SyncService
//! │ (offset, segment) │   │ (stop-and-wait/topic)│◄─ ACK/NAK ───
//! └───────────────────┘   └─────────────────────┘
//! ```
//!
//! Segment files live under `<root>/<topic>/` and are named
//! `<20-digit start offset>.<YYYYMMDDhhmmss>`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod consumer;
pub mod error;
pub mod reader;
pub mod registry;
pub mod retry;
pub mod segment;
pub mod storage;
pub mod sync;
pub mod tracker;
pub mod writer;

pub use consumer::{ConsumerCursor, SegmentRegion};
pub use error::{Error, Result};
pub use reader::{TopicChecksum, read_entries, topic_checksum};
pub use registry::{TrackerEventListener, TrackerRegistry};
pub use retry::{Backoff, RetryConfig};
pub use segment::SegmentFile;
pub use storage::LogStorage;
pub use sync::{
    FileOffsetStore, OffsetStore, SegmentChunk, SyncClient, SyncConfig, SyncService,
};
pub use tracker::{AppendAt, DataListener, ListenerId, TopicLogTracker};
pub use writer::{AsyncLogWriter, LogWriter, WriterConfig, WriterStats};
