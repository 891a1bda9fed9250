//! Segment replication over TCP
//!
//! A [`SyncClient`](client::SyncClient) on the producing node streams the
//! raw bytes of every registered topic to a [`SyncService`](service::SyncService)
//! on the storing node, which appends them verbatim to its own segments.
//!
//! Flow control is stop-and-wait per topic: one PUBLISH in flight, the cursor
//! advances only on PUBACK. A PUBNAK/RESET re-seeks the cursor to the
//! service's offset; a PUBNAK/FAILURE is retried after a backoff.

pub mod client;
pub mod config;
pub mod offset_store;
pub mod service;

pub use client::{ClientStats, SyncClient, TopicProgress};
pub use config::SyncConfig;
pub use offset_store::{FileOffsetStore, OffsetStore};
pub use service::{
    PublishHandler, PublishOutcome, ServiceStats, SyncService, TopicReceiveStats,
    TrackerStoreHandler,
};

use bytes::Bytes;
use std::time::Duration;

/// Default service port
pub const DEFAULT_PORT: u16 = 7620;

/// Largest PUBLISH payload
pub const MAX_CHUNK_SIZE: u64 = 1 << 20;

/// Roll size of segments written by the service
pub const SERVICE_ROLL_SIZE: u64 = 32 << 20;

/// Age of an unacknowledged PUBLISH that gets logged
pub const ACK_WARNING_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Bytes copied from a producer's segment file
///
/// The payload of a PUBLISH is a byte range of block-encoded segment data,
/// not application entries. The service stores it unchanged, so its segments
/// decode with the same block codec as the producer's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentChunk(Bytes);

impl SegmentChunk {
    /// Wrap bytes taken from a segment file
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Raw segment bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for an empty chunk
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Unwrap into the underlying buffer
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}
