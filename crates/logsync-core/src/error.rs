//! Error types for logsync core

use thiserror::Error;

/// Result type alias using the core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for segment storage and replication
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from segment files and sockets
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A segment file name that does not decode
    #[error("Invalid segment name: {0}")]
    InvalidSegmentName(String),

    /// On-disk data that fails validation (block header, decompressed length)
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Consecutive segments whose offsets do not line up
    #[error("Segment discontinuity: {0}")]
    Discontinuity(String),

    /// Requested offset lies beyond what has been written
    #[error("Invalid offset {offset}: max offset is {max_offset}")]
    InvalidOffset {
        /// Requested offset
        offset: u64,
        /// Current max offset of the topic
        max_offset: u64,
    },

    /// Requested offset belongs to segments already deleted
    #[error("Offset {offset} was deleted: first available offset is {first_offset}")]
    OffsetDeleted {
        /// Requested offset
        offset: u64,
        /// Start offset of the oldest segment still on disk
        first_offset: u64,
    },

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] logsync_protocol::Error),

    /// Background block writer errors
    #[error("Writer error: {0}")]
    Writer(String),

    /// Replication session errors
    #[error("Replication error: {0}")]
    Replication(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Retryable errors (temporary failures)
    #[error("Retryable error: {0}")]
    Retryable(String),
}

impl Error {
    /// Create an invalid segment name error
    pub fn invalid_segment_name(msg: impl Into<String>) -> Self {
        Self::InvalidSegmentName(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a discontinuity error
    pub fn discontinuity(msg: impl Into<String>) -> Self {
        Self::Discontinuity(msg.into())
    }

    /// Create a writer error
    pub fn writer(msg: impl Into<String>) -> Self {
        Self::Writer(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Invariant violations that must stop processing of the affected topic
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidSegmentName(_)
                | Self::Corruption(_)
                | Self::Discontinuity(_)
                | Self::InvalidOffset { .. }
                | Self::OffsetDeleted { .. }
        )
    }
}
