//! Error types for the logsync wire protocol

use thiserror::Error;

/// Result type alias using the protocol Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while encoding or decoding packets
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from the underlying frame transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet ended before a declared field was complete
    #[error("Truncated packet: {0}")]
    Truncated(String),

    /// Packet header or field holds a value outside the protocol
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// Varint longer than a u64 can hold
    #[error("Varint overflow")]
    VarintOverflow,

    /// Encoded packet does not fit in one frame
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

impl Error {
    /// Create a truncated-packet error
    pub fn truncated(msg: impl Into<String>) -> Self {
        Self::Truncated(msg.into())
    }

    /// Create a malformed-packet error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}
