//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Header is shorter than the fixed header size
    #[error("invalid frame header")]
    InvalidHeader,

    /// Magic bytes do not match
    #[error("invalid magic bytes: {0:#04x} {1:#04x}")]
    InvalidMagic(u8, u8),

    /// Protocol version is not supported
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Payload exceeds maximum size
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Payload failed to serialize or deserialize
    #[error("payload codec error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The connection has been closed locally
    #[error("connection closed")]
    ConnectionClosed,

    /// A read did not complete within its deadline
    #[error("read timed out")]
    ReadTimeout,

    /// A write did not complete within its deadline
    #[error("write timed out")]
    WriteTimeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error is a transient read deadline expiry.
    ///
    /// Read timeouts are the only recoverable transport error: the caller
    /// may retry the read. Every other variant leaves the stream unusable.
    pub fn is_read_timeout(&self) -> bool {
        matches!(self, ProtocolError::ReadTimeout)
    }
}
