//! Error types for the graywire protocol

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame start byte did not match the protocol start byte
    #[error("invalid start byte: 0x{0:02x}")]
    InvalidStartByte(u8),

    /// Declared frame length is negative or smaller than the header
    #[error("frame length out of range: {0}")]
    LengthOutOfRange(i32),

    /// Buffer does not contain the bytes its length fields announce
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes announced by the length fields
        expected: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// An attribute record declared a negative length
    #[error("negative attribute length: {0}")]
    NegativeLength(i32),

    /// An attribute key contained bytes outside the ASCII range
    #[error("attribute key is not ASCII")]
    NonAsciiKey,

    /// The same attribute key appeared twice in one message
    #[error("duplicate attribute key: {0:?}")]
    DuplicateKey(String),

    /// A single attribute value exceeds the wire length field
    #[error("attribute value too long: {len} bytes (key {key:?})")]
    ValueTooLong {
        /// Key of the offending attribute
        key: String,
        /// Value length in bytes
        len: usize,
    },

    /// The serialized frame exceeds the wire length field
    #[error("frame too long: {0} bytes")]
    FrameTooLong(usize),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl ProtocolError {
    /// Create a crypto error from any displayable source
    pub fn crypto(err: impl std::fmt::Display) -> Self {
        Self::Crypto(err.to_string())
    }
}

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
