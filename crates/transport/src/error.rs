//! Transport layer errors

use graywire_protocol::ProtocolError;
use std::io;
use thiserror::Error;

/// Transport layer result type
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport layer errors
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// IO error
    #[error("IO error: {message}")]
    Io {
        /// Error message
        message: String,
    },

    /// Protocol error from the wire layer
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Operation on a channel that is not connected
    #[error("channel is not connected")]
    NotConnected,

    /// Operation on a disposed object
    #[error("object is disposed")]
    Disposed,

    /// Handshake failure
    #[error("handshake failed: {0}")]
    Handshake(HandshakeFailure),

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    Config {
        /// Error message
        message: String,
    },
}

impl TransportError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

// Manual From to keep the error cloneable
impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io {
            message: err.to_string(),
        }
    }
}

/// Reasons a handshake terminates without yielding a secure channel
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// The underlying channel reported disconnection
    #[error("channel disconnected")]
    ChannelDisconnected,

    /// The underlying channel reported an error
    #[error("channel error: {0}")]
    ChannelError(String),

    /// A handshake message arrived with the wrong shape
    #[error("handshake format error: {0}")]
    Format(String),

    /// Asymmetric decryption of the wrapped key material failed
    #[error("asymmetric decryption failed: {0}")]
    DecryptionFailed(String),

    /// Local key material could not be generated or exported
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

/// Which operation an [`Error`](crate::channel::ChannelEvent::Error) event
/// refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An inbound frame could not be received or parsed
    MessageReceiveFailed,
    /// An outbound message could not be accepted or written
    MessageSendFailed,
    /// A single outbound attribute value exceeds the wire length field
    MessageTooLong,
}

/// Why an [`Error`](crate::channel::ChannelEvent::Error) event fired.
///
/// Stream-level failures never surface here; they take the fatal
/// `Disconnected` path instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    /// Malformed frame or payload
    ProtocolError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts_and_clones() {
        let err = TransportError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        let cloned = err.clone();
        assert!(matches!(cloned, TransportError::Io { .. }));
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: TransportError = ProtocolError::InvalidStartByte(0x12).into();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::InvalidStartByte(0x12))
        ));
    }
}
