//! Graywire transport layer
//!
//! Point-to-point secure messaging channels over any duplex byte stream:
//! the serialized read pump, the framed message channel, the two-step
//! asymmetric handshake, and the symmetric-encryption overlay.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod channel;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod read_pump;
pub mod secure;

pub use channel::{ChannelEvent, MessageChannel};
pub use error::{ErrorKind, ErrorReason, HandshakeFailure, Result, TransportError};
pub use handshake::{HandshakeConfig, HandshakeEvent, Handshaker};
pub use listener::{ChannelListener, ListenerConfig, ListenerEvent};
pub use secure::{SecureChannel, SecureErrorKind, SecureEvent};
