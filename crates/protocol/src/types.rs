//! Wire constants and context types

/// Message context assigned by the sending endpoint.
///
/// Strictly increasing from 1 per channel instance, never reused.
pub type MessageContext = u64;

/// Sentinel context meaning "no context".
///
/// Legal only as a response context; no endpoint ever issues it as a
/// message context.
pub const UNKNOWN_CONTEXT: MessageContext = u64::MAX;

/// Start byte of every framed message
pub const START_BYTE: u8 = 0x47;

/// Fixed header length: start byte + total length (i32) + message context
/// (u64) + response context (u64) + type code (u64)
pub const HEADER_LEN: usize = 29;

/// Per-attribute fixed overhead on the wire (two i32 length fields)
pub const ATTR_OVERHEAD: usize = 8;

/// Type code reserved for handshake public-key messages
pub const HANDSHAKE_PUBLIC_KEY_TYPE: u64 = 4391;

/// Type code reserved for handshake wrapped-key-material messages
pub const HANDSHAKE_KEY_MATERIAL_TYPE: u64 = 4392;

/// Type code reserved for secure-channel envelopes
pub const SECURE_ENVELOPE_TYPE: u64 = 7919;

/// Attribute carrying the handshake public key blob
pub const ATTR_PUBLIC_KEY: &str = "R";

/// Attribute carrying the wrapped symmetric IV
pub const ATTR_WRAPPED_IV: &str = "V";

/// Attribute carrying the wrapped symmetric key
pub const ATTR_WRAPPED_KEY: &str = "K";

/// Attribute carrying the secure-channel ciphertext
pub const ATTR_ENVELOPE: &str = "M";
