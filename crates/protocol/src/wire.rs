//! Binary wire format: frame header and full-frame codec
//!
//! ```text
//! ┌────────────┬──────────────────┬──────────────────┬──────────────────┬──────────────┬─────────┐
//! │ start (1)  │ total length     │ message context  │ response context │ type code    │ payload │
//! │   0x47     │ i32 LE           │ u64 LE           │ u64 LE           │ u64 LE       │  ...    │
//! └────────────┴──────────────────┴──────────────────┴──────────────────┴──────────────┴─────────┘
//! ```
//!
//! The header is fixed at 29 bytes and `total length` always equals
//! 29 + Σ(8 + key-len + value-len) over the payload's attribute records.

use crate::attrs::Attributes;
use crate::error::{ProtocolError, Result};
use crate::types::{HEADER_LEN, START_BYTE};
use bytes::{BufMut, Bytes, BytesMut};

/// Parsed frame header.
///
/// Parsing is structural only; call [`FrameHeader::validate`] to enforce the
/// start byte. Keeping the two apart lets a receiver that sees a corrupt
/// start byte still drain the announced payload and stay aligned on the
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Start byte as read off the wire
    pub start_byte: u8,
    /// Message context assigned by the sender
    pub context: u64,
    /// Response context, or `UNKNOWN_CONTEXT`
    pub response_context: u64,
    /// Application type code
    pub type_code: u64,
    /// Payload length announced by the total-length field
    pub payload_len: usize,
}

impl FrameHeader {
    /// Parse a 29-byte header.
    ///
    /// Fails if the buffer is short or the total-length field is negative
    /// or smaller than the header itself.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }
        let start_byte = buf[0];
        let total_length = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if total_length < HEADER_LEN as i32 {
            return Err(ProtocolError::LengthOutOfRange(total_length));
        }
        let context = u64::from_le_bytes([
            buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11], buf[12],
        ]);
        let response_context = u64::from_le_bytes([
            buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19], buf[20],
        ]);
        let type_code = u64::from_le_bytes([
            buf[21], buf[22], buf[23], buf[24], buf[25], buf[26], buf[27], buf[28],
        ]);
        Ok(Self {
            start_byte,
            context,
            response_context,
            type_code,
            payload_len: total_length as usize - HEADER_LEN,
        })
    }

    /// Enforce the protocol start byte
    pub fn validate(&self) -> Result<()> {
        if self.start_byte != START_BYTE {
            return Err(ProtocolError::InvalidStartByte(self.start_byte));
        }
        Ok(())
    }
}

/// A complete message frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message context assigned by the sender
    pub context: u64,
    /// Response context, or `UNKNOWN_CONTEXT`
    pub response_context: u64,
    /// Application type code
    pub type_code: u64,
    /// Attribute payload
    pub attrs: Attributes,
}

impl Frame {
    /// Encode header and payload into a single buffer.
    ///
    /// Fails with [`ProtocolError::ValueTooLong`] for an oversize attribute
    /// value and [`ProtocolError::FrameTooLong`] when the total length
    /// overflows the i32 length field.
    pub fn encode(&self) -> Result<Bytes> {
        let payload_len = self.attrs.encoded_len();
        let total = HEADER_LEN as u64 + payload_len;
        if total > i32::MAX as u64 {
            return Err(ProtocolError::FrameTooLong(total as usize));
        }

        let mut buf = BytesMut::with_capacity(total as usize);
        buf.put_u8(START_BYTE);
        buf.put_i32_le(total as i32);
        buf.put_u64_le(self.context);
        buf.put_u64_le(self.response_context);
        buf.put_u64_le(self.type_code);
        self.attrs.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a complete frame from a single buffer.
    ///
    /// The buffer must contain exactly the bytes the header announces.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = FrameHeader::parse(data)?;
        header.validate()?;
        let payload = &data[HEADER_LEN..];
        if payload.len() != header.payload_len {
            return Err(ProtocolError::Truncated {
                expected: header.payload_len,
                actual: payload.len(),
            });
        }
        Ok(Self {
            context: header.context,
            response_context: header.response_context,
            type_code: header.type_code,
            attrs: Attributes::decode(payload)?,
        })
    }
}
