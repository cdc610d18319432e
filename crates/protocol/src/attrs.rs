//! Keyed attribute bundles and their wire codec
//!
//! A message payload is a flat sequence of records, each record being
//! key-length (i32 LE) ‖ key bytes (ASCII) ‖ value-length (i32 LE) ‖ value
//! bytes, repeated until the payload ends. Keys are unique within a bundle
//! and wire order is preserved on decode.

use crate::error::{ProtocolError, Result};
use crate::types::ATTR_OVERHEAD;
use bytes::{BufMut, Bytes, BytesMut};

/// An insertion-ordered attribute bundle with unique ASCII keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    entries: Vec<(String, Bytes)>,
}

impl Attributes {
    /// Create an empty bundle
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an attribute, replacing the value in place if the key exists.
    ///
    /// Fails if the key contains bytes outside the ASCII range; the wire
    /// format does not define non-ASCII keys.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Result<()> {
        let key = key.into();
        if !key.is_ascii() {
            return Err(ProtocolError::NonAsciiKey);
        }
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key, value)),
        }
        Ok(())
    }

    /// Look up a value by key
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bundle is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate attributes in wire order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Encoded payload length in bytes, without any framing header.
    ///
    /// Computed in u64 so oversize bundles report their true size instead
    /// of wrapping.
    pub fn encoded_len(&self) -> u64 {
        self.entries
            .iter()
            .map(|(k, v)| (ATTR_OVERHEAD + k.len() + v.len()) as u64)
            .sum()
    }

    /// Append the wire encoding of every record to `buf`.
    ///
    /// Fails with [`ProtocolError::ValueTooLong`] if any single value
    /// exceeds the i32 length field.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        for (key, value) in &self.entries {
            // Keys are ASCII-checked at insert; only values can realistically
            // overflow the length field.
            let value_len = i32::try_from(value.len()).map_err(|_| ProtocolError::ValueTooLong {
                key: key.clone(),
                len: value.len(),
            })?;
            buf.put_i32_le(key.len() as i32);
            buf.put_slice(key.as_bytes());
            buf.put_i32_le(value_len);
            buf.put_slice(value);
        }
        Ok(())
    }

    /// Encode to a standalone payload blob
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len().min(u64::from(u32::MAX)) as usize);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a payload blob, consuming it exactly.
    ///
    /// Rejects negative lengths, truncated records, non-ASCII keys, and
    /// duplicate keys.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let mut attrs = Self::new();
        while !data.is_empty() {
            let (key_len, rest) = take_i32(data)?;
            if key_len < 0 {
                return Err(ProtocolError::NegativeLength(key_len));
            }
            let (key_bytes, rest) = take_bytes(rest, key_len as usize)?;
            if !key_bytes.is_ascii() {
                return Err(ProtocolError::NonAsciiKey);
            }
            // ASCII is always valid UTF-8
            let key = String::from_utf8_lossy(key_bytes).into_owned();

            let (value_len, rest) = take_i32(rest)?;
            if value_len < 0 {
                return Err(ProtocolError::NegativeLength(value_len));
            }
            let (value, rest) = take_bytes(rest, value_len as usize)?;

            if attrs.contains(&key) {
                return Err(ProtocolError::DuplicateKey(key));
            }
            attrs.entries.push((key, Bytes::copy_from_slice(value)));
            data = rest;
        }
        Ok(attrs)
    }
}

fn take_i32(data: &[u8]) -> Result<(i32, &[u8])> {
    if data.len() < 4 {
        return Err(ProtocolError::Truncated {
            expected: 4,
            actual: data.len(),
        });
    }
    let (head, rest) = data.split_at(4);
    let value = i32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    Ok((value, rest))
}

fn take_bytes(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            actual: data.len(),
        });
    }
    Ok(data.split_at(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_roundtrip() {
        let attrs = Attributes::new();
        let blob = attrs.encode().unwrap();
        assert!(blob.is_empty());
        assert_eq!(Attributes::decode(&blob).unwrap(), attrs);
    }

    #[test]
    fn test_roundtrip_preserves_order() {
        let mut attrs = Attributes::new();
        attrs.insert("foo", &[1u8, 2, 3][..]).unwrap();
        attrs.insert("bar", Bytes::new()).unwrap();
        let blob = attrs.encode().unwrap();
        // 4+3+4+3 for "foo", 4+3+4+0 for "bar"
        assert_eq!(blob.len(), 25);
        let decoded = Attributes::decode(&blob).unwrap();
        assert_eq!(decoded, attrs);
        let keys: Vec<&str> = decoded.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["foo", "bar"]);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut attrs = Attributes::new();
        attrs.insert("a", &[1u8][..]).unwrap();
        attrs.insert("b", &[2u8][..]).unwrap();
        attrs.insert("a", &[9u8][..]).unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.get("a").unwrap().as_ref(), &[9u8]);
        let keys: Vec<&str> = attrs.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b"]);
    }

    #[test]
    fn test_non_ascii_key_rejected() {
        let mut attrs = Attributes::new();
        assert_eq!(
            attrs.insert("käse", Bytes::new()),
            Err(ProtocolError::NonAsciiKey)
        );
    }

    #[test]
    fn test_negative_value_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(1);
        buf.put_slice(b"k");
        buf.put_i32_le(-5);
        assert_eq!(
            Attributes::decode(&buf),
            Err(ProtocolError::NegativeLength(-5))
        );
    }

    #[test]
    fn test_negative_key_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(-1);
        assert_eq!(
            Attributes::decode(&buf),
            Err(ProtocolError::NegativeLength(-1))
        );
    }

    #[test]
    fn test_truncated_record_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(3);
        buf.put_slice(b"ke"); // one byte short
        assert!(matches!(
            Attributes::decode(&buf),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut buf = BytesMut::new();
        for _ in 0..2 {
            buf.put_i32_le(1);
            buf.put_slice(b"x");
            buf.put_i32_le(0);
        }
        assert_eq!(
            Attributes::decode(&buf),
            Err(ProtocolError::DuplicateKey("x".into()))
        );
    }
}
