//! Order-preserving row key encoding.

use std::fmt;

use warden_proto::Value;

use crate::error::Error;

const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_STR: u8 = 0x03;

/// One component of a row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl KeyPart {
    /// Key component for a scalar value; null, floats and compound values
    /// cannot be keys.
    pub fn from_value(value: &Value) -> Option<KeyPart> {
        match value {
            Value::Bool(b) => Some(KeyPart::Bool(*b)),
            Value::Int32(_) | Value::Int64(_) => value.as_i64().map(KeyPart::Int),
            Value::String(s) => Some(KeyPart::Str(s.clone())),
            _ => None,
        }
    }

    /// Whether this component equals a field value (with integer widening).
    pub fn matches(&self, value: &Value) -> bool {
        KeyPart::from_value(value).as_ref() == Some(self)
    }
}

/// A (possibly composite) row key.
///
/// Encoding: each component is a tag byte followed by its payload.
/// Integers are big-endian with the sign bit flipped and strings escape
/// `0x00` as `0x00 0xFF` and end with `0x00 0x00`, so byte order matches
/// value order and sled scans return rows in key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey(Vec<KeyPart>);

impl RowKey {
    /// Create a key from its components.
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Single-component key.
    pub fn single(part: KeyPart) -> Self {
        Self(vec![part])
    }

    /// Build a key from field values, failing on any non-key value.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Option<Self> {
        values
            .into_iter()
            .map(KeyPart::from_value)
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// The only component of a single-column key.
    pub fn as_single(&self) -> Option<&KeyPart> {
        match self.0.as_slice() {
            [part] => Some(part),
            _ => None,
        }
    }

    /// Encode the key to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() * 9);
        for part in &self.0 {
            match part {
                KeyPart::Bool(b) => {
                    buf.push(TAG_BOOL);
                    buf.push(u8::from(*b));
                }
                KeyPart::Int(i) => {
                    buf.push(TAG_INT);
                    buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
                }
                KeyPart::Str(s) => {
                    buf.push(TAG_STR);
                    for byte in s.as_bytes() {
                        buf.push(*byte);
                        if *byte == 0 {
                            buf.push(0xFF);
                        }
                    }
                    buf.extend_from_slice(&[0, 0]);
                }
            }
        }
        buf
    }

    /// Decode a key from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut parts = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let tag = bytes[pos];
            pos += 1;
            match tag {
                TAG_BOOL => {
                    let byte = *bytes.get(pos).ok_or(Error::InvalidKey)?;
                    parts.push(KeyPart::Bool(byte != 0));
                    pos += 1;
                }
                TAG_INT => {
                    let raw: [u8; 8] = bytes
                        .get(pos..pos + 8)
                        .and_then(|slice| slice.try_into().ok())
                        .ok_or(Error::InvalidKey)?;
                    parts.push(KeyPart::Int((u64::from_be_bytes(raw) ^ (1 << 63)) as i64));
                    pos += 8;
                }
                TAG_STR => {
                    let mut text = Vec::new();
                    loop {
                        let byte = *bytes.get(pos).ok_or(Error::InvalidKey)?;
                        pos += 1;
                        if byte != 0 {
                            text.push(byte);
                            continue;
                        }
                        match bytes.get(pos) {
                            Some(0) => {
                                pos += 1;
                                break;
                            }
                            Some(0xFF) => {
                                text.push(0);
                                pos += 1;
                            }
                            _ => return Err(Error::InvalidKey),
                        }
                    }
                    let text = String::from_utf8(text).map_err(|_| Error::InvalidKey)?;
                    parts.push(KeyPart::Str(text));
                }
                _ => return Err(Error::InvalidKey),
            }
        }
        Ok(Self(parts))
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bool(b) => write!(f, "{}", b),
            KeyPart::Int(i) => write!(f, "{}", i),
            KeyPart::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_single() {
            Some(part) => write!(f, "{}", part),
            None => {
                f.write_str("(")?;
                for (i, part) in self.0.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", part)?;
                }
                f.write_str(")")
            }
        }
    }
}
