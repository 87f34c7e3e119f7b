//! The cache's typed value shapes (§3 DATA MODEL) and their wire encoding.
//!
//! A key holds exactly one [`ValueShape`] at a time. The wire encoding here
//! is shared by the client protocol's binary-object ops and by cluster
//! replication/snapshot messages, which both need to move a whole shape
//! rather than a single scalar.

use std::collections::HashMap;

use bytes::{Buf, BufMut};

use crate::wire::frame::{get_bytes_checked, get_text_checked, put_bytes, put_text};
use crate::wire::tagged::TaggedValue;
use crate::wire::varint::VarUint;
use crate::WireError;

const SHAPE_STRING: u8 = 0;
const SHAPE_BYTES: u8 = 1;
const SHAPE_LIST: u8 = 2;
const SHAPE_MAP: u8 = 3;
const SHAPE_COUNTER: u8 = 4;

/// The value stored under a key. See §3 for the invariants each variant
/// carries (e.g. counters always have infinite TTL).
#[derive(Debug, Clone, PartialEq)]
pub enum ValueShape {
    String(Option<String>),
    Bytes(Option<Vec<u8>>),
    List(Vec<String>),
    Map(HashMap<String, TaggedValue>),
    Counter(i64),
}

impl ValueShape {
    /// Name used in shape-mismatch error text.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ValueShape::String(_) => "string",
            ValueShape::Bytes(_) => "bytes",
            ValueShape::List(_) => "list",
            ValueShape::Map(_) => "map",
            ValueShape::Counter(_) => "counter",
        }
    }

    fn shape_tag(&self) -> u8 {
        match self {
            ValueShape::String(_) => SHAPE_STRING,
            ValueShape::Bytes(_) => SHAPE_BYTES,
            ValueShape::List(_) => SHAPE_LIST,
            ValueShape::Map(_) => SHAPE_MAP,
            ValueShape::Counter(_) => SHAPE_COUNTER,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.shape_tag());
        match self {
            ValueShape::String(v) => encode_optional_text(buf, v.as_deref()),
            ValueShape::Bytes(v) => encode_optional_bytes(buf, v.as_deref()),
            ValueShape::List(items) => {
                VarUint::new(items.len() as u64).encode(buf);
                for item in items {
                    put_text(buf, item);
                }
            }
            ValueShape::Map(map) => {
                VarUint::new(map.len() as u64).encode(buf);
                for (k, v) in map {
                    put_text(buf, k);
                    v.encode(buf);
                }
            }
            ValueShape::Counter(n) => buf.put_i64(*n),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if !buf.has_remaining() {
            return Err(WireError::Truncated);
        }
        Ok(match buf.get_u8() {
            SHAPE_STRING => ValueShape::String(decode_optional_text(buf)?),
            SHAPE_BYTES => ValueShape::Bytes(decode_optional_bytes(buf)?),
            SHAPE_LIST => {
                let len = VarUint::decode(buf).ok_or(WireError::Truncated)?.value() as usize;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(get_text_checked(buf)?);
                }
                ValueShape::List(items)
            }
            SHAPE_MAP => {
                let len = VarUint::decode(buf).ok_or(WireError::Truncated)?.value() as usize;
                let mut map = HashMap::with_capacity(len.min(4096));
                for _ in 0..len {
                    let key = get_text_checked(buf)?;
                    let value = TaggedValue::decode(buf)?;
                    map.insert(key, value);
                }
                ValueShape::Map(map)
            }
            SHAPE_COUNTER => {
                if buf.remaining() < 8 {
                    return Err(WireError::Truncated);
                }
                ValueShape::Counter(buf.get_i64())
            }
            other => return Err(WireError::UnknownTag(other)),
        })
    }
}

fn encode_optional_text(buf: &mut impl BufMut, v: Option<&str>) {
    match v {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_text(buf, s);
        }
    }
}

fn decode_optional_text(buf: &mut impl Buf) -> Result<Option<String>, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Truncated);
    }
    match buf.get_u8() {
        0 => Ok(None),
        _ => Ok(Some(get_text_checked(buf)?)),
    }
}

fn encode_optional_bytes(buf: &mut impl BufMut, v: Option<&[u8]>) {
    match v {
        None => buf.put_u8(0),
        Some(b) => {
            buf.put_u8(1);
            put_bytes(buf, b);
        }
    }
}

fn decode_optional_bytes(buf: &mut impl Buf) -> Result<Option<Vec<u8>>, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Truncated);
    }
    match buf.get_u8() {
        0 => Ok(None),
        _ => Ok(Some(get_bytes_checked(buf)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(shape: ValueShape) {
        let mut buf = BytesMut::new();
        shape.encode(&mut buf);
        let mut read = buf.freeze();
        assert_eq!(ValueShape::decode(&mut read).unwrap(), shape);
    }

    #[test]
    fn round_trips_every_shape() {
        round_trip(ValueShape::String(Some("Mimoria".into())));
        round_trip(ValueShape::String(None));
        round_trip(ValueShape::Bytes(Some(vec![1, 2, 3, 4])));
        round_trip(ValueShape::List(vec!["a".into(), "b".into()]));
        round_trip(ValueShape::Counter(-7));

        let mut map = HashMap::new();
        map.insert("one".to_string(), TaggedValue::F32(2.4));
        map.insert("three".to_string(), TaggedValue::String("value".into()));
        round_trip(ValueShape::Map(map));
    }

    #[test]
    fn kind_name_matches_variant() {
        assert_eq!(ValueShape::Counter(0).kind_name(), "counter");
        assert_eq!(ValueShape::List(vec![]).kind_name(), "list");
    }
}
