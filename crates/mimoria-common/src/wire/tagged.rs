//! The `TaggedValue` wire type used as map entries: a 1-byte tag followed by
//! the natural encoding for that tag.

use bytes::{Buf, BufMut};

use super::frame::{get_bytes_checked, get_text_checked, put_bytes, put_text};
use crate::WireError;

const TAG_NULL: u8 = 0;
const TAG_I64: u8 = 1;
const TAG_F32: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_BYTES: u8 = 6;

/// A dynamically-typed scalar, used for map values on the wire and in memory.
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedValue {
    Null,
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl TaggedValue {
    pub fn tag(&self) -> u8 {
        match self {
            TaggedValue::Null => TAG_NULL,
            TaggedValue::I64(_) => TAG_I64,
            TaggedValue::F32(_) => TAG_F32,
            TaggedValue::F64(_) => TAG_F64,
            TaggedValue::Bool(_) => TAG_BOOL,
            TaggedValue::String(_) => TAG_STRING,
            TaggedValue::Bytes(_) => TAG_BYTES,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag());
        match self {
            TaggedValue::Null => {}
            TaggedValue::I64(v) => buf.put_i64(*v),
            TaggedValue::F32(v) => buf.put_f32(*v),
            TaggedValue::F64(v) => buf.put_f64(*v),
            TaggedValue::Bool(v) => buf.put_u8(if *v { 1 } else { 0 }),
            TaggedValue::String(v) => put_text(buf, v),
            TaggedValue::Bytes(v) => put_bytes(buf, v),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if !buf.has_remaining() {
            return Err(WireError::Truncated);
        }
        let tag = buf.get_u8();
        Ok(match tag {
            TAG_NULL => TaggedValue::Null,
            TAG_I64 => {
                if buf.remaining() < 8 {
                    return Err(WireError::Truncated);
                }
                TaggedValue::I64(buf.get_i64())
            }
            TAG_F32 => {
                if buf.remaining() < 4 {
                    return Err(WireError::Truncated);
                }
                TaggedValue::F32(buf.get_f32())
            }
            TAG_F64 => {
                if buf.remaining() < 8 {
                    return Err(WireError::Truncated);
                }
                TaggedValue::F64(buf.get_f64())
            }
            TAG_BOOL => {
                if !buf.has_remaining() {
                    return Err(WireError::Truncated);
                }
                TaggedValue::Bool(buf.get_u8() != 0)
            }
            TAG_STRING => TaggedValue::String(get_text_checked(buf)?),
            TAG_BYTES => TaggedValue::Bytes(get_bytes_checked(buf)?),
            other => return Err(WireError::UnknownTag(other)),
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TaggedValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(v: TaggedValue) {
        let mut buf = BytesMut::new();
        v.encode(&mut buf);
        let mut read = buf.freeze();
        let decoded = TaggedValue::decode(&mut read).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(TaggedValue::Null);
        round_trip(TaggedValue::I64(-42));
        round_trip(TaggedValue::F32(2.4));
        round_trip(TaggedValue::F64(2.4));
        round_trip(TaggedValue::Bool(true));
        round_trip(TaggedValue::String("value".into()));
        round_trip(TaggedValue::Bytes(vec![1, 2, 3, 4]));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xFF]);
        let mut read = buf.freeze();
        assert!(matches!(
            TaggedValue::decode(&mut read),
            Err(WireError::UnknownTag(0xFF))
        ));
    }
}
