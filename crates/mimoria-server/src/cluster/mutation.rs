//! The set of cache mutations the replicator ships to followers (§4.I).
//! Each variant carries exactly what the follower needs to replay the
//! write without re-deriving it, so per-key ordering at the follower
//! matches the leader's regardless of delivery batching.

use std::collections::HashMap;

use bytes::{Buf, BufMut};
use mimoria_common::wire::frame::{get_bytes_checked, get_text_checked, put_bytes, put_text};
use mimoria_common::wire::varint::VarUint;
use mimoria_common::{TaggedValue, ValueShape, WireError};

use crate::cache::Cache;

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    SetString {
        key: Vec<u8>,
        value: Option<String>,
        ttl_ms: u64,
    },
    SetBytes {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        ttl_ms: u64,
    },
    AddList {
        key: Vec<u8>,
        value: String,
        ttl_ms: u64,
    },
    RemoveList {
        key: Vec<u8>,
        value: String,
    },
    SetCounter {
        key: Vec<u8>,
        value: i64,
    },
    IncrementCounter {
        key: Vec<u8>,
        delta: i64,
    },
    SetMapValue {
        key: Vec<u8>,
        sub: String,
        value: TaggedValue,
    },
    SetMap {
        key: Vec<u8>,
        map: HashMap<String, TaggedValue>,
        ttl_ms: u64,
    },
    Delete {
        key: Vec<u8>,
    },
    /// Whole-shape overwrite via `SetObjectBinary` (§6) — the one mutating
    /// client op with no narrower typed counterpart.
    SetObject {
        key: Vec<u8>,
        value: ValueShape,
        ttl_ms: u64,
    },
}

const TAG_SET_STRING: u8 = 0;
const TAG_SET_BYTES: u8 = 1;
const TAG_ADD_LIST: u8 = 2;
const TAG_REMOVE_LIST: u8 = 3;
const TAG_SET_COUNTER: u8 = 4;
const TAG_INCREMENT_COUNTER: u8 = 5;
const TAG_SET_MAP_VALUE: u8 = 6;
const TAG_SET_MAP: u8 = 7;
const TAG_DELETE: u8 = 8;
const TAG_SET_OBJECT: u8 = 9;

impl Mutation {
    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::SetString { key, .. }
            | Mutation::SetBytes { key, .. }
            | Mutation::AddList { key, .. }
            | Mutation::RemoveList { key, .. }
            | Mutation::SetCounter { key, .. }
            | Mutation::IncrementCounter { key, .. }
            | Mutation::SetMapValue { key, .. }
            | Mutation::SetMap { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::SetObject { key, .. } => key,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self {
            Mutation::SetString { key, value, ttl_ms } => {
                buf.put_u8(TAG_SET_STRING);
                put_bytes(buf, key);
                match value {
                    None => buf.put_u8(0),
                    Some(v) => {
                        buf.put_u8(1);
                        put_text(buf, v);
                    }
                }
                VarUint::new(*ttl_ms).encode(buf);
            }
            Mutation::SetBytes { key, value, ttl_ms } => {
                buf.put_u8(TAG_SET_BYTES);
                put_bytes(buf, key);
                match value {
                    None => buf.put_u8(0),
                    Some(v) => {
                        buf.put_u8(1);
                        put_bytes(buf, v);
                    }
                }
                VarUint::new(*ttl_ms).encode(buf);
            }
            Mutation::AddList { key, value, ttl_ms } => {
                buf.put_u8(TAG_ADD_LIST);
                put_bytes(buf, key);
                put_text(buf, value);
                VarUint::new(*ttl_ms).encode(buf);
            }
            Mutation::RemoveList { key, value } => {
                buf.put_u8(TAG_REMOVE_LIST);
                put_bytes(buf, key);
                put_text(buf, value);
            }
            Mutation::SetCounter { key, value } => {
                buf.put_u8(TAG_SET_COUNTER);
                put_bytes(buf, key);
                buf.put_i64(*value);
            }
            Mutation::IncrementCounter { key, delta } => {
                buf.put_u8(TAG_INCREMENT_COUNTER);
                put_bytes(buf, key);
                buf.put_i64(*delta);
            }
            Mutation::SetMapValue { key, sub, value } => {
                buf.put_u8(TAG_SET_MAP_VALUE);
                put_bytes(buf, key);
                put_text(buf, sub);
                value.encode(buf);
            }
            Mutation::SetMap { key, map, ttl_ms } => {
                buf.put_u8(TAG_SET_MAP);
                put_bytes(buf, key);
                VarUint::new(map.len() as u64).encode(buf);
                for (k, v) in map {
                    put_text(buf, k);
                    v.encode(buf);
                }
                VarUint::new(*ttl_ms).encode(buf);
            }
            Mutation::Delete { key } => {
                buf.put_u8(TAG_DELETE);
                put_bytes(buf, key);
            }
            Mutation::SetObject { key, value, ttl_ms } => {
                buf.put_u8(TAG_SET_OBJECT);
                put_bytes(buf, key);
                value.encode(buf);
                VarUint::new(*ttl_ms).encode(buf);
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if !buf.has_remaining() {
            return Err(WireError::Truncated);
        }
        let tag = buf.get_u8();
        let key = get_bytes_checked(buf)?;
        Ok(match tag {
            TAG_SET_STRING => {
                let has_value = buf.has_remaining() && buf.get_u8() != 0;
                let value = if has_value {
                    Some(get_text_checked(buf)?)
                } else {
                    None
                };
                let ttl_ms = VarUint::decode(buf).ok_or(WireError::Truncated)?.value();
                Mutation::SetString { key, value, ttl_ms }
            }
            TAG_SET_BYTES => {
                let has_value = buf.has_remaining() && buf.get_u8() != 0;
                let value = if has_value {
                    Some(get_bytes_checked(buf)?)
                } else {
                    None
                };
                let ttl_ms = VarUint::decode(buf).ok_or(WireError::Truncated)?.value();
                Mutation::SetBytes { key, value, ttl_ms }
            }
            TAG_ADD_LIST => {
                let value = get_text_checked(buf)?;
                let ttl_ms = VarUint::decode(buf).ok_or(WireError::Truncated)?.value();
                Mutation::AddList { key, value, ttl_ms }
            }
            TAG_REMOVE_LIST => Mutation::RemoveList {
                key,
                value: get_text_checked(buf)?,
            },
            TAG_SET_COUNTER => {
                if buf.remaining() < 8 {
                    return Err(WireError::Truncated);
                }
                Mutation::SetCounter {
                    key,
                    value: buf.get_i64(),
                }
            }
            TAG_INCREMENT_COUNTER => {
                if buf.remaining() < 8 {
                    return Err(WireError::Truncated);
                }
                Mutation::IncrementCounter {
                    key,
                    delta: buf.get_i64(),
                }
            }
            TAG_SET_MAP_VALUE => {
                let sub = get_text_checked(buf)?;
                let value = TaggedValue::decode(buf)?;
                Mutation::SetMapValue { key, sub, value }
            }
            TAG_SET_MAP => {
                let len = VarUint::decode(buf).ok_or(WireError::Truncated)?.value() as usize;
                let mut map = HashMap::with_capacity(len.min(4096));
                for _ in 0..len {
                    let k = get_text_checked(buf)?;
                    let v = TaggedValue::decode(buf)?;
                    map.insert(k, v);
                }
                let ttl_ms = VarUint::decode(buf).ok_or(WireError::Truncated)?.value();
                Mutation::SetMap { key, map, ttl_ms }
            }
            TAG_DELETE => Mutation::Delete { key },
            TAG_SET_OBJECT => {
                let value = ValueShape::decode(buf)?;
                let ttl_ms = VarUint::decode(buf).ok_or(WireError::Truncated)?.value();
                Mutation::SetObject { key, value, ttl_ms }
            }
            other => return Err(WireError::UnknownTag(other)),
        })
    }

    /// Apply this mutation to `cache` with the key lock bypassed and no
    /// stats recorded — the follower-apply path (§4.I).
    pub async fn apply(&self, cache: &Cache) {
        match self {
            Mutation::SetString { key, value, ttl_ms } => {
                cache.set_string(key, value.clone(), *ttl_ms, false).await
            }
            Mutation::SetBytes { key, value, ttl_ms } => {
                cache.set_bytes(key, value.clone(), *ttl_ms, false).await
            }
            Mutation::AddList { key, value, ttl_ms } => {
                let _ = cache
                    .add_list(key, Some(value.clone()), *ttl_ms, false)
                    .await;
            }
            Mutation::RemoveList { key, value } => {
                let _ = cache.remove_list(key, Some(value.clone()), false).await;
            }
            Mutation::SetCounter { key, value } => cache.set_counter(key, *value, false).await,
            Mutation::IncrementCounter { key, delta } => cache.increment_counter_raw(key, *delta),
            Mutation::SetMapValue { key, sub, value } => {
                let _ = cache
                    .set_map_value(key, sub, value.clone(), false)
                    .await;
            }
            Mutation::SetMap { key, map, ttl_ms } => {
                cache.set_map(key, map.clone(), *ttl_ms, false).await
            }
            Mutation::Delete { key } => cache.delete(key, false).await,
            Mutation::SetObject { key, value, ttl_ms } => {
                cache.set_object(key, value.clone(), *ttl_ms, false).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(m: Mutation) {
        let mut buf = BytesMut::new();
        m.encode(&mut buf);
        let mut read = buf.freeze();
        assert_eq!(Mutation::decode(&mut read).unwrap(), m);
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Mutation::SetString {
            key: b"k".to_vec(),
            value: Some("v".into()),
            ttl_ms: 0,
        });
        round_trip(Mutation::SetBytes {
            key: b"k".to_vec(),
            value: None,
            ttl_ms: 500,
        });
        round_trip(Mutation::AddList {
            key: b"k".to_vec(),
            value: "v".into(),
            ttl_ms: 0,
        });
        round_trip(Mutation::RemoveList {
            key: b"k".to_vec(),
            value: "v".into(),
        });
        round_trip(Mutation::SetCounter {
            key: b"k".to_vec(),
            value: 42,
        });
        round_trip(Mutation::IncrementCounter {
            key: b"k".to_vec(),
            delta: -3,
        });
        round_trip(Mutation::Delete { key: b"k".to_vec() });
        round_trip(Mutation::SetObject {
            key: b"k".to_vec(),
            value: ValueShape::List(vec!["a".into(), "b".into()]),
            ttl_ms: 0,
        });
    }
}
