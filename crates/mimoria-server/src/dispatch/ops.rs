//! Per-operation handlers (§4.C, §6). Each handler decodes its payload from
//! the shared `buf` cursor, does the work, and returns the response body —
//! the caller in [`super::Dispatcher`] wraps it with the shared
//! header/status framing.
//!
//! Field layouts are not dictated by the spec beyond `Login`, `GetStats`,
//! and `TaggedValue`; the rest follow the buffer's own primitives (§4.A):
//! keys and list/map text are var-uint-length-prefixed, optional scalars get
//! a one-byte presence flag ahead of the value, counts are var-uint.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mimoria_common::ops::bulk_op_is_supported;
use mimoria_common::wire::frame::{
    get_bytes_checked, get_optional_bytes, get_optional_text, get_text_checked, put_optional_bytes,
    put_optional_text, put_text,
};
use mimoria_common::wire::varint::VarUint;
use mimoria_common::{ClientOp, Status, TaggedValue, ValueShape, WireError};

use crate::cluster::Mutation;
use crate::error::ConnectionError;
use crate::net::ConnectionHandle;

use super::Dispatcher;

/// Route one already-authenticated, non-`Login` operation. `Err` becomes an
/// `Error` response carrying the message as its text body.
pub async fn route(
    dispatcher: &Dispatcher,
    conn: &Arc<ConnectionHandle>,
    op: ClientOp,
    buf: &mut Bytes,
) -> Result<BytesMut, String> {
    match op {
        ClientOp::Login => unreachable!("Login is handled before routing"),

        ClientOp::GetString => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let value = dispatcher
                .state
                .cache
                .get_string(&key, true)
                .await
                .map_err(|e| e.to_string())?;
            let mut body = BytesMut::new();
            put_optional_text(&mut body, value.as_deref());
            Ok(body)
        }

        ClientOp::SetString => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let value = get_optional_text(buf).map_err(|e| e.to_string())?;
            let ttl_ms = decode_varuint(buf)?;
            dispatcher
                .state
                .cache
                .set_string(&key, value.clone(), ttl_ms, true)
                .await;
            dispatcher
                .maybe_replicate(Mutation::SetString { key, value, ttl_ms })
                .await;
            Ok(BytesMut::new())
        }

        ClientOp::GetBytes => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let value = dispatcher
                .state
                .cache
                .get_bytes(&key, true)
                .await
                .map_err(|e| e.to_string())?;
            let mut body = BytesMut::new();
            put_optional_bytes(&mut body, value.as_deref());
            Ok(body)
        }

        ClientOp::SetBytes => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let value = get_optional_bytes(buf).map_err(|e| e.to_string())?;
            let ttl_ms = decode_varuint(buf)?;
            dispatcher
                .state
                .cache
                .set_bytes(&key, value.clone(), ttl_ms, true)
                .await;
            dispatcher
                .maybe_replicate(Mutation::SetBytes { key, value, ttl_ms })
                .await;
            Ok(BytesMut::new())
        }

        ClientOp::GetList => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let items = dispatcher
                .state
                .cache
                .get_list(&key, true)
                .await
                .map_err(|e| e.to_string())?;
            let mut body = BytesMut::new();
            VarUint::new(items.len() as u64).encode(&mut body);
            for item in items {
                put_text(&mut body, &item);
            }
            Ok(body)
        }

        ClientOp::AddList => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let value = get_optional_text(buf).map_err(|e| e.to_string())?;
            let ttl_ms = decode_varuint(buf)?;
            dispatcher
                .state
                .cache
                .add_list(&key, value.clone(), ttl_ms, true)
                .await
                .map_err(|e| e.to_string())?;
            if let Some(v) = value {
                dispatcher
                    .maybe_replicate(Mutation::AddList { key, value: v, ttl_ms })
                    .await;
            }
            Ok(BytesMut::new())
        }

        ClientOp::RemoveList => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let value = get_optional_text(buf).map_err(|e| e.to_string())?;
            dispatcher
                .state
                .cache
                .remove_list(&key, value.clone(), true)
                .await
                .map_err(|e| e.to_string())?;
            if let Some(v) = value {
                dispatcher
                    .maybe_replicate(Mutation::RemoveList { key, value: v })
                    .await;
            }
            Ok(BytesMut::new())
        }

        ClientOp::ContainsList => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let value = get_text_checked(buf).map_err(|e| e.to_string())?;
            let found = dispatcher
                .state
                .cache
                .contains_list(&key, &value, true)
                .await
                .map_err(|e| e.to_string())?;
            let mut body = BytesMut::new();
            body.put_u8(found as u8);
            Ok(body)
        }

        ClientOp::Exists => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let exists = dispatcher.state.cache.exists(&key, true).await;
            let mut body = BytesMut::new();
            body.put_u8(exists as u8);
            Ok(body)
        }

        ClientOp::Delete => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            dispatcher.state.cache.delete(&key, true).await;
            dispatcher.maybe_replicate(Mutation::Delete { key }).await;
            Ok(BytesMut::new())
        }

        ClientOp::GetObjectBinary => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let mut body = BytesMut::new();
            match dispatcher.state.cache.get_object(&key, true).await {
                Some(shape) => {
                    body.put_u8(1);
                    shape.encode(&mut body);
                }
                None => body.put_u8(0),
            }
            Ok(body)
        }

        ClientOp::SetObjectBinary => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let ttl_ms = decode_varuint(buf)?;
            let value = ValueShape::decode(buf).map_err(|e| e.to_string())?;
            dispatcher
                .state
                .cache
                .set_object(&key, value.clone(), ttl_ms, true)
                .await;
            dispatcher
                .maybe_replicate(Mutation::SetObject { key, value, ttl_ms })
                .await;
            Ok(BytesMut::new())
        }

        ClientOp::GetStats => {
            let mut body = BytesMut::new();
            VarUint::new(dispatcher.state.uptime_secs()).encode(&mut body);
            body.put_u64(dispatcher.state.connection_count.load(Ordering::SeqCst));
            body.put_u64(dispatcher.state.cache.size() as u64);
            body.put_u64(dispatcher.state.cache.stats.hits());
            body.put_u64(dispatcher.state.cache.stats.misses());
            body.put_f32(dispatcher.state.cache.stats.hit_ratio());
            Ok(body)
        }

        ClientOp::SetCounter => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let value = decode_i64(buf)?;
            dispatcher.state.cache.set_counter(&key, value, true).await;
            dispatcher
                .maybe_replicate(Mutation::SetCounter { key, value })
                .await;
            Ok(BytesMut::new())
        }

        ClientOp::IncrementCounter => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let delta = decode_i64(buf)?;
            let new_value = dispatcher
                .state
                .cache
                .increment_counter(&key, delta, true)
                .await
                .map_err(|e| e.to_string())?;
            dispatcher
                .maybe_replicate(Mutation::IncrementCounter { key, delta })
                .await;
            let mut body = BytesMut::new();
            body.put_i64(new_value);
            Ok(body)
        }

        ClientOp::Bulk => run_bulk(dispatcher, buf).await,

        ClientOp::GetMapValue => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let sub = get_text_checked(buf).map_err(|e| e.to_string())?;
            let value = dispatcher
                .state
                .cache
                .get_map_value(&key, &sub, true)
                .await
                .map_err(|e| e.to_string())?;
            let mut body = BytesMut::new();
            value.encode(&mut body);
            Ok(body)
        }

        ClientOp::SetMapValue => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let sub = get_text_checked(buf).map_err(|e| e.to_string())?;
            let value = TaggedValue::decode(buf).map_err(|e| e.to_string())?;
            // Container TTL argument accepted on the wire, ignored (§4.C, §9).
            let _ttl_ms = decode_varuint(buf)?;
            dispatcher
                .state
                .cache
                .set_map_value(&key, &sub, value.clone(), true)
                .await
                .map_err(|e| e.to_string())?;
            dispatcher
                .maybe_replicate(Mutation::SetMapValue { key, sub, value })
                .await;
            Ok(BytesMut::new())
        }

        ClientOp::GetMap => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let map = dispatcher
                .state
                .cache
                .get_map(&key, true)
                .await
                .map_err(|e| e.to_string())?;
            let mut body = BytesMut::new();
            VarUint::new(map.len() as u64).encode(&mut body);
            for (k, v) in map {
                put_text(&mut body, &k);
                v.encode(&mut body);
            }
            Ok(body)
        }

        ClientOp::SetMap => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let map = decode_map(buf)?;
            let ttl_ms = decode_varuint(buf)?;
            dispatcher
                .state
                .cache
                .set_map(&key, map.clone(), ttl_ms, true)
                .await;
            dispatcher
                .maybe_replicate(Mutation::SetMap { key, map, ttl_ms })
                .await;
            Ok(BytesMut::new())
        }

        ClientOp::Subscribe => {
            let channel = get_text_checked(buf).map_err(|e| e.to_string())?;
            let tx = conn.subscription_sender();
            dispatcher.state.pubsub.subscribe(&channel, conn.subscriber_id(), tx);
            Ok(BytesMut::new())
        }

        ClientOp::Unsubscribe => {
            let channel = get_text_checked(buf).map_err(|e| e.to_string())?;
            dispatcher.state.pubsub.unsubscribe(&channel, conn.subscriber_id());
            Ok(BytesMut::new())
        }

        ClientOp::Publish => {
            let channel = get_text_checked(buf).map_err(|e| e.to_string())?;
            let value = TaggedValue::decode(buf).map_err(|e| e.to_string())?;
            dispatcher.state.pubsub.publish(&channel, value).await;
            Ok(BytesMut::new())
        }
    }
}

fn decode_varuint(buf: &mut Bytes) -> Result<u64, String> {
    VarUint::decode(buf)
        .map(|v| v.value())
        .ok_or_else(|| WireError::Truncated.to_string())
}

fn decode_i64(buf: &mut Bytes) -> Result<i64, String> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated.to_string());
    }
    Ok(buf.get_i64())
}

fn decode_map(buf: &mut Bytes) -> Result<HashMap<String, TaggedValue>, String> {
    let len = decode_varuint(buf)? as usize;
    let mut map = HashMap::with_capacity(len.min(4096));
    for _ in 0..len {
        let k = get_text_checked(buf).map_err(|e| e.to_string())?;
        let v = TaggedValue::decode(buf).map_err(|e| e.to_string())?;
        map.insert(k, v);
    }
    Ok(map)
}

/// Outcome of one sub-request inside a `Bulk` envelope: either it produced
/// a body, or it failed at the cache-operation level (still leaves `buf`
/// correctly positioned for the next sub-request, unlike a wire-decode
/// failure, which aborts the whole envelope since the cursor can no longer
/// be trusted).
enum SubOutcome {
    Body(BytesMut),
    Failed(String),
}

/// The spec resolves the open question of unsupported bulk sub-operations
/// as "reject with an error response" (§9); this only ever runs the subset
/// `bulk_op_is_supported` allows (`GetString`, `SetString`, `Exists`,
/// `Delete`).
async fn run_bulk_sub(dispatcher: &Dispatcher, op: ClientOp, buf: &mut Bytes) -> Result<SubOutcome, String> {
    match op {
        ClientOp::GetString => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            match dispatcher.state.cache.get_string(&key, true).await {
                Ok(value) => {
                    let mut body = BytesMut::new();
                    put_optional_text(&mut body, value.as_deref());
                    Ok(SubOutcome::Body(body))
                }
                Err(e) => Ok(SubOutcome::Failed(e.to_string())),
            }
        }
        ClientOp::SetString => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let value = get_optional_text(buf).map_err(|e| e.to_string())?;
            let ttl_ms = decode_varuint(buf)?;
            dispatcher
                .state
                .cache
                .set_string(&key, value.clone(), ttl_ms, true)
                .await;
            dispatcher
                .maybe_replicate(Mutation::SetString { key, value, ttl_ms })
                .await;
            Ok(SubOutcome::Body(BytesMut::new()))
        }
        ClientOp::Exists => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            let exists = dispatcher.state.cache.exists(&key, true).await;
            let mut body = BytesMut::new();
            body.put_u8(exists as u8);
            Ok(SubOutcome::Body(body))
        }
        ClientOp::Delete => {
            let key = get_bytes_checked(buf).map_err(|e| e.to_string())?;
            dispatcher.state.cache.delete(&key, true).await;
            dispatcher.maybe_replicate(Mutation::Delete { key }).await;
            Ok(SubOutcome::Body(BytesMut::new()))
        }
        other => unreachable!("bulk_op_is_supported already filtered {other:?} out"),
    }
}

async fn run_bulk(dispatcher: &Dispatcher, buf: &mut Bytes) -> Result<BytesMut, String> {
    let count = decode_varuint(buf)?;
    let mut body = BytesMut::new();
    VarUint::new(count).encode(&mut body);

    for _ in 0..count {
        if buf.remaining() < 1 {
            return Err(WireError::Truncated.to_string());
        }
        let sub_op_byte = buf.get_u8();
        let sub_op = ClientOp::from_byte(sub_op_byte).map_err(|e| e.to_string())?;

        // An unsupported sub-op's payload has no length prefix of its own,
        // so the cursor can't be resynced past it: reject the whole
        // envelope rather than desync subsequent sub-requests (§9).
        if !bulk_op_is_supported(sub_op) {
            return Err(ConnectionError::UnsupportedBulkOp(sub_op).to_string());
        }

        match run_bulk_sub(dispatcher, sub_op, buf).await {
            Ok(SubOutcome::Body(sub_body)) => {
                body.put_u8(Status::Ok as u8);
                body.extend_from_slice(&sub_body);
            }
            Ok(SubOutcome::Failed(msg)) => {
                body.put_u8(Status::Error as u8);
                put_text(&mut body, &msg);
            }
            Err(fatal) => return Err(fatal),
        }
    }

    Ok(body)
}
