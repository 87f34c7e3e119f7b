//! Length-prefixed packet framing and the fixed-width/text primitives layered
//! on top of it.
//!
//! A packet on the wire is `[u32 big-endian payload length][payload]`. The
//! payload of a request/response packet always begins with a 1-byte
//! operation code and a 4-byte big-endian request id (`PacketHeader`).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::varint::VarUint;
use crate::WireError;

/// Length prefix width, in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Smallest payload the dispatcher will accept: 1 (opcode) + 4 (request id).
pub const MIN_PAYLOAD_LEN: usize = 5;

/// Header shared by every client and cluster packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub op: u8,
    pub request_id: u32,
}

impl PacketHeader {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.op);
        buf.put_u32(self.request_id);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < MIN_PAYLOAD_LEN {
            return Err(WireError::MalformedFrame);
        }
        let op = buf.get_u8();
        let request_id = buf.get_u32();
        Ok(PacketHeader { op, request_id })
    }
}

/// Prefix `payload` with its big-endian u32 length and return the full frame.
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(payload);
    out
}

pub fn put_text(buf: &mut impl BufMut, text: &str) {
    VarUint::new(text.len() as u64).encode(buf);
    buf.put_slice(text.as_bytes());
}

pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    VarUint::new(bytes.len() as u64).encode(buf);
    buf.put_slice(bytes);
}

pub fn get_text_checked(buf: &mut impl Buf) -> Result<String, WireError> {
    let raw = get_bytes_checked(buf)?;
    String::from_utf8(raw).map_err(|_| WireError::MalformedFrame)
}

pub fn get_bytes_checked(buf: &mut impl Buf) -> Result<Vec<u8>, WireError> {
    let len = VarUint::decode(buf).ok_or(WireError::Truncated)?.value() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// A presence byte (`0`/`1`) followed by `put_text` when present. Used for
/// the nullable `String`/`Bytes` value shapes (§3) on the wire.
pub fn put_optional_text(buf: &mut impl BufMut, text: Option<&str>) {
    match text {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_text(buf, s);
        }
    }
}

pub fn get_optional_text(buf: &mut impl Buf) -> Result<Option<String>, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Truncated);
    }
    match buf.get_u8() {
        0 => Ok(None),
        _ => Ok(Some(get_text_checked(buf)?)),
    }
}

pub fn put_optional_bytes(buf: &mut impl BufMut, bytes: Option<&[u8]>) {
    match bytes {
        None => buf.put_u8(0),
        Some(b) => {
            buf.put_u8(1);
            put_bytes(buf, b);
        }
    }
}

pub fn get_optional_bytes(buf: &mut impl Buf) -> Result<Option<Vec<u8>>, WireError> {
    if !buf.has_remaining() {
        return Err(WireError::Truncated);
    }
    match buf.get_u8() {
        0 => Ok(None),
        _ => Ok(Some(get_bytes_checked(buf)?)),
    }
}

/// Accumulates bytes read off a socket into complete payload frames.
///
/// Owns no I/O; `feed` is given newly-read bytes and `poll_frame` drains
/// completed frames. Used by the connection receive loop (§4.E).
#[derive(Default)]
pub struct FrameReader {
    buf: BytesMut,
    expected_len: Option<usize>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop one complete payload if enough bytes have been fed so far.
    /// Returns `Err` on a length prefix below [`MIN_PAYLOAD_LEN`].
    pub fn poll_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        loop {
            if self.expected_len.is_none() {
                if self.buf.len() < LENGTH_PREFIX_LEN {
                    return Ok(None);
                }
                let len = (&self.buf[..LENGTH_PREFIX_LEN]).get_u32() as usize;
                if len < MIN_PAYLOAD_LEN {
                    return Err(WireError::MalformedFrame);
                }
                self.buf.advance(LENGTH_PREFIX_LEN);
                self.expected_len = Some(len);
            }

            let len = self.expected_len.unwrap();
            if self.buf.len() < len {
                return Ok(None);
            }
            let payload = self.buf.split_to(len).freeze();
            self.expected_len = None;
            return Ok(Some(payload));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = PacketHeader {
            op: 7,
            request_id: 0xDEAD_BEEF,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        let mut read = buf.freeze();
        assert_eq!(PacketHeader::decode(&mut read).unwrap(), header);
    }

    #[test]
    fn text_round_trip() {
        let mut buf = BytesMut::new();
        put_text(&mut buf, "Mimoria");
        let mut read = buf.freeze();
        assert_eq!(get_text_checked(&mut read).unwrap(), "Mimoria");
    }

    #[test]
    fn frame_reader_assembles_single_frame_across_partial_feeds() {
        let payload = b"\x01\x00\x00\x00\x2Aextra";
        let frame = encode_frame(payload);

        let mut reader = FrameReader::new();
        assert!(reader.poll_frame().unwrap().is_none());

        reader.feed(&frame[..3]);
        assert!(reader.poll_frame().unwrap().is_none());

        reader.feed(&frame[3..]);
        let out = reader.poll_frame().unwrap().unwrap();
        assert_eq!(&out[..], payload);
        assert!(reader.poll_frame().unwrap().is_none());
    }

    #[test]
    fn frame_reader_assembles_back_to_back_frames() {
        let a = encode_frame(b"\x01\x00\x00\x00\x01a");
        let b = encode_frame(b"\x02\x00\x00\x00\x02b");

        let mut reader = FrameReader::new();
        reader.feed(&a);
        reader.feed(&b);

        let first = reader.poll_frame().unwrap().unwrap();
        assert_eq!(&first[..], &b"\x01\x00\x00\x00\x01a"[..]);
        let second = reader.poll_frame().unwrap().unwrap();
        assert_eq!(&second[..], &b"\x02\x00\x00\x00\x02b"[..]);
    }

    #[test]
    fn optional_text_round_trips_presence_and_absence() {
        let mut buf = BytesMut::new();
        put_optional_text(&mut buf, Some("Mimoria"));
        put_optional_text(&mut buf, None);
        let mut read = buf.freeze();
        assert_eq!(get_optional_text(&mut read).unwrap(), Some("Mimoria".to_string()));
        assert_eq!(get_optional_text(&mut read).unwrap(), None);
    }

    #[test]
    fn frame_reader_rejects_undersized_length_prefix() {
        let mut reader = FrameReader::new();
        reader.feed(&3u32.to_be_bytes());
        reader.feed(b"abc");
        assert!(matches!(
            reader.poll_frame(),
            Err(WireError::MalformedFrame)
        ));
    }
}
