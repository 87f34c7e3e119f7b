//! LEB128-style variable-length unsigned integer.
//!
//! Each byte carries 7 data bits, low-order group first; the high bit is a
//! continuation flag (set on every byte but the last).

use bytes::{Buf, BufMut};

/// An unsigned integer encoded in 1-10 bytes depending on magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarUint(u64);

impl VarUint {
    #[inline]
    pub fn new(val: u64) -> Self {
        VarUint(val)
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    /// Number of bytes this value encodes to.
    pub fn encoded_len(self) -> usize {
        let mut v = self.0;
        let mut len = 1;
        while v >= 0x80 {
            v >>= 7;
            len += 1;
        }
        len
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut v = self.0;
        loop {
            let byte = (v & 0x7F) as u8;
            v >>= 7;
            if v == 0 {
                buf.put_u8(byte);
                break;
            }
            buf.put_u8(byte | 0x80);
        }
    }

    /// Decode from a buffer. Returns `None` if the buffer ends before a
    /// terminating byte is found.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            if !buf.has_remaining() {
                return None;
            }
            let byte = buf.get_u8();
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Some(VarUint(result));
            }
            shift += 7;
            if shift >= 64 {
                return None;
            }
        }
    }
}

impl From<u64> for VarUint {
    fn from(v: u64) -> Self {
        VarUint(v)
    }
}

impl From<u32> for VarUint {
    fn from(v: u32) -> Self {
        VarUint(v as u64)
    }
}

impl From<usize> for VarUint {
    fn from(v: usize) -> Self {
        VarUint(v as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(val: u64) {
        let v = VarUint::new(val);
        let mut buf = BytesMut::new();
        v.encode(&mut buf);
        assert_eq!(buf.len(), v.encoded_len());
        let mut read = buf.freeze();
        let decoded = VarUint::decode(&mut read).unwrap();
        assert_eq!(decoded.value(), val);
    }

    #[test]
    fn round_trips_boundary_values() {
        for val in [0, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            round_trip(val);
        }
    }

    #[test]
    fn single_byte_for_small_values() {
        assert_eq!(VarUint::new(0).encoded_len(), 1);
        assert_eq!(VarUint::new(127).encoded_len(), 1);
        assert_eq!(VarUint::new(128).encoded_len(), 2);
    }

    #[test]
    fn decode_returns_none_on_truncated_input() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x80);
        let mut read = buf.freeze();
        assert!(VarUint::decode(&mut read).is_none());
    }
}
