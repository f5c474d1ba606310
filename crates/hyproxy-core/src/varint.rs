//! Variable-width non-negative integers (7-bit groups, little-endian order).
//!
//! Used for string lengths and collection counts. A value never needs more
//! than five bytes; a sixth continuation byte is a decode error.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::BufMut;

/// Maximum encoded width of a VarInt.
pub const MAX_LEN: usize = 5;

/// Append `value` to `buf`. Negative values are a caller bug and are clamped to 0.
pub fn write(buf: &mut impl BufMut, value: i32) {
    let mut v = value.max(0) as u32;
    while v & !0x7F != 0 {
        buf.put_u8((v & 0x7F) as u8 | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

/// Decode a VarInt at `pos`, returning `(value, bytes_consumed)`.
pub fn read(data: &[u8], pos: usize, field: &'static str) -> ProtocolResult<(i32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0;
    for i in 0..MAX_LEN {
        let b = *data.get(pos + i).ok_or(ProtocolError::BufferTooSmall {
            field,
            needed: pos + i + 1,
            available: data.len(),
        })?;
        value |= ((b & 0x7F) as u32) << shift;
        if b & 0x80 == 0 {
            return Ok((value as i32, i + 1));
        }
        shift += 7;
    }
    Err(ProtocolError::VarIntTooLong)
}

/// Number of bytes `value` occupies when encoded.
pub fn size(value: i32) -> usize {
    let v = value.max(0) as u32;
    match v {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}
