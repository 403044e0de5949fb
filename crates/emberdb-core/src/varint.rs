//! Variable-length integer encoding.
//!
//! Metric batches carry many small integers (tag counts, field counts, short
//! strings, timestamps that are deltas in practice), so the wire codec uses
//! LEB128 varints with ZigZag for signed values. Decoding is fully fallible:
//! payloads come off disk and off the network, and a truncated or overlong
//! varint is an [`Error`], never a panic.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Encode an unsigned integer, 7 bits per byte, low bits first.
pub fn encode_u64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encode a signed integer with ZigZag mapping (-1 → 1, 1 → 2, ...).
pub fn encode_i64(buf: &mut impl BufMut, value: i64) {
    encode_u64(buf, ((value << 1) ^ (value >> 63)) as u64);
}

/// Decode an unsigned varint.
pub fn decode_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(Error::UnexpectedEof);
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(Error::VarintOverflow);
        }
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::VarintOverflow);
        }
    }
}

/// Decode a ZigZag-encoded signed varint.
pub fn decode_i64(buf: &mut impl Buf) -> Result<i64> {
    let unsigned = decode_u64(buf)?;
    let value = (unsigned >> 1) as i64;
    Ok(if unsigned & 1 != 0 { !value } else { value })
}

/// Encode a length-prefixed UTF-8 string.
pub fn encode_str(buf: &mut impl BufMut, s: &str) {
    encode_u64(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

/// Decode a length-prefixed UTF-8 string.
pub fn decode_str(buf: &mut impl Buf) -> Result<String> {
    let len = decode_u64(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::UnexpectedEof);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| Error::InvalidUtf8)
}
