use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{GadgetError, Result};

fn window(buf: &[u8], offset: usize, needed: usize) -> Result<&[u8]> {
    offset
        .checked_add(needed)
        .and_then(|end| buf.get(offset..end))
        .ok_or(GadgetError::BufferTooShort {
            needed,
            offset,
            available: buf.len(),
        })
}

/// Decode an unsigned 16-bit integer at `offset`
///
/// # Errors
///
/// Returns [`GadgetError::BufferTooShort`] if fewer than 2 bytes remain at `offset`.
pub fn u16_le(buf: &[u8], offset: usize) -> Result<u16> {
    Ok(window(buf, offset, 2)?.get_u16_le())
}

/// Decode a signed 16-bit integer at `offset`
///
/// # Errors
///
/// Returns [`GadgetError::BufferTooShort`] if fewer than 2 bytes remain at `offset`.
pub fn i16_le(buf: &[u8], offset: usize) -> Result<i16> {
    Ok(window(buf, offset, 2)?.get_i16_le())
}

/// Decode an unsigned 32-bit integer at `offset`
///
/// # Errors
///
/// Returns [`GadgetError::BufferTooShort`] if fewer than 4 bytes remain at `offset`.
pub fn u32_le(buf: &[u8], offset: usize) -> Result<u32> {
    Ok(window(buf, offset, 4)?.get_u32_le())
}

/// Decode a signed 32-bit integer at `offset`
///
/// # Errors
///
/// Returns [`GadgetError::BufferTooShort`] if fewer than 4 bytes remain at `offset`.
pub fn i32_le(buf: &[u8], offset: usize) -> Result<i32> {
    Ok(window(buf, offset, 4)?.get_i32_le())
}

/// Decode an unsigned 64-bit integer at `offset`
///
/// # Errors
///
/// Returns [`GadgetError::BufferTooShort`] if fewer than 8 bytes remain at `offset`.
pub fn u64_le(buf: &[u8], offset: usize) -> Result<u64> {
    Ok(window(buf, offset, 8)?.get_u64_le())
}

/// Decode an IEEE-754 single precision float at `offset`
///
/// # Errors
///
/// Returns [`GadgetError::BufferTooShort`] if fewer than 4 bytes remain at `offset`.
pub fn f32_le(buf: &[u8], offset: usize) -> Result<f32> {
    Ok(window(buf, offset, 4)?.get_f32_le())
}

/// Encode an unsigned 16-bit integer
#[must_use]
pub fn encode_u16_le(value: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u16_le(value);
    buf.freeze()
}

/// Encode a signed 16-bit integer
#[must_use]
pub fn encode_i16_le(value: i16) -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_i16_le(value);
    buf.freeze()
}

/// Encode an unsigned 32-bit integer
#[must_use]
pub fn encode_u32_le(value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32_le(value);
    buf.freeze()
}

/// Encode a signed 32-bit integer
#[must_use]
pub fn encode_i32_le(value: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_i32_le(value);
    buf.freeze()
}

/// Encode an unsigned 64-bit integer
#[must_use]
pub fn encode_u64_le(value: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u64_le(value);
    buf.freeze()
}

/// Encode an IEEE-754 single precision float
#[must_use]
pub fn encode_f32_le(value: f32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_f32_le(value);
    buf.freeze()
}
