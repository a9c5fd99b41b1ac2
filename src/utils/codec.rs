//! Network byte order conversions.
//!
//! Callers own the bounds: every function indexes `buf[at..at + width]` and
//! panics like a slice would when the buffer is too short.

use byteorder::{BigEndian, ByteOrder};

/// Widens a raw byte to its unsigned value.
#[must_use]
#[inline]
pub fn unsign(b: u8) -> u32 {
    u32::from(b)
}

#[must_use]
#[inline]
pub fn be_u32(buf: &[u8], at: usize) -> u32 {
    BigEndian::read_u32(&buf[at..at + 4])
}

#[must_use]
#[inline]
pub fn be_u16(buf: &[u8], at: usize) -> u16 {
    BigEndian::read_u16(&buf[at..at + 2])
}

/// Reads two bytes as a two's-complement value; `0x8000..=0xFFFF` come back
/// negative.
#[must_use]
#[inline]
pub fn be_i16(buf: &[u8], at: usize) -> i16 {
    BigEndian::read_i16(&buf[at..at + 2])
}

#[inline]
pub fn put_be_u32(buf: &mut [u8], at: usize, n: u32) {
    BigEndian::write_u32(&mut buf[at..at + 4], n);
}

#[inline]
pub fn put_be_u16(buf: &mut [u8], at: usize, n: u16) {
    BigEndian::write_u16(&mut buf[at..at + 2], n);
}
