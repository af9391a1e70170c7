//! Low-level I/O primitives shared by all parsers.
//!
//! Each reader function reads exactly the bytes it promises or returns an
//! error - there is no partial-read ambiguity.

use std::io::Read;

use crate::{Error, Result};

/// Size of one media unit, the addressing granularity of NCA section
/// entries and XCI page addresses.
pub const MEDIA_UNIT: u64 = 0x200;

/// Convert a media-unit offset from an outer header to a byte offset.
///
/// Offsets inside section-local hash descriptors are already in bytes and
/// must not go through this.
#[inline]
pub fn media_to_bytes(units: u32) -> u64 {
    units as u64 * MEDIA_UNIT
}

/// Read one byte.
#[inline]
pub(crate) fn u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

/// Read a little-endian `u16`.
#[inline]
pub(crate) fn le_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

/// Read a little-endian `u32`.
#[inline]
pub(crate) fn le_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

/// Read a little-endian `u64`.
#[inline]
pub(crate) fn le_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

/// Read exactly `N` bytes into a fixed-size array.
#[inline]
pub(crate) fn bytesa<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut b = [0u8; N];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Read exactly `len` bytes into a `Vec`. The buffer grows with the bytes
/// actually read, so a bogus length from a header fails with
/// [`Error::UnexpectedEof`] instead of allocating it up front.
#[inline]
pub(crate) fn bytesv<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut b = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut b)?;
    if b.len() != len {
        return Err(Error::UnexpectedEof);
    }
    Ok(b)
}

/// Verify that the next `N` bytes in the stream match `expected`.
///
/// Returns [`Error::BadMagic`] on mismatch.
#[inline]
pub(crate) fn magic<R: Read, const N: usize>(r: &mut R, expected: &[u8; N]) -> Result<()> {
    let got = bytesa::<N>(r)?;
    if &got != expected {
        return Err(Error::BadMagic);
    }
    Ok(())
}

/// Extract a null-terminated UTF-8 string from a byte slice at `offset`.
///
/// Returns [`Error::OutOfRange`] if `offset` is out of bounds, or
/// [`Error::UnterminatedName`] if no null byte is found.
#[inline]
pub(crate) fn null_string(buf: &[u8], offset: usize) -> Result<String> {
    let slice = buf.get(offset..).ok_or(Error::OutOfRange {
        offset: offset as u64,
        len: 1,
        size: buf.len() as u64,
    })?;
    let end = slice
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::UnterminatedName)?;
    Ok(String::from_utf8_lossy(&slice[..end]).into_owned())
}

/// Copy `N` bytes out of `buf` at `offset`.
#[inline]
pub(crate) fn array_at<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N]> {
    buf.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(Error::UnexpectedEof)
}

/// Little-endian `u32` at `offset` of a byte slice.
#[inline]
pub(crate) fn le_u32_at(buf: &[u8], offset: usize) -> Result<u32> {
    array_at::<4>(buf, offset).map(u32::from_le_bytes)
}

/// Little-endian `u64` at `offset` of a byte slice.
#[inline]
pub(crate) fn le_u64_at(buf: &[u8], offset: usize) -> Result<u64> {
    array_at::<8>(buf, offset).map(u64::from_le_bytes)
}

/// Returns true if every byte is zero.
#[inline]
pub(crate) fn is_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Decode a hex string into exactly `N` bytes.
///
/// Returns `None` if the string is not valid hex or has the wrong length.
pub(crate) fn decode_hex_n<const N: usize>(s: &str) -> Option<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(s.trim(), &mut out).ok()?;
    Some(out)
}
